//! Transport adapters.
//!
//! The property framework only needs the small [`Adapter`] contract: write a
//! command string, read a reply string, read a fixed number of bytes. Anything
//! transport specific (terminations, baud rates, VISA sessions) lives behind
//! it. Instruments and their channels hold the same [`SharedAdapter`] so a
//! channel talks over its parent's connection.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PropError, Result};

#[cfg(feature = "instrument_serial")]
pub mod serial;
#[cfg(feature = "instrument_serial")]
pub use serial::SerialAdapter;

/// Blocking request/response transport.
pub trait Adapter: Send {
    /// Send one command. Terminations are the adapter's business.
    fn write(&mut self, command: &str) -> Result<()>;

    /// Read one reply, without its termination.
    fn read(&mut self) -> Result<String>;

    /// Read exactly `count` raw bytes.
    fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>>;

    /// Send raw bytes. The default accepts UTF-8 payloads only.
    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(data).map_err(|_| PropError::Unsupported("binary writes"))?;
        self.write(text)
    }

    /// Discard pending input and output.
    fn clear(&mut self) -> Result<()> {
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Err(PropError::Unsupported("timeout"))
    }

    /// Fire a hardware trigger (GPIB GET and the like).
    fn assert_trigger(&mut self) -> Result<()> {
        Err(PropError::Unsupported("assert_trigger"))
    }

    /// Short human readable description for logs
    fn info(&self) -> String {
        "adapter".to_string()
    }
}

/// Adapter handle shared between an instrument and its channels.
pub type SharedAdapter = Arc<Mutex<Box<dyn Adapter>>>;

/// Wrap an adapter so it can be shared.
pub fn share(adapter: impl Adapter + 'static) -> SharedAdapter {
    Arc::new(Mutex::new(Box::new(adapter)))
}
