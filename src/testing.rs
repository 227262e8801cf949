//! Scripted adapter for protocol tests.
//!
//! [`ProtocolAdapter`] replays a list of expected exchanges: every write must
//! match the next scripted command and every read returns the scripted
//! response. [`expected_protocol`] wires it to an instrument, runs a test body
//! and then asserts that the whole script was consumed.
//!
//! ```
//! use daq_props::prelude::*;
//! use daq_props::testing::expected_protocol;
//!
//! let driver = Driver::builder("Meter")
//!     .property(Property::measurement("reading", "READ?", "").build()?)
//!     .build()?;
//! expected_protocol(&driver, [("READ?", "42")], |meter| {
//!     assert_eq!(meter.get("reading").unwrap(), Value::Float(42.0));
//! });
//! # Ok::<(), PropError>(())
//! ```

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::Adapter;
use crate::error::{PropError, Result};
use crate::instrument::{Driver, Instrument};

/// One scripted step: a command to expect, a response to hand out, or both.
#[derive(Clone, PartialEq, Eq)]
pub struct Exchange {
    command: Option<Vec<u8>>,
    response: Option<Vec<u8>>,
}

impl Exchange {
    /// Expect `command`, then answer `response`.
    pub fn ask(command: &str, response: &str) -> Self {
        Self {
            command: Some(command.as_bytes().to_vec()),
            response: Some(response.as_bytes().to_vec()),
        }
    }

    /// Expect `command` with no reply.
    pub fn write(command: &str) -> Self {
        Self {
            command: Some(command.as_bytes().to_vec()),
            response: None,
        }
    }

    /// Answer a read that is not preceded by a write.
    pub fn read(response: &str) -> Self {
        Self {
            command: None,
            response: Some(response.as_bytes().to_vec()),
        }
    }

    /// Expect raw `command` bytes, then answer raw `response` bytes.
    pub fn bytes(command: Option<&[u8]>, response: Option<&[u8]>) -> Self {
        Self {
            command: command.map(<[u8]>::to_vec),
            response: response.map(<[u8]>::to_vec),
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |b: &Option<Vec<u8>>| b.as_ref().map(|b| String::from_utf8_lossy(b).into_owned());
        f.debug_tuple("Exchange")
            .field(&show(&self.command))
            .field(&show(&self.response))
            .finish()
    }
}

impl From<(&str, &str)> for Exchange {
    fn from((command, response): (&str, &str)) -> Self {
        Exchange::ask(command, response)
    }
}

impl From<(&str, Option<&str>)> for Exchange {
    fn from((command, response): (&str, Option<&str>)) -> Self {
        Exchange::bytes(Some(command.as_bytes()), response.map(str::as_bytes))
    }
}

impl From<(Option<&str>, Option<&str>)> for Exchange {
    fn from((command, response): (Option<&str>, Option<&str>)) -> Self {
        Exchange::bytes(command.map(str::as_bytes), response.map(str::as_bytes))
    }
}

#[derive(Default)]
struct Script {
    pairs: VecDeque<Exchange>,
    pending: Option<Vec<u8>>,
    timeout: Option<Duration>,
    calls: Vec<String>,
}

impl Script {
    /// Response bytes for a read: the pending reply, or the next read-only step.
    fn take_response(&mut self) -> Result<Vec<u8>> {
        if let Some(pending) = self.pending.take() {
            return Ok(pending);
        }
        match self.pairs.pop_front() {
            Some(Exchange {
                command: None,
                response: Some(response),
            }) => Ok(response),
            Some(step) => {
                let err = PropError::Protocol(format!("read attempted, but next step is {step:?}"));
                self.pairs.push_front(step);
                Err(err)
            }
            None => Err(PropError::Protocol("read attempted after the script ended".into())),
        }
    }
}

/// Adapter that replays a scripted conversation.
///
/// Clones share the script, so keep one to inspect it after handing the
/// adapter to an instrument.
#[derive(Clone, Default)]
pub struct ProtocolAdapter {
    script: Arc<Mutex<Script>>,
}

impl ProtocolAdapter {
    /// Script of exchanges, replayed in order.
    pub fn new<E: Into<Exchange>>(comm_pairs: impl IntoIterator<Item = E>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                pairs: comm_pairs.into_iter().map(Into::into).collect(),
                ..Script::default()
            })),
        }
    }

    /// Start with a connection timeout set.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.script.lock().timeout = Some(timeout);
        self
    }

    /// Steps not yet consumed.
    pub fn remaining(&self) -> Vec<Exchange> {
        self.script.lock().pairs.iter().cloned().collect()
    }

    /// True once every step ran and no response is left unread.
    pub fn is_exhausted(&self) -> bool {
        let script = self.script.lock();
        script.pairs.is_empty() && script.pending.is_none()
    }

    /// Connection methods called so far, e.g. `["clear", "set_timeout(2s)"]`.
    pub fn connection_calls(&self) -> Vec<String> {
        self.script.lock().calls.clone()
    }

    /// Panic if any scripted step was not consumed.
    #[allow(clippy::panic)]
    pub fn assert_exhausted(&self) {
        let script = self.script.lock();
        if let Some(pending) = &script.pending {
            panic!(
                "unread response left: {:?}",
                String::from_utf8_lossy(pending)
            );
        }
        if !script.pairs.is_empty() {
            panic!("unconsumed exchanges left: {:?}", script.pairs);
        }
    }

    fn record(&self, call: String) {
        self.script.lock().calls.push(call);
    }
}

impl Adapter for ProtocolAdapter {
    fn write(&mut self, command: &str) -> Result<()> {
        self.write_bytes(command.as_bytes())
    }

    fn read(&mut self) -> Result<String> {
        let response = self.script.lock().take_response()?;
        String::from_utf8(response).map_err(|e| PropError::Protocol(e.to_string()))
    }

    fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut script = self.script.lock();
        let mut data = script.take_response()?;
        if data.len() < count {
            return Err(PropError::Protocol(format!(
                "{count} bytes requested, only {} scripted",
                data.len()
            )));
        }
        let rest = data.split_off(count);
        if !rest.is_empty() {
            script.pending = Some(rest);
        }
        Ok(data)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let mut script = self.script.lock();
        let shown = String::from_utf8_lossy(data);
        if let Some(pending) = &script.pending {
            return Err(PropError::Protocol(format!(
                "wrote {shown:?} while response {:?} is unread",
                String::from_utf8_lossy(pending)
            )));
        }
        let step = script
            .pairs
            .pop_front()
            .ok_or_else(|| PropError::Protocol(format!("unexpected write {shown:?} after the script ended")))?;
        match &step.command {
            Some(expected) if expected == data => {
                script.pending = step.response;
                Ok(())
            }
            _ => {
                let err = PropError::Protocol(format!("wrote {shown:?}, expected {step:?}"));
                script.pairs.push_front(step);
                Err(err)
            }
        }
    }

    fn clear(&mut self) -> Result<()> {
        self.record("clear".into());
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.script.lock().timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.record(format!("set_timeout({timeout:?})"));
        self.script.lock().timeout = Some(timeout);
        Ok(())
    }

    fn assert_trigger(&mut self) -> Result<()> {
        self.record("assert_trigger".into());
        Ok(())
    }

    fn info(&self) -> String {
        "ProtocolAdapter".to_string()
    }
}

/// Build an instrument on a scripted adapter, run `body`, then assert that
/// the script was consumed completely.
pub fn expected_protocol<E, R>(
    driver: &Driver,
    comm_pairs: impl IntoIterator<Item = E>,
    body: impl FnOnce(&mut Instrument) -> R,
) -> R
where
    E: Into<Exchange>,
{
    expected_protocol_with(driver, ProtocolAdapter::new(comm_pairs), body)
}

/// Like [`expected_protocol`] with a prepared adapter, e.g. one carrying a timeout.
pub fn expected_protocol_with<R>(
    driver: &Driver,
    adapter: ProtocolAdapter,
    body: impl FnOnce(&mut Instrument) -> R,
) -> R {
    let script = adapter.clone();
    let mut instrument = Instrument::new(driver, adapter);
    let result = body(&mut instrument);
    script.assert_exhausted();
    result
}
