//! Serial port adapter built on `serialport`.
use serialport::{ClearBuffer, SerialPort};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::Adapter;
use crate::config::SerialSettings;
use crate::error::{PropError, Result};

/// Poll interval of the underlying port while waiting for a reply.
const PORT_POLL: Duration = Duration::from_millis(100);

/// [`Adapter`] over a serial port.
///
/// Bytes that arrive past the end of a reply are kept and served to the next
/// `read` or `read_bytes`.
pub struct SerialAdapter {
    port: Box<dyn SerialPort>,
    write_termination: String,
    read_termination: String,
    timeout: Duration,
    pending: Vec<u8>,
}

impl SerialAdapter {
    /// Wrap an already opened port with `\n` terminations and a 1 s timeout.
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            write_termination: "\n".to_string(),
            read_termination: "\n".to_string(),
            timeout: Duration::from_secs(1),
            pending: Vec::new(),
        }
    }

    /// Open the port described by `settings`.
    pub fn open(settings: &SerialSettings) -> Result<Self> {
        let port = serialport::new(&settings.port, settings.baud_rate)
            .timeout(PORT_POLL)
            .open()
            .map_err(std::io::Error::from)?;
        debug!(port = %settings.port, baud = settings.baud_rate, "opened serial port");
        Ok(Self::new(port)
            .with_terminations(&settings.write_termination, &settings.read_termination)
            .with_timeout(Duration::from_millis(settings.timeout_ms)))
    }

    /// Terminations appended to writes and expected at the end of replies.
    pub fn with_terminations(mut self, write: &str, read: &str) -> Self {
        self.write_termination = write.to_string();
        self.read_termination = read.to_string();
        self
    }

    /// Give up on a reply after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Append whatever the port delivers next to `pending`.
    fn fill(&mut self, start: Instant) -> Result<()> {
        if start.elapsed() >= self.timeout {
            return Err(PropError::Timeout(self.timeout));
        }
        let mut chunk = [0u8; 256];
        match self.port.read(&mut chunk) {
            Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// Split the first terminated line off `pending`, without its termination.
fn take_line(pending: &mut Vec<u8>, termination: &[u8]) -> Option<Vec<u8>> {
    let at = pending
        .windows(termination.len())
        .position(|window| window == termination)?;
    let mut line: Vec<u8> = pending.drain(..at + termination.len()).collect();
    line.truncate(at);
    Some(line)
}

impl Adapter for SerialAdapter {
    fn write(&mut self, command: &str) -> Result<()> {
        let framed = format!("{}{}", command, self.write_termination);
        trace!("serial write '{}'", framed.escape_default());
        self.port.write_all(framed.as_bytes())?;
        Ok(())
    }

    fn read(&mut self) -> Result<String> {
        if self.read_termination.is_empty() {
            return Err(PropError::Unsupported("reads without a read termination"));
        }
        let termination = self.read_termination.clone().into_bytes();
        let start = Instant::now();
        let line = loop {
            if let Some(line) = take_line(&mut self.pending, &termination) {
                break line;
            }
            self.fill(start)?;
        };
        let reply = String::from_utf8_lossy(&line).into_owned();
        trace!("serial read '{}'", reply.escape_default());
        Ok(reply)
    }

    fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let start = Instant::now();
        while self.pending.len() < count {
            self.fill(start)?;
        }
        Ok(self.pending.drain(..count).collect())
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.pending.clear();
        self.port
            .clear(ClearBuffer::All)
            .map_err(std::io::Error::from)?;
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn info(&self) -> String {
        format!(
            "SerialAdapter ({})",
            self.port.name().unwrap_or_else(|| "unnamed".to_string())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_at_the_first_termination() {
        let mut pending = b"1.5\r\n2.5\r\n3".to_vec();
        assert_eq!(take_line(&mut pending, b"\r\n"), Some(b"1.5".to_vec()));
        assert_eq!(take_line(&mut pending, b"\r\n"), Some(b"2.5".to_vec()));
        assert_eq!(take_line(&mut pending, b"\r\n"), None);
        assert_eq!(pending, b"3");
    }

    #[cfg(unix)]
    fn loopback() -> (SerialAdapter, serialport::TTYPort) {
        let (mut ours, peer) = serialport::TTYPort::pair().unwrap();
        ours.set_timeout(Duration::from_millis(10)).unwrap();
        let adapter = SerialAdapter::new(Box::new(ours)).with_timeout(Duration::from_millis(500));
        (adapter, peer)
    }

    #[cfg(unix)]
    #[test]
    fn replies_arriving_together_are_read_one_by_one() {
        let (mut adapter, mut peer) = loopback();
        peer.write_all(b"1.5\n2.5\n").unwrap();
        peer.flush().unwrap();
        assert_eq!(adapter.read().unwrap(), "1.5");
        assert_eq!(adapter.read().unwrap(), "2.5");
        assert!(matches!(adapter.read(), Err(PropError::Timeout(_))));
    }

    #[cfg(unix)]
    #[test]
    fn block_header_is_read_in_pieces() {
        let (mut adapter, mut peer) = loopback();
        peer.write_all(b"#14abcd\n").unwrap();
        peer.flush().unwrap();
        assert_eq!(adapter.read_bytes(2).unwrap(), b"#1");
        assert_eq!(adapter.read_bytes(1).unwrap(), b"4");
        assert_eq!(adapter.read_bytes(4).unwrap(), b"abcd");
        assert_eq!(adapter.read().unwrap(), "");
    }
}
