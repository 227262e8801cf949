//! SCPI common commands and device error queues.
//!
//! [`ErrorCheck`] is the per-driver policy that `check_set_errors`,
//! `check_get_errors` and [`Instrument::check_errors`] run. The [`Scpi`]
//! trait adds the IEEE 488.2 common commands to instruments whose driver is
//! declared `scpi`.

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::adapters::{Adapter, SharedAdapter};
use crate::error::{PropError, Result};
use crate::instrument::Instrument;

/// Signature of a driver-specific error check.
pub type ErrorCheckFn = Arc<dyn Fn(&mut dyn Adapter) -> Result<()> + Send + Sync>;

/// How an instrument asks the device for errors.
#[derive(Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorCheck {
    /// Never query; error checks always pass
    #[default]
    None,
    /// Query `command` until it reports code 0, at most `max_reads` times
    ScpiQueue {
        #[serde(default = "default_error_command")]
        command: String,
        #[serde(default = "default_max_reads")]
        max_reads: usize,
    },
    #[serde(skip)]
    Custom(ErrorCheckFn),
}

fn default_error_command() -> String {
    "SYST:ERR?".to_string()
}

fn default_max_reads() -> usize {
    10
}

impl ErrorCheck {
    /// The standard `SYST:ERR?` queue.
    pub fn scpi() -> Self {
        ErrorCheck::ScpiQueue {
            command: default_error_command(),
            max_reads: default_max_reads(),
        }
    }

    /// Run `f` on the locked adapter.
    pub fn custom(f: impl Fn(&mut dyn Adapter) -> Result<()> + Send + Sync + 'static) -> Self {
        ErrorCheck::Custom(Arc::new(f))
    }

    /// Run the check, failing with [`PropError::Device`] if errors are pending.
    pub fn run(&self, adapter: &SharedAdapter) -> Result<()> {
        match self {
            ErrorCheck::None => Ok(()),
            ErrorCheck::ScpiQueue { command, max_reads } => {
                let mut adapter = adapter.lock();
                let mut errors = Vec::new();
                for _ in 0..*max_reads {
                    adapter.write(command)?;
                    let (code, message) = parse_error_reply(&adapter.read()?)?;
                    if code == 0 {
                        break;
                    }
                    warn!(code, message = %message, "device reported error");
                    errors.push((code, message));
                }
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(PropError::Device { errors })
                }
            }
            ErrorCheck::Custom(f) => {
                let mut adapter = adapter.lock();
                f(&mut **adapter)
            }
        }
    }
}

impl fmt::Debug for ErrorCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCheck::None => write!(f, "None"),
            ErrorCheck::ScpiQueue { command, max_reads } => f
                .debug_struct("ScpiQueue")
                .field("command", command)
                .field("max_reads", max_reads)
                .finish(),
            ErrorCheck::Custom(_) => write!(f, "Custom(<function>)"),
        }
    }
}

/// Split a `SYST:ERR?` reply like `-113,"Undefined header"`.
pub fn parse_error_reply(reply: &str) -> Result<(i64, String)> {
    let reply = reply.trim();
    let (code, message) = reply.split_once(',').unwrap_or((reply, ""));
    let code = code.trim().parse::<i64>().map_err(|e| PropError::Parse {
        reply: reply.to_string(),
        reason: format!("error code: {e}"),
    })?;
    Ok((code, message.trim().trim_matches('"').to_string()))
}

/// IEEE 488.2 common commands.
pub trait Scpi {
    /// `*IDN?`
    fn id(&self) -> Result<String>;
    /// `*CLS`
    fn clear_status(&self) -> Result<()>;
    /// `*RST`
    fn reset(&self) -> Result<()>;
    /// `*STB?`
    fn status(&self) -> Result<i64>;
    /// `*OPC?`, true once pending operations are complete
    fn complete(&self) -> Result<bool>;
    /// `*OPT?`
    fn options(&self) -> Result<Vec<String>>;
    /// One entry of the `SYST:ERR?` queue
    fn next_error(&self) -> Result<(i64, String)>;
}

impl Instrument {
    fn require_scpi(&self) -> Result<()> {
        if self.is_scpi() {
            Ok(())
        } else {
            Err(PropError::Unsupported("SCPI commands on a non-SCPI driver"))
        }
    }

    fn scpi_number(&self, command: &str) -> Result<i64> {
        self.require_scpi()?;
        let reply = self.ask(command)?;
        reply.trim().parse::<i64>().map_err(|e| PropError::Parse {
            reply,
            reason: e.to_string(),
        })
    }
}

impl Scpi for Instrument {
    fn id(&self) -> Result<String> {
        self.require_scpi()?;
        Ok(self.ask("*IDN?")?.trim().to_string())
    }

    fn clear_status(&self) -> Result<()> {
        self.require_scpi()?;
        self.write("*CLS")
    }

    fn reset(&self) -> Result<()> {
        self.require_scpi()?;
        debug!(instrument = %self.name(), "reset");
        self.write("*RST")
    }

    fn status(&self) -> Result<i64> {
        self.scpi_number("*STB?")
    }

    fn complete(&self) -> Result<bool> {
        Ok(self.scpi_number("*OPC?")? == 1)
    }

    fn options(&self) -> Result<Vec<String>> {
        self.require_scpi()?;
        Ok(self
            .ask("*OPT?")?
            .split(',')
            .map(|o| o.trim().trim_matches('"').to_string())
            .filter(|o| !o.is_empty() && o != "0")
            .collect())
    }

    fn next_error(&self) -> Result<(i64, String)> {
        self.require_scpi()?;
        parse_error_reply(&self.ask("SYST:ERR?")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::share;
    use crate::testing::ProtocolAdapter;
    use tracing_test::traced_test;

    #[test]
    fn error_reply_parsing() {
        assert_eq!(
            parse_error_reply("-113,\"Undefined header\"\n").unwrap(),
            (-113, "Undefined header".to_string())
        );
        assert_eq!(parse_error_reply("+0,\"No error\"").unwrap().0, 0);
        assert!(parse_error_reply("garbage").is_err());
    }

    #[test]
    #[traced_test]
    fn queue_is_drained_until_zero() {
        let adapter = share(ProtocolAdapter::new([
            ("SYST:ERR?", "-222,\"Data out of range\""),
            ("SYST:ERR?", "-113,\"Undefined header\""),
            ("SYST:ERR?", "0,\"No error\""),
        ]));
        match ErrorCheck::scpi().run(&adapter) {
            Err(PropError::Device { errors }) => {
                assert_eq!(errors.len(), 2);
                assert_eq!(errors[0].0, -222);
            }
            other => panic!("expected device error, got {other:?}"),
        }
        assert!(logs_contain("device reported error"));
    }

    #[test]
    fn empty_queue_passes() {
        let adapter = share(ProtocolAdapter::new([("SYST:ERR?", "0,\"No error\"")]));
        assert!(ErrorCheck::scpi().run(&adapter).is_ok());
    }

    #[test]
    fn max_reads_bounds_the_queue() {
        let check = ErrorCheck::ScpiQueue {
            command: "ERR?".into(),
            max_reads: 1,
        };
        let adapter = share(ProtocolAdapter::new([("ERR?", "5,busy")]));
        let err = check.run(&adapter).unwrap_err();
        assert!(matches!(err, PropError::Device { ref errors } if errors.len() == 1));
    }

    #[test]
    fn error_check_deserializes_from_toml() {
        let check: ErrorCheck = toml::from_str("kind = \"scpi_queue\"").unwrap();
        assert!(matches!(check, ErrorCheck::ScpiQueue { max_reads: 10, .. }));
    }
}
