//! Custom error types for the property framework.
//!
//! This module defines [`PropError`], the single error type returned by every
//! fallible operation in the crate. It is built with `thiserror` and groups the
//! failure modes an instrument property can run into:
//!
//! - **`Validation`**: a candidate value is outside its declared domain. This is
//!   the equivalent of a `ValueError` and is always raised before any I/O.
//! - **`Declaration`**: a property, value map or channel group was declared in an
//!   inconsistent way (duplicate wire tokens, a range validator given a set, ...).
//!   These surface when a driver is built, never during an access.
//! - **`Protocol`**: the device answered something the driver cannot accept, or a
//!   scripted test exchange did not match.
//! - **`Device`**: the instrument's own error queue reported faults after an
//!   access with error checking enabled.
//! - **`Io`** / **`Timeout`**: adapter failures. They propagate unmodified, no
//!   retry is attempted anywhere in the crate.
//!
//! By using `#[from]`, `PropError` can be created from the underlying I/O,
//! configuration and TOML errors with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, PropError>;

#[derive(Error, Debug)]
pub enum PropError {
    #[error("Value error: {0}")]
    Validation(String),

    #[error("Invalid declaration: {0}")]
    Declaration(String),

    #[error("Could not parse reply '{reply}': {reason}")]
    Parse { reply: String, reason: String },

    #[error("Type error: expected {expected}, got {found}")]
    Type { expected: &'static str, found: String },

    #[error("Format error: {0}")]
    Format(String),

    #[error("Unresolved template token '{{{token}}}' in '{template}'")]
    Template { token: String, template: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device reported errors: {}", format_device_errors(.errors))]
    Device { errors: Vec<(i64, String)> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for a reply after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Operation not supported by this adapter: {0}")]
    Unsupported(&'static str),

    #[error("Unknown property '{0}'")]
    UnknownProperty(String),

    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("Property '{0}' is read-only")]
    ReadOnly(String),

    #[error("Property '{0}' is write-only")]
    WriteOnly(String),

    #[error("Property '{0}' is not dynamic, its values cannot be overridden")]
    NotDynamic(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<figment::Error> for PropError {
    fn from(value: figment::Error) -> Self {
        PropError::Config(Box::new(value))
    }
}

impl From<evalexpr::EvalexprError> for PropError {
    fn from(value: evalexpr::EvalexprError) -> Self {
        PropError::Expression(value.to_string())
    }
}

fn format_device_errors(errors: &[(i64, String)]) -> String {
    errors
        .iter()
        .map(|(code, message)| format!("{code}, \"{message}\""))
        .collect::<Vec<_>>()
        .join("; ")
}

impl PropError {
    /// Returns `true` for errors raised by a domain check, before any I/O.
    pub fn is_validation(&self) -> bool {
        matches!(self, PropError::Validation(_))
    }

    pub(crate) fn type_error(expected: &'static str, found: impl std::fmt::Debug) -> Self {
        PropError::Type {
            expected,
            found: format!("{found:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_are_listed_in_message() {
        let err = PropError::Device {
            errors: vec![
                (-222, "Data out of range".to_string()),
                (-113, "Undefined header".to_string()),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("-222, \"Data out of range\""));
        assert!(message.contains("-113, \"Undefined header\""));
    }

    #[test]
    fn io_errors_convert_unmodified() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "cable pulled");
        let err: PropError = io.into();
        match err {
            PropError::Io(inner) => assert_eq!(inner.kind(), std::io::ErrorKind::BrokenPipe),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn template_error_shows_braced_token() {
        let err = PropError::Template {
            token: "function".into(),
            template: ":{function}:RANG?".into(),
        };
        assert!(err.to_string().contains("'{function}'"));
    }
}
