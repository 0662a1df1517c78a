use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The frame was not valid UTF-8 JSON.
    #[error("failed to decode command frame: {0}")]
    Decode(#[from] serde_json::Error),

    /// Well-formed JSON that does not describe a known command.
    #[error("protocol error: {reason}")]
    Protocol {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A client could not reach the control socket.
    #[error("cannot connect to control socket {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Error::Timeout { operation, timeout }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_message() {
        let err = Error::protocol("unknown command `Nope`");
        assert_eq!(err.to_string(), "protocol error: unknown command `Nope`");
    }

    #[test]
    fn test_timeout_is_detected() {
        let err = Error::timeout("wait_stop", Duration::from_millis(250));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("wait_stop"));
        assert!(!Error::protocol("x").is_timeout());
    }

    #[test]
    fn test_connect_error_keeps_path() {
        let err = Error::Connect {
            path: PathBuf::from("/tmp/missing.sock"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("/tmp/missing.sock"));
    }
}
