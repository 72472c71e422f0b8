//! Error types for the VTK driver.
//!
//! Validation problems are caught before any byte reaches the terminal;
//! everything else is produced by a protocol session and handed to the
//! caller unchanged.

use thiserror::Error;

/// The charge request was rejected before touching the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown ISO 4217 currency code {0}")]
    UnknownCurrency(u16),

    #[error("decimal amount {decimal} exceeds {max} for currency {currency}")]
    DecimalOutOfRange { currency: u16, decimal: u64, max: u64 },

    #[error("charge amount must be greater than zero")]
    ZeroAmount,

    #[error("charge amount does not fit in minor units")]
    AmountOverflow,

    #[error("timeout of {0:?} is too large")]
    TimeoutOutOfRange(std::time::Duration),
}

/// Connection-level failure on the link to the terminal.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("TCP connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// A message could not be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("encoded message body of {0} bytes exceeds the 65535 byte frame limit")]
    TooLong(usize),

    #[error("unsupported protocol '{0}'. Supported: vendotek")]
    UnsupportedProtocol(String),
}

/// Configuration could not be loaded or is unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Caller-facing failure of a charge or ping.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid charge request: {0}")]
    Validation(#[from] ValidationError),

    #[error("could not reach terminal: {0}")]
    Transport(#[from] TransportError),

    #[error("no response from terminal in time")]
    TimedOut,

    #[error("terminal sent a malformed response ({} bytes)", .raw.len())]
    Malformed { raw: Vec<u8> },

    #[error("terminal declined the charge: {reason}")]
    Declined { reason: String },

    #[error("terminal reported error {code}")]
    DeviceError { code: String },

    #[error("could not encode request: {0}")]
    Codec(#[from] CodecError),
}

impl DriverError {
    /// Process exit code used by the `vtk-charge` binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            DriverError::Validation(_) => 254,
            DriverError::Declined { .. } => 1,
            DriverError::DeviceError { .. } => 2,
            DriverError::Transport(_) => 3,
            DriverError::TimedOut => 4,
            DriverError::Malformed { .. } => 5,
            DriverError::Codec(_) => 254,
        }
    }

    /// Whether the link may still carry bytes from this exchange. The
    /// caller should expect the next request to drain first, or reconnect.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            DriverError::Transport(_) | DriverError::TimedOut | DriverError::Malformed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinguish_operator_actions() {
        let declined = DriverError::Declined {
            reason: "insufficient funds".into(),
        };
        let unreachable = DriverError::Transport(TransportError::Closed);
        let timed_out = DriverError::TimedOut;
        assert_eq!(declined.exit_code(), 1);
        assert_eq!(unreachable.exit_code(), 3);
        assert_eq!(timed_out.exit_code(), 4);
        assert_eq!(
            DriverError::Validation(ValidationError::ZeroAmount).exit_code(),
            254
        );
    }

    #[test]
    fn test_requires_resync() {
        assert!(DriverError::TimedOut.requires_resync());
        assert!(DriverError::Malformed { raw: vec![1] }.requires_resync());
        assert!(!DriverError::Declined { reason: "x".into() }.requires_resync());
        assert!(!DriverError::Validation(ValidationError::ZeroAmount).requires_resync());
    }

    #[test]
    fn test_declined_message_carries_reason() {
        let e = DriverError::Declined {
            reason: "insufficient funds".into(),
        };
        assert!(e.to_string().contains("insufficient funds"));
    }
}
