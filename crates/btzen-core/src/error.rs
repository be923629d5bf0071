// ── Core error types ──
//
// Device-level errors. Consumers see connection, read and write failures
// per device, never raw bus replies. The `From<btzen_bus::Error>` impl
// translates bus-layer errors into these variants.

use btzen_bus::CancelReason;
use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Wire ─────────────────────────────────────────────────────────
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to {mac}: {reason}")]
    Connection { mac: String, reason: String },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Cannot read data from {device}: {reason}")]
    DataRead { device: String, reason: String },

    #[error("Cannot write data to {device}: {reason}")]
    DataWrite { device: String, reason: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    // ── Cancellation ─────────────────────────────────────────────────
    /// Timeout, disconnection or a closed session. Read loops treat this
    /// as "try again later".
    #[error("Operation cancelled ({reason})")]
    Cancelled { reason: CancelReason },

    // ── Bus errors (wrapped) ─────────────────────────────────────────
    #[error("Bus error: {0}")]
    Bus(btzen_bus::Error),
}

impl CoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Cancellations and connection failures; both clear up once the
    /// device is connected again.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Connection { .. })
    }

    pub(crate) fn connection(mac: impl ToString, reason: impl ToString) -> Self {
        Self::Connection {
            mac: mac.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn closed() -> Self {
        Self::Cancelled {
            reason: CancelReason::Closed,
        }
    }
}

// ── Conversion from bus-layer errors ─────────────────────────────────

impl From<btzen_bus::Error> for CoreError {
    fn from(err: btzen_bus::Error) -> Self {
        match err {
            btzen_bus::Error::Cancelled(reason) => Self::Cancelled { reason },
            btzen_bus::Error::Protocol(message) => Self::Protocol { message },
            e @ btzen_bus::Error::TypeMismatch { .. } => Self::Protocol {
                message: e.to_string(),
            },
            other => Self::Bus(other),
        }
    }
}

/// Map a failed characteristic read, keeping cancellations intact.
pub(crate) fn read_error(device: impl ToString, err: btzen_bus::Error) -> CoreError {
    match err {
        btzen_bus::Error::MethodError { .. } | btzen_bus::Error::Io(_) => CoreError::DataRead {
            device: device.to_string(),
            reason: err.to_string(),
        },
        other => other.into(),
    }
}

/// Map a failed characteristic write, keeping cancellations intact.
pub(crate) fn write_error(device: impl ToString, err: btzen_bus::Error) -> CoreError {
    match err {
        btzen_bus::Error::MethodError { .. } | btzen_bus::Error::Io(_) => CoreError::DataWrite {
            device: device.to_string(),
            reason: err.to_string(),
        },
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_becomes_cancellation() {
        let err = CoreError::from(btzen_bus::Error::Cancelled(CancelReason::Timeout));
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "Operation cancelled (timeout)");
    }

    #[test]
    fn method_error_on_read_is_data_read() {
        let err = read_error(
            "AA:BB:CC:DD:EE:FF",
            btzen_bus::Error::MethodError {
                name: "org.bluez.Error.Failed".into(),
                message: "Not connected".into(),
            },
        );
        assert!(matches!(err, CoreError::DataRead { .. }));
        assert!(!err.is_disconnect());
    }

    #[test]
    fn cancelled_read_stays_cancelled() {
        let err = read_error("x", btzen_bus::Error::Cancelled(CancelReason::Disconnected));
        assert!(err.is_cancelled());
        assert!(err.is_disconnect());
    }
}
