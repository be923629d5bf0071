use thiserror::Error;

/// Why an awaited call or notification completed without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The local timeout elapsed before a reply arrived.
    Timeout,
    /// The bus connection dropped while the call was in flight.
    Disconnected,
    /// The connection (or subscription) was closed locally.
    Closed,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Disconnected => f.write_str("bus disconnected"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Top-level error type for the `btzen-bus` crate.
///
/// Covers every failure mode of the bus surface: wire format, socket I/O,
/// authentication, remote error replies and local cancellation.
/// `btzen-core` maps these into device-level errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Wire format ─────────────────────────────────────────────────
    /// Malformed or unsupported wire data.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A value was encoded against a signature it does not match.
    #[error("Type mismatch: expected '{expected}', found '{found}'")]
    TypeMismatch { expected: String, found: String },

    // ── Transport ───────────────────────────────────────────────────
    /// Socket I/O failure.
    #[error("Bus I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SASL handshake rejected or garbled.
    #[error("Bus authentication failed: {0}")]
    Auth(String),

    // ── Remote ──────────────────────────────────────────────────────
    /// The peer answered with an error message.
    #[error("{name}: {message}")]
    MethodError { name: String, message: String },

    // ── Local ───────────────────────────────────────────────────────
    /// The call was cancelled locally; no value will be delivered.
    #[error("Call cancelled ({0})")]
    Cancelled(CancelReason),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Returns `true` for local cancellations (timeouts included).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cancelled(CancelReason::Timeout | CancelReason::Disconnected) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::NotFound
            ),
            Self::MethodError { name, .. } => {
                name == "org.bluez.Error.InProgress" || name == "org.freedesktop.DBus.Error.NoReply"
            }
            _ => false,
        }
    }

    /// Remote error name, if the peer replied with an error.
    pub fn error_name(&self) -> Option<&str> {
        match self {
            Self::MethodError { name, .. } => Some(name),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
