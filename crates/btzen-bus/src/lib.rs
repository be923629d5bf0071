//! Async client for the D-Bus system bus.
//!
//! Covers the subset of the protocol a BLE client needs: the binary wire
//! codec, method calls correlated by serial, `PropertiesChanged` routing to
//! per-property queues, and exported local objects. One [`Connection`]
//! multiplexes everything over a single socket.
//!
//! ```rust,ignore
//! use btzen_bus::{Connection, Message, Value};
//!
//! let conn = Connection::system().await?;
//! let msg = Message::method_call(
//!     "org.bluez",
//!     "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF",
//!     "org.bluez.Device1",
//!     "Connect",
//! );
//! conn.call(msg).await?;
//!
//! let mut changes = conn
//!     .subscribe("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF", "org.bluez.Device1", &["ServicesResolved"])
//!     .await?;
//! let resolved = changes.next("ServicesResolved").await?;
//! ```

pub mod auth;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod object;
pub mod signal;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

mod call;

pub use codec::{SigType, Signature, Value};
pub use config::BusConfig;
pub use error::{CancelReason, Error, Result};
pub use message::{Message, MessageKind};
pub use object::{Exported, LocalObject, method_error};
pub use signal::{MatchRule, NotificationHandle, PROPERTIES_INTERFACE};
pub use transport::Connection;
