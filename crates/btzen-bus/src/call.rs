//! Call correlation: method calls awaiting their reply by serial.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::codec::Value;
use crate::error::{CancelReason, Error, Result};
use crate::message::{FLAG_NO_REPLY_EXPECTED, Message};
use crate::signal::PROPERTIES_INTERFACE;
use crate::transport::{Connection, ReplySender};

/// Removes the pending slot when the awaiting future finishes or is
/// dropped, so a reply arriving afterwards finds nothing to resolve.
struct PendingSlot<'a> {
    pending: &'a DashMap<u32, ReplySender>,
    serial: u32,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.pending.remove(&self.serial).is_some() {
            tracing::debug!(serial = self.serial, "pending call detached");
        }
    }
}

impl Connection {
    /// Call with the connection's default timeout.
    pub async fn call(&self, msg: Message) -> Result<Message> {
        let timeout = self.inner.config.call_timeout;
        self.call_with_timeout(msg, timeout).await
    }

    /// Issue `msg` and wait for its reply.
    ///
    /// An error reply becomes [`Error::MethodError`] and a reply that fails
    /// to parse becomes [`Error::Protocol`]. When `timeout`
    /// elapses first the call completes with
    /// [`CancelReason::Timeout`] and a late reply is discarded.
    pub async fn call_with_timeout(&self, msg: Message, timeout: Duration) -> Result<Message> {
        let inner = &self.inner;
        let serial = inner.next_serial();
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(serial, tx);
        let _slot = PendingSlot {
            pending: &inner.pending,
            serial,
        };

        inner.send_with_serial(&msg, serial)?;
        // shutdown may have drained the map between insert and send
        if let Some(reason) = inner.closed_reason() {
            return Err(Error::Cancelled(reason));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply?.into_result(),
            Ok(Err(_)) => Err(Error::Cancelled(
                inner.closed_reason().unwrap_or(CancelReason::Disconnected),
            )),
            Err(_) => {
                tracing::debug!(serial, ?timeout, msg = %msg, "call timed out");
                Err(Error::Cancelled(CancelReason::Timeout))
            }
        }
    }

    /// Send without waiting for a reply. Errors in encoding or a closed
    /// connection are still reported.
    pub fn call_no_reply(&self, msg: Message) -> Result<()> {
        self.send(&msg.with_flags(FLAG_NO_REPLY_EXPECTED)).map(|_| ())
    }

    /// Build and issue a method call, returning the decoded reply
    /// arguments.
    pub async fn call_method(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
        args: impl IntoIterator<Item = Value>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>> {
        let msg = Message::method_call(destination, path, interface, member).with_args(args)?;
        let timeout = timeout.unwrap_or(self.inner.config.call_timeout);
        self.call_with_timeout(msg, timeout).await?.args()
    }

    /// `org.freedesktop.DBus.Properties.Get`, with the variant peeled.
    pub async fn get_property(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<Value> {
        let args = self
            .call_method(
                destination,
                path,
                PROPERTIES_INTERFACE,
                "Get",
                [Value::from(interface), Value::from(name)],
                None,
            )
            .await?;
        args.into_iter()
            .next()
            .map(|v| v.peel().clone())
            .ok_or_else(|| Error::protocol(format!("Get({interface}.{name}) returned nothing")))
    }
}
