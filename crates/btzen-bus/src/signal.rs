//! Signal matching and property-change notification routing.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures_util::future::select_all;
use tokio::sync::mpsc;

use crate::codec::{SigType, Value};
use crate::error::{CancelReason, Error, Result};
use crate::message::{Message, MessageKind};
use crate::transport::{Connection, DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE};

pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

// ── Match rules ──────────────────────────────────────────────────────

/// A signal match rule, installed on the bus with `AddMatch` and applied
/// again locally to route incoming signals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchRule {
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub arg0: Option<String>,
}

impl MatchRule {
    /// `PropertiesChanged` on `path` for properties of `interface`.
    pub fn properties_changed(path: &str, interface: &str) -> Self {
        Self {
            interface: Some(PROPERTIES_INTERFACE.to_owned()),
            member: Some(PROPERTIES_CHANGED.to_owned()),
            path: Some(path.to_owned()),
            arg0: Some(interface.to_owned()),
        }
    }

    pub fn matches(&self, msg: &Message) -> bool {
        fn field_ok(rule: Option<&String>, actual: Option<&String>) -> bool {
            rule.is_none_or(|want| actual == Some(want))
        }

        msg.kind == MessageKind::Signal
            && field_ok(self.interface.as_ref(), msg.interface.as_ref())
            && field_ok(self.member.as_ref(), msg.member.as_ref())
            && field_ok(self.path.as_ref(), msg.path.as_ref())
            && self
                .arg0
                .as_ref()
                .is_none_or(|want| msg.first_str().as_ref() == Some(want))
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("type='signal'")?;
        let parts = [
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("arg0", &self.arg0),
        ];
        for (key, value) in parts {
            if let Some(value) = value {
                write!(f, ",{key}='{}'", value.replace('\'', "'\\''"))?;
            }
        }
        Ok(())
    }
}

// ── Router ───────────────────────────────────────────────────────────

struct Subscription {
    rule: MatchRule,
    queues: HashMap<String, mpsc::UnboundedSender<Value>>,
}

/// Fans `PropertiesChanged` values out to per-property queues.
#[derive(Default)]
pub(crate) struct SignalRouter {
    subscriptions: DashMap<u64, Subscription>,
    next_id: AtomicU64,
}

type Queues = HashMap<String, mpsc::UnboundedReceiver<Value>>;

impl SignalRouter {
    fn insert(&self, rule: MatchRule, names: &[&str]) -> (u64, Queues) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for name in names {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert((*name).to_owned(), tx);
            receivers.insert((*name).to_owned(), rx);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(
            id,
            Subscription {
                rule,
                queues: senders,
            },
        );
        (id, receivers)
    }

    fn remove(&self, id: u64) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    pub(crate) fn clear(&self) {
        self.subscriptions.clear();
    }

    /// Route one signal. Returns the number of values queued.
    pub(crate) fn dispatch(&self, msg: &Message) -> usize {
        let mut queued = 0;
        for sub in &self.subscriptions {
            if !sub.rule.matches(msg) {
                continue;
            }
            match route_changed(msg, &sub.queues) {
                Ok(n) => queued += n,
                Err(e) => {
                    tracing::debug!(error = %e, msg = %msg, "ignoring undecodable PropertiesChanged");
                }
            }
        }
        queued
    }
}

/// Walk `sa{sv}as`, decoding only the values somebody registered for.
/// Nothing is queued unless the whole batch decodes.
fn route_changed(
    msg: &Message,
    queues: &HashMap<String, mpsc::UnboundedSender<Value>>,
) -> Result<usize> {
    let types = msg.signature().types();
    let shape_ok = matches!(
        types,
        [SigType::Str, SigType::Dict(k, v), ..] if **k == SigType::Str && **v == SigType::Variant
    );
    if !shape_ok {
        return Err(Error::protocol(format!(
            "unexpected PropertiesChanged signature '{}'",
            msg.signature()
        )));
    }

    let mut dec = msg.body_reader();
    dec.read_str()?;
    let end = dec.enter_array(8)?;
    let mut batch = Vec::new();
    while dec.position() < end {
        dec.align(8)?;
        let name = dec.read_str()?;
        match queues.get(&name) {
            Some(queue) => {
                let value = dec.decode(&SigType::Variant)?;
                batch.push((queue, value.peel().clone()));
            }
            None => dec.skip(&SigType::Variant)?,
        }
    }
    dec.leave_array(end)?;

    let mut queued = 0;
    for (queue, value) in batch {
        // receiver gone means the handle is being dropped
        if queue.send(value).is_ok() {
            queued += 1;
        }
    }
    Ok(queued)
}

// ── Subscription handle ──────────────────────────────────────────────

/// Receiving end of a property subscription.
///
/// Values arrive per property in bus order. Dropping the handle removes
/// the subscription and its match rule; [`unsubscribe`](Self::unsubscribe)
/// does the same but waits for the bus to confirm.
pub struct NotificationHandle {
    id: u64,
    rule: MatchRule,
    conn: Connection,
    queues: Queues,
    active: bool,
}

impl fmt::Debug for NotificationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationHandle")
            .field("rule", &self.rule.to_string())
            .field("properties", &self.queues.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl NotificationHandle {
    pub fn rule(&self) -> &MatchRule {
        &self.rule
    }

    fn closed_error(&self) -> Error {
        let reason = match self.conn.inner.closed_reason() {
            Some(CancelReason::Disconnected) => CancelReason::Disconnected,
            _ => CancelReason::Closed,
        };
        Error::Cancelled(reason)
    }

    /// Wait for the next value of `property`.
    pub async fn next(&mut self, property: &str) -> Result<Value> {
        let Some(queue) = self.queues.get_mut(property) else {
            return Err(Error::protocol(format!(
                "property '{property}' is not part of this subscription"
            )));
        };
        match queue.recv().await {
            Some(value) => Ok(value),
            None => Err(self.closed_error()),
        }
    }

    /// Next value of whichever registered property changes first.
    pub async fn next_any(&mut self) -> Result<(String, Value)> {
        if self.queues.is_empty() {
            return Err(Error::protocol("subscription has no properties"));
        }
        let waits = self.queues.iter_mut().map(|(name, queue)| {
            Box::pin(async move { queue.recv().await.map(|value| (name.clone(), value)) })
        });
        let (first, _, _) = select_all(waits).await;
        first.ok_or_else(|| self.closed_error())
    }

    /// Most recent queued value of `property`, discarding older ones.
    pub fn latest(&mut self, property: &str) -> Option<Value> {
        let queue = self.queues.get_mut(property)?;
        let mut latest = None;
        while let Ok(value) = queue.try_recv() {
            latest = Some(value);
        }
        latest
    }

    /// Remove the match rule and drop every queued value.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.active = false;
        self.conn.inner.router.remove(self.id);
        self.queues.clear();
        self.conn.remove_match(&self.rule).await
    }
}

impl Drop for NotificationHandle {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.conn.inner.router.remove(self.id);
        if self.conn.is_closed() {
            return;
        }
        let msg = Message::method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, "RemoveMatch")
            .with_args([Value::from(self.rule.to_string())]);
        if let Err(e) = msg.and_then(|msg| self.conn.call_no_reply(msg)) {
            tracing::debug!(error = %e, rule = %self.rule, "cannot remove match rule");
        }
    }
}

impl Connection {
    pub async fn add_match(&self, rule: &MatchRule) -> Result<()> {
        let msg = Message::method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, "AddMatch")
            .with_args([Value::from(rule.to_string())])?;
        self.call(msg).await?;
        tracing::debug!(rule = %rule, "match rule added");
        Ok(())
    }

    pub async fn remove_match(&self, rule: &MatchRule) -> Result<()> {
        let msg = Message::method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, "RemoveMatch")
            .with_args([Value::from(rule.to_string())])?;
        self.call(msg).await?;
        tracing::debug!(rule = %rule, "match rule removed");
        Ok(())
    }

    /// Subscribe to changes of `properties` of `interface` on `path`.
    ///
    /// Queues exist before the match rule is installed, so no signal sent
    /// after `AddMatch` returns is lost.
    pub async fn subscribe(
        &self,
        path: &str,
        interface: &str,
        properties: &[&str],
    ) -> Result<NotificationHandle> {
        let rule = MatchRule::properties_changed(path, interface);
        let (id, queues) = self.inner.router.insert(rule.clone(), properties);
        let mut handle = NotificationHandle {
            id,
            rule,
            conn: self.clone(),
            queues,
            active: false,
        };
        if let Err(e) = self.add_match(&handle.rule).await {
            self.inner.router.remove(id);
            return Err(e);
        }
        handle.active = true;
        Ok(handle)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn changed(path: &str, iface: &str, props: Vec<(&str, Value)>) -> Message {
        let mut msg = Message::signal(path, PROPERTIES_INTERFACE, PROPERTIES_CHANGED)
            .with_args([
                Value::from(iface),
                Value::property_map(props),
                Value::str_array(Vec::<String>::new()),
            ])
            .unwrap();
        msg.serial = 1;
        msg
    }

    #[test]
    fn properties_changed_rule_text() {
        let rule = MatchRule::properties_changed(
            "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF",
            "org.bluez.Device1",
        );
        insta::assert_snapshot!(rule.to_string(), @"type='signal',interface='org.freedesktop.DBus.Properties',member='PropertiesChanged',path='/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF',arg0='org.bluez.Device1'");
    }

    #[test]
    fn rule_checks_path_and_arg0() {
        let rule = MatchRule::properties_changed("/a", "org.bluez.Device1");
        assert!(rule.matches(&changed("/a", "org.bluez.Device1", vec![])));
        assert!(!rule.matches(&changed("/b", "org.bluez.Device1", vec![])));
        assert!(!rule.matches(&changed("/a", "org.bluez.Battery1", vec![])));
    }

    #[test]
    fn router_queues_only_registered_names() {
        let router = SignalRouter::default();
        let (_, mut queues) = router.insert(
            MatchRule::properties_changed("/c", "org.bluez.GattCharacteristic1"),
            &["Value"],
        );

        let msg = changed(
            "/c",
            "org.bluez.GattCharacteristic1",
            vec![
                ("Value", Value::from(vec![0x01, 0x02])),
                ("RSSI", Value::Int16(-70)),
            ],
        );
        assert_eq!(router.dispatch(&msg), 1);

        let queue = queues.get_mut("Value").unwrap();
        assert_eq!(queue.try_recv().unwrap(), Value::from(vec![0x01, 0x02]));
        assert!(queue.try_recv().is_err());
        assert!(!queues.contains_key("RSSI"));
    }

    #[test]
    fn unregistered_value_of_odd_type_is_skipped() {
        let router = SignalRouter::default();
        let (_, _queues) = router.insert(MatchRule::properties_changed("/c", "x.Y"), &["Value"]);
        let msg = changed(
            "/c",
            "x.Y",
            vec![(
                "Odd",
                Value::Struct(vec![Value::Double(1.5), Value::Uint64(3)]),
            )],
        );
        assert_eq!(router.dispatch(&msg), 0);
    }

    #[test]
    fn undecodable_batch_queues_nothing() {
        let router = SignalRouter::default();
        let (_, mut queues) = router.insert(MatchRule::properties_changed("/c", "x.Y"), &["Value"]);

        let mut msg = changed(
            "/c",
            "x.Y",
            vec![("Value", Value::Byte(1)), ("Zzz", Value::Byte(2))],
        )
        .to_bytes(1)
        .unwrap();
        // variant signature of the second entry becomes an unknown code
        let at = msg.windows(4).position(|w| w == b"Zzz\0").unwrap();
        assert_eq!(&msg[at + 4..at + 6], &[1, b'y']);
        msg[at + 5] = b'z';
        let msg = Message::from_frame(msg.freeze()).unwrap();

        assert_eq!(router.dispatch(&msg), 0);
        assert!(queues.get_mut("Value").unwrap().try_recv().is_err());
    }

    #[test]
    fn removed_subscription_receives_nothing() {
        let router = SignalRouter::default();
        let (id, _queues) = router.insert(MatchRule::properties_changed("/c", "x.Y"), &["Value"]);
        assert!(router.remove(id));
        assert!(!router.remove(id));
        let msg = changed("/c", "x.Y", vec![("Value", Value::Byte(1))]);
        assert_eq!(router.dispatch(&msg), 0);
    }
}
