// ── GATT profile object ──
//
// Exported so BlueZ reconnects the managed devices by itself: once the
// application is registered, BlueZ auto-connects any known device that
// advertises one of the profile UUIDs.

use std::collections::BTreeSet;

use btzen_bus::object::ERROR_UNKNOWN_METHOD;
use btzen_bus::{LocalObject, Message, Result, Value, method_error};
use uuid::Uuid;

/// Root of the exported application, passed to `RegisterApplication`.
pub const APPLICATION_ROOT: &str = "/org/btzen";

/// Path of the profile object below the application root.
pub const PROFILE_PATH: &str = "/org/btzen/profile";

pub const GATT_PROFILE_INTERFACE: &str = "org.bluez.GattProfile1";

/// `org.bluez.GattProfile1` listing the service UUIDs of every managed
/// device.
#[derive(Debug, Clone)]
pub struct GattProfile {
    uuids: BTreeSet<Uuid>,
}

impl GattProfile {
    pub fn new(uuids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            uuids: uuids.into_iter().collect(),
        }
    }

    pub fn uuids(&self) -> impl Iterator<Item = &Uuid> {
        self.uuids.iter()
    }
}

impl LocalObject for GattProfile {
    fn interface(&self) -> &str {
        GATT_PROFILE_INTERFACE
    }

    fn properties(&self) -> Vec<(String, Value)> {
        let uuids = Value::str_array(self.uuids.iter().map(Uuid::to_string));
        vec![("UUIDs".into(), uuids)]
    }

    fn call(&self, member: &str, _msg: &Message) -> Result<Vec<Value>> {
        match member {
            "Release" => {
                tracing::debug!("GATT profile released by BlueZ");
                Ok(Vec::new())
            }
            _ => Err(method_error(ERROR_UNKNOWN_METHOD, format!("{GATT_PROFILE_INTERFACE}.{member}"))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{BATTERY_SERVICE, ENV_SENSING_SERVICE};

    #[test]
    fn uuids_are_a_sorted_union() {
        let profile = GattProfile::new([ENV_SENSING_SERVICE, BATTERY_SERVICE, ENV_SENSING_SERVICE]);
        let props = profile.properties();
        assert_eq!(props[0].0, "UUIDs");
        let uuids: Vec<_> = props[0].1.as_array().unwrap().iter().map(|v| v.as_str().unwrap().to_owned()).collect();
        assert_eq!(
            uuids,
            vec![
                "0000180f-0000-1000-8000-00805f9b34fb",
                "0000181a-0000-1000-8000-00805f9b34fb",
            ]
        );
    }

    #[test]
    fn release_is_a_no_op() {
        let profile = GattProfile::new([]);
        let msg = Message::method_call(":1.1", PROFILE_PATH, GATT_PROFILE_INTERFACE, "Release");
        assert!(profile.call("Release", &msg).unwrap().is_empty());
        let err = profile.call("Bogus", &msg).unwrap_err();
        assert_eq!(err.error_name(), Some(ERROR_UNKNOWN_METHOD));
    }
}
