// ── Pairing agent ──

use btzen_bus::object::ERROR_UNKNOWN_METHOD;
use btzen_bus::{LocalObject, Message, Result, Value, method_error};

pub const AGENT_PATH: &str = "/org/btzen/agent";

pub const AGENT_INTERFACE: &str = "org.bluez.Agent1";

/// Capability announced to `AgentManager1.RegisterAgent`.
pub const AGENT_CAPABILITY: &str = "NoInputNoOutput";

const ERROR_REJECTED: &str = "org.bluez.Error.Rejected";

/// `org.bluez.Agent1` for devices without a display or keyboard: accepts
/// "just works" pairing and service authorization, rejects anything that
/// needs a PIN or passkey.
#[derive(Debug, Default)]
pub struct Agent;

impl LocalObject for Agent {
    fn interface(&self) -> &str {
        AGENT_INTERFACE
    }

    fn call(&self, member: &str, msg: &Message) -> Result<Vec<Value>> {
        match member {
            "Release" | "Cancel" => Ok(Vec::new()),
            "RequestConfirmation" | "RequestAuthorization" | "AuthorizeService" => {
                tracing::info!(
                    device = msg.first_str().as_deref().unwrap_or("?"),
                    member,
                    "pairing request accepted"
                );
                Ok(Vec::new())
            }
            "RequestPinCode" | "RequestPasskey" | "DisplayPinCode" | "DisplayPasskey" => {
                tracing::warn!(member, "pairing needs user input, rejected");
                Err(method_error(ERROR_REJECTED, "no input or output capability"))
            }
            _ => Err(method_error(ERROR_UNKNOWN_METHOD, format!("{AGENT_INTERFACE}.{member}"))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn call(member: &str) -> Result<Vec<Value>> {
        let msg = Message::method_call(":1.1", AGENT_PATH, AGENT_INTERFACE, member)
            .with_args([Value::object_path("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF")])
            .unwrap();
        Agent.call(member, &msg)
    }

    #[test]
    fn just_works_pairing_is_accepted() {
        assert!(call("RequestAuthorization").is_ok());
        assert!(call("Release").is_ok());
    }

    #[test]
    fn passkey_pairing_is_rejected() {
        let err = call("RequestPasskey").unwrap_err();
        assert_eq!(err.error_name(), Some(ERROR_REJECTED));
    }
}
