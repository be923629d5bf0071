//! Local objects exported on the bus.
//!
//! Incoming method calls are answered synchronously from the reader task.
//! Every exported path also answers `Properties.Get/GetAll`, and any path
//! at or above exported objects answers `ObjectManager.GetManagedObjects`.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::codec::{SigType, Value};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::signal::PROPERTIES_INTERFACE;
use crate::transport::Connection;

pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
pub const ERROR_UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
pub const ERROR_PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

/// An object implementing one interface at an exported path.
pub trait LocalObject: Send + Sync + 'static {
    fn interface(&self) -> &str;

    /// Read-only properties of the interface.
    fn properties(&self) -> Vec<(String, Value)> {
        Vec::new()
    }

    /// Handle `member` of [`interface`](Self::interface). Returning
    /// [`Error::MethodError`] sends that error name back; any other error
    /// is reported as `org.freedesktop.DBus.Error.Failed`.
    fn call(&self, member: &str, msg: &Message) -> Result<Vec<Value>>;
}

/// Shorthand for a remote-visible method error.
pub fn method_error(name: &str, message: impl Into<String>) -> Error {
    Error::MethodError {
        name: name.to_owned(),
        message: message.into(),
    }
}

#[derive(Default)]
pub(crate) struct ObjectRegistry {
    objects: DashMap<String, Arc<dyn LocalObject>>,
}

impl ObjectRegistry {
    /// Reply to an incoming call, or `None` when no reply is wanted.
    pub(crate) fn handle(&self, msg: &Message) -> Option<Message> {
        let result = self.route(msg);
        if msg.no_reply_expected() {
            return None;
        }
        let reply = match result {
            Ok(args) => Message::method_return(msg).with_args(args),
            Err(e) => Err(e),
        };
        Some(match reply {
            Ok(reply) => reply,
            Err(Error::MethodError { name, message }) => Message::error(msg, &name, &message),
            Err(e) => Message::error(msg, ERROR_FAILED, &e.to_string()),
        })
    }

    fn route(&self, msg: &Message) -> Result<Vec<Value>> {
        let path = msg.path.as_deref().unwrap_or_default();
        let member = msg.member.as_deref().unwrap_or_default();
        let interface = msg.interface.as_deref();

        if interface == Some(OBJECT_MANAGER_INTERFACE) {
            return match member {
                "GetManagedObjects" if self.has_subtree(path) => Ok(vec![self.managed_objects(path)]),
                "GetManagedObjects" => Err(unknown_object(path)),
                _ => Err(unknown_method(interface, member)),
            };
        }

        let Some(object) = self.objects.get(path).map(|o| Arc::clone(o.value())) else {
            return Err(unknown_object(path));
        };

        if interface == Some(PROPERTIES_INTERFACE) {
            return properties_call(object.as_ref(), member, msg);
        }
        match interface {
            None => object.call(member, msg),
            Some(name) if name == object.interface() => object.call(member, msg),
            Some(name) => Err(method_error(
                ERROR_UNKNOWN_INTERFACE,
                format!("no interface {name} at {path}"),
            )),
        }
    }

    fn has_subtree(&self, root: &str) -> bool {
        self.objects.iter().any(|e| in_subtree(root, e.key()))
    }

    /// `a{oa{sa{sv}}}` of every object at or below `root`.
    fn managed_objects(&self, root: &str) -> Value {
        let props_ty = SigType::dict(SigType::Str, SigType::Variant);
        let ifaces_ty = SigType::dict(SigType::Str, props_ty.clone());

        let mut objects: Vec<(String, Arc<dyn LocalObject>)> = self
            .objects
            .iter()
            .filter(|e| in_subtree(root, e.key()))
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));

        let entries = objects
            .into_iter()
            .map(|(path, object)| {
                let ifaces = Value::Dict {
                    key: SigType::Str,
                    value: props_ty.clone(),
                    entries: vec![(
                        Value::from(object.interface()),
                        Value::property_map(object.properties()),
                    )],
                };
                (Value::ObjectPath(path), ifaces)
            })
            .collect();

        Value::Dict {
            key: SigType::ObjectPath,
            value: ifaces_ty,
            entries,
        }
    }
}

fn in_subtree(root: &str, path: &str) -> bool {
    root == "/"
        || path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn unknown_object(path: &str) -> Error {
    method_error(ERROR_UNKNOWN_OBJECT, format!("no object at {path}"))
}

fn unknown_method(interface: Option<&str>, member: &str) -> Error {
    method_error(
        ERROR_UNKNOWN_METHOD,
        format!("unknown method {}.{member}", interface.unwrap_or("?")),
    )
}

fn properties_call(object: &dyn LocalObject, member: &str, msg: &Message) -> Result<Vec<Value>> {
    let args = msg
        .args()
        .map_err(|e| method_error(ERROR_INVALID_ARGS, e.to_string()))?;
    let iface = args.first().and_then(Value::as_str).unwrap_or_default();
    if !iface.is_empty() && iface != object.interface() {
        return Err(method_error(
            ERROR_UNKNOWN_INTERFACE,
            format!("no interface {iface}"),
        ));
    }

    match member {
        "Get" => {
            let name = args
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| method_error(ERROR_INVALID_ARGS, "Get expects (ss)"))?;
            object
                .properties()
                .into_iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| vec![Value::variant(v)])
                .ok_or_else(|| method_error(ERROR_UNKNOWN_PROPERTY, format!("no property {name}")))
        }
        "GetAll" => Ok(vec![Value::property_map(object.properties())]),
        "Set" => Err(method_error(ERROR_PROPERTY_READ_ONLY, "properties are read-only")),
        _ => Err(unknown_method(Some(PROPERTIES_INTERFACE), member)),
    }
}

// ── Export guard ─────────────────────────────────────────────────────

/// Keeps an object exported; dropping it withdraws the object.
pub struct Exported {
    path: String,
    conn: Connection,
}

impl std::fmt::Debug for Exported {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exported").field("path", &self.path).finish()
    }
}

impl Exported {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for Exported {
    fn drop(&mut self) {
        if self.conn.inner.objects.objects.remove(&self.path).is_some() {
            tracing::debug!(path = %self.path, "object withdrawn");
        }
    }
}

impl Connection {
    /// Export `object` at `path` until the returned guard is dropped.
    pub fn export(&self, path: &str, object: Arc<dyn LocalObject>) -> Result<Exported> {
        crate::codec::wire::validate_object_path(path)?;
        let objects = &self.inner.objects.objects;
        match objects.entry(path.to_owned()) {
            Entry::Occupied(_) => {
                return Err(Error::protocol(format!("an object is already exported at {path}")));
            }
            Entry::Vacant(slot) => {
                slot.insert(object);
            }
        }
        tracing::debug!(path, "object exported");
        Ok(Exported {
            path: path.to_owned(),
            conn: self.clone(),
        })
    }
}
