//! Inbound call routing and the standard interfaces
//!
//! The registry maps object paths to their bound interfaces; the router
//! resolves an inbound METHOD_CALL to a handler, runs it, and replies.
//! `org.freedesktop.DBus.{Peer,Introspectable,Properties,ObjectManager}`
//! are provided here rather than by application code.

use crate::connection::Connection;
use crate::error::fault;
use crate::interface::{CallError, EmitsChanged, Interface};
use crate::introspect;
use dbus_wire::{Message, Signature, Type, Value};
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{debug, error, warn};

pub const PEER_IFACE: &str = "org.freedesktop.DBus.Peer";
pub const INTROSPECTABLE_IFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";
pub const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";

type CallResult = std::result::Result<Vec<Value>, CallError>;

/// The export table: path -> interface name -> bound interface.
///
/// Paths live in a sorted map so child and subtree queries are range
/// scans rather than full walks.
pub(crate) struct ObjectRegistry {
    exports: RwLock<BTreeMap<String, HashMap<String, Arc<Interface>>>>,
    managers: RwLock<BTreeSet<String>>,
}

fn in_namespace(path: &str, base: &str) -> bool {
    if base == "/" {
        return true;
    }
    path == base
        || (path.len() > base.len()
            && path.starts_with(base)
            && path.as_bytes()[base.len()] == b'/')
}

impl ObjectRegistry {
    pub(crate) fn new() -> Self {
        Self {
            exports: RwLock::new(BTreeMap::new()),
            managers: RwLock::new(BTreeSet::new()),
        }
    }

    pub(crate) fn export(&self, path: &str, interface: Arc<Interface>) {
        self.exports
            .write()
            .entry(path.to_string())
            .or_default()
            .insert(interface.name().to_string(), interface);
    }

    /// Remove one interface, or the whole node. Returns the removed
    /// interface names.
    pub(crate) fn unexport(&self, path: &str, interface: Option<&str>) -> Vec<String> {
        let mut exports = self.exports.write();
        match interface {
            Some(name) => {
                let mut removed = Vec::new();
                if let Some(node) = exports.get_mut(path) {
                    if node.remove(name).is_some() {
                        removed.push(name.to_string());
                    }
                    if node.is_empty() {
                        exports.remove(path);
                    }
                }
                removed
            }
            None => exports
                .remove(path)
                .map(|node| {
                    let mut names: Vec<_> = node.into_keys().collect();
                    names.sort();
                    names
                })
                .unwrap_or_default(),
        }
    }

    pub(crate) fn lookup(&self, path: &str, interface: &str) -> Option<Arc<Interface>> {
        self.exports.read().get(path)?.get(interface).cloned()
    }

    /// Interfaces bound at `path`, sorted by name
    pub(crate) fn interfaces_at(&self, path: &str) -> Vec<Arc<Interface>> {
        let exports = self.exports.read();
        let mut interfaces: Vec<_> = exports
            .get(path)
            .map(|node| node.values().cloned().collect())
            .unwrap_or_default();
        interfaces.sort_by(|a, b| a.name().cmp(b.name()));
        interfaces
    }

    pub(crate) fn has_path(&self, path: &str) -> bool {
        self.exports.read().contains_key(path)
    }

    /// Prefix that every strict descendant path starts with. Descendants
    /// form one contiguous lexicographic range under this prefix, so
    /// subtree queries are range scans.
    fn child_prefix(path: &str) -> String {
        if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        }
    }

    /// Whether any exported path lies strictly below `path`
    pub(crate) fn has_descendants(&self, path: &str) -> bool {
        let prefix = Self::child_prefix(path);
        let exports = self.exports.read();
        exports
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(p, _)| p.starts_with(&prefix))
    }

    /// Direct child element names below `path`, sorted and deduplicated
    pub(crate) fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = Self::child_prefix(path);
        let exports = self.exports.read();
        let mut children = BTreeSet::new();
        for (p, _) in exports.range(prefix.clone()..) {
            if !p.starts_with(&prefix) {
                break;
            }
            let rest = &p[prefix.len()..];
            if let Some(first) = rest.split('/').next().filter(|s| !s.is_empty()) {
                children.insert(first.to_string());
            }
        }
        children.into_iter().collect()
    }

    /// All exported nodes strictly below `path`
    pub(crate) fn subtree(&self, path: &str) -> Vec<(String, Vec<Arc<Interface>>)> {
        let prefix = Self::child_prefix(path);
        let exports = self.exports.read();
        let mut out = Vec::new();
        for (p, node) in exports.range(prefix.clone()..) {
            if !p.starts_with(&prefix) {
                break;
            }
            let mut interfaces: Vec<_> = node.values().cloned().collect();
            interfaces.sort_by(|a, b| a.name().cmp(b.name()));
            out.push((p.clone(), interfaces));
        }
        out
    }

    pub(crate) fn add_manager(&self, path: &str) {
        self.managers.write().insert(path.to_string());
    }

    pub(crate) fn is_manager(&self, path: &str) -> bool {
        self.managers.read().contains(path)
    }

    /// The closest enabled ObjectManager strictly above `path`
    pub(crate) fn nearest_manager(&self, path: &str) -> Option<String> {
        let managers = self.managers.read();
        managers
            .iter()
            .filter(|m| m.as_str() != path && in_namespace(path, m))
            .max_by_key(|m| m.len())
            .cloned()
    }
}

fn props_dict_type() -> Type {
    Type::Array(Box::new(Type::DictEntry(
        Box::new(Type::String),
        Box::new(Type::Variant),
    )))
}

/// Snapshot of an interface's readable, enabled properties as `a{sv}`
fn property_snapshot(iface: &Interface) -> Value {
    let mut entries = Vec::new();
    for prop in iface.properties() {
        if !prop.access.readable() {
            continue;
        }
        let Some(getter) = &prop.getter else { continue };
        match getter() {
            Ok(value) => entries.push((Value::Str(prop.name().to_string()), value.into_variant())),
            Err(e) => warn!(property = prop.name(), error = %e, "property getter failed in snapshot"),
        }
    }
    Value::Dict(Type::String, Type::Variant, entries)
}

/// Emit `InterfacesAdded` for a new export, if an ancestor manages it
pub(crate) async fn announce_added(conn: &Connection, path: &str, interfaces: &[Arc<Interface>]) {
    let Some(manager) = conn.inner.registry.nearest_manager(path) else {
        return;
    };
    let entries: Vec<_> = interfaces
        .iter()
        .map(|iface| {
            (
                Value::Str(iface.name().to_string()),
                property_snapshot(iface),
            )
        })
        .collect();
    let body = [
        Value::ObjectPath(path.to_string()),
        Value::Dict(Type::String, props_dict_type(), entries),
    ];
    let msg = Message::signal(&manager, OBJECT_MANAGER_IFACE, "InterfacesAdded")
        .and_then(|m| m.with_body(&body));
    match msg {
        Ok(msg) => {
            if let Err(e) = conn.send(msg).await {
                debug!(error = %e, "could not emit InterfacesAdded");
            }
        }
        Err(e) => warn!(error = %e, "could not build InterfacesAdded"),
    }
}

/// Emit `InterfacesRemoved` for an unexport, if an ancestor manages it
pub(crate) async fn announce_removed(conn: &Connection, path: &str, names: &[String]) {
    let Some(manager) = conn.inner.registry.nearest_manager(path) else {
        return;
    };
    let body = [
        Value::ObjectPath(path.to_string()),
        Value::Array(
            Type::String,
            names.iter().map(|n| Value::Str(n.clone())).collect(),
        ),
    ];
    let msg = Message::signal(&manager, OBJECT_MANAGER_IFACE, "InterfacesRemoved")
        .and_then(|m| m.with_body(&body));
    match msg {
        Ok(msg) => {
            if let Err(e) = conn.send(msg).await {
                debug!(error = %e, "could not emit InterfacesRemoved");
            }
        }
        Err(e) => warn!(error = %e, "could not build InterfacesRemoved"),
    }
}

/// Handle one inbound METHOD_CALL end to end
pub(crate) async fn handle_call(conn: Connection, msg: Message) {
    let result = route(&conn, &msg).await;
    if !msg.expects_reply() {
        if let Err(e) = result {
            debug!(error = %e, "call without reply expectation failed");
        }
        return;
    }
    let reply = match result {
        Ok(values) => Message::method_return(&msg)
            .with_body(&values)
            .or_else(|e| {
                error!(error = %e, "could not marshal reply body");
                Message::error(&msg, fault::FAILED, "could not marshal reply")
            }),
        Err(call_error) => Message::error(&msg, &call_error.name, &call_error.message),
    };
    match reply {
        Ok(reply) => {
            if let Err(e) = conn.send(reply).await {
                debug!(error = %e, "could not send reply");
            }
        }
        Err(e) => error!(error = %e, "could not build reply"),
    }
}

async fn route(conn: &Connection, msg: &Message) -> CallResult {
    let path = msg.path.as_deref().unwrap_or("/");
    let member = msg.member.as_deref().unwrap_or("");
    let registry = &conn.inner.registry;

    let exists = registry.has_path(path);
    if !exists && !registry.has_descendants(path) {
        return Err(CallError::new(
            fault::UNKNOWN_OBJECT,
            format!("no object exported at {}", path),
        ));
    }

    let interface = match msg.interface.as_deref() {
        Some(name) => name.to_string(),
        None => resolve_member_interface(conn, path, member)?,
    };

    match interface.as_str() {
        PEER_IFACE => peer_call(member, msg),
        INTROSPECTABLE_IFACE => introspect_call(conn, path, member, msg),
        PROPERTIES_IFACE => properties_call(conn, path, member, msg).await,
        OBJECT_MANAGER_IFACE => object_manager_call(conn, path, member, msg),
        name => user_call(conn, path, name, member, msg).await,
    }
}

/// Empty-interface dispatch: the member must match exactly one interface
fn resolve_member_interface(
    conn: &Connection,
    path: &str,
    member: &str,
) -> std::result::Result<String, CallError> {
    let registry = &conn.inner.registry;
    let mut candidates = Vec::new();
    for iface in registry.interfaces_at(path) {
        if iface.method(member).is_some() {
            candidates.push(iface.name().to_string());
        }
    }
    if matches!(member, "Ping" | "GetMachineId") {
        candidates.push(PEER_IFACE.to_string());
    }
    if member == "Introspect" {
        candidates.push(INTROSPECTABLE_IFACE.to_string());
    }
    if registry.has_path(path) && matches!(member, "Get" | "Set" | "GetAll") {
        candidates.push(PROPERTIES_IFACE.to_string());
    }
    if registry.is_manager(path) && member == "GetManagedObjects" {
        candidates.push(OBJECT_MANAGER_IFACE.to_string());
    }

    match candidates.len() {
        0 => Err(CallError::new(
            fault::UNKNOWN_METHOD,
            format!("no interface declares a method {:?}", member),
        )),
        1 => Ok(candidates.remove(0)),
        _ => Err(CallError::invalid_args(format!(
            "method {:?} is ambiguous without an interface",
            member
        ))),
    }
}

fn expect_args(msg: &Message, sig: &str) -> CallResult {
    let actual = msg.signature.to_string();
    if actual != sig {
        return Err(CallError::invalid_args(format!(
            "expected signature {:?}, got {:?}",
            sig, actual
        )));
    }
    msg.body_values()
        .map_err(|e| CallError::invalid_args(e.to_string()))
}

fn machine_id() -> std::result::Result<String, CallError> {
    static CACHED: OnceLock<Option<String>> = OnceLock::new();
    let id = CACHED.get_or_init(|| {
        for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            if let Ok(mut raw) = std::fs::read(path) {
                while raw.last() == Some(&b'\n') {
                    raw.pop();
                }
                if raw.len() == 32 && raw.iter().all(u8::is_ascii_hexdigit) {
                    if let Ok(id) = String::from_utf8(raw) {
                        return Some(id);
                    }
                }
            }
        }
        None
    });
    id.clone()
        .ok_or_else(|| CallError::failed("no machine id available"))
}

fn peer_call(member: &str, msg: &Message) -> CallResult {
    match member {
        "Ping" => {
            expect_args(msg, "")?;
            Ok(vec![])
        }
        "GetMachineId" => {
            expect_args(msg, "")?;
            Ok(vec![Value::Str(machine_id()?)])
        }
        _ => Err(CallError::new(
            fault::UNKNOWN_METHOD,
            format!("no method {:?} on {}", member, PEER_IFACE),
        )),
    }
}

fn introspect_call(conn: &Connection, path: &str, member: &str, msg: &Message) -> CallResult {
    if member != "Introspect" {
        return Err(CallError::new(
            fault::UNKNOWN_METHOD,
            format!("no method {:?} on {}", member, INTROSPECTABLE_IFACE),
        ));
    }
    expect_args(msg, "")?;
    let registry = &conn.inner.registry;
    let interfaces = registry.interfaces_at(path);
    let refs: Vec<&Interface> = interfaces.iter().map(Arc::as_ref).collect();
    let xml = introspect::generate(&refs, registry.is_manager(path), &registry.children_of(path));
    Ok(vec![Value::Str(xml)])
}

async fn properties_call(
    conn: &Connection,
    path: &str,
    member: &str,
    msg: &Message,
) -> CallResult {
    let registry = &conn.inner.registry;
    match member {
        "Get" => {
            let args = expect_args(msg, "ss")?;
            let (iface_name, prop_name) = two_strings(args)?;
            let iface = registry.lookup(path, &iface_name).ok_or_else(|| {
                CallError::new(
                    fault::UNKNOWN_INTERFACE,
                    format!("no interface {:?} at {}", iface_name, path),
                )
            })?;
            let prop = iface.property(&prop_name).ok_or_else(|| {
                CallError::invalid_args(format!("no property {:?}", prop_name))
            })?;
            if !prop.access.readable() {
                return Err(CallError::new(
                    fault::PROPERTY_WRITE_ONLY,
                    format!("property {:?} is write-only", prop_name),
                ));
            }
            let getter = prop
                .getter
                .as_ref()
                .ok_or_else(|| CallError::failed("property has no getter"))?;
            let value = getter()?;
            if value.ty() != prop.ty {
                return Err(CallError::failed("property getter returned wrong type"));
            }
            Ok(vec![value.into_variant()])
        }
        "Set" => {
            let args = expect_args(msg, "ssv")?;
            let mut iter = args.into_iter();
            let (iface_name, prop_name) = match (iter.next(), iter.next()) {
                (Some(Value::Str(a)), Some(Value::Str(b))) => (a, b),
                _ => return Err(CallError::invalid_args("expected interface and property")),
            };
            let value = match iter.next() {
                Some(Value::Variant(inner)) => *inner,
                _ => return Err(CallError::invalid_args("expected a variant value")),
            };
            let iface = registry.lookup(path, &iface_name).ok_or_else(|| {
                CallError::new(
                    fault::UNKNOWN_INTERFACE,
                    format!("no interface {:?} at {}", iface_name, path),
                )
            })?;
            let prop = iface.property(&prop_name).ok_or_else(|| {
                CallError::invalid_args(format!("no property {:?}", prop_name))
            })?;
            if !prop.access.writable() {
                return Err(CallError::new(
                    fault::PROPERTY_READ_ONLY,
                    format!("property {:?} is read-only", prop_name),
                ));
            }
            if value.ty() != prop.ty {
                return Err(CallError::invalid_args(format!(
                    "property {:?} has type {:?}",
                    prop_name,
                    prop.ty.to_string()
                )));
            }
            let setter = prop
                .setter
                .as_ref()
                .ok_or_else(|| CallError::failed("property has no setter"))?;
            setter(value.clone())?;

            emit_properties_changed(conn, path, &iface_name, prop.name(), prop.emits_changed, value)
                .await;
            Ok(vec![])
        }
        "GetAll" => {
            let args = expect_args(msg, "s")?;
            let iface_name = match args.into_iter().next() {
                Some(Value::Str(s)) => s,
                _ => return Err(CallError::invalid_args("expected an interface name")),
            };
            let iface = registry.lookup(path, &iface_name).ok_or_else(|| {
                CallError::new(
                    fault::UNKNOWN_INTERFACE,
                    format!("no interface {:?} at {}", iface_name, path),
                )
            })?;
            let mut entries = Vec::new();
            for prop in iface.properties() {
                if !prop.access.readable() {
                    continue;
                }
                let Some(getter) = &prop.getter else { continue };
                let value = getter()?;
                entries.push((Value::Str(prop.name().to_string()), value.into_variant()));
            }
            Ok(vec![Value::Dict(Type::String, Type::Variant, entries)])
        }
        _ => Err(CallError::new(
            fault::UNKNOWN_METHOD,
            format!("no method {:?} on {}", member, PROPERTIES_IFACE),
        )),
    }
}

fn two_strings(args: Vec<Value>) -> std::result::Result<(String, String), CallError> {
    let mut iter = args.into_iter();
    match (iter.next(), iter.next()) {
        (Some(Value::Str(a)), Some(Value::Str(b))) => Ok((a, b)),
        _ => Err(CallError::invalid_args("expected two strings")),
    }
}

/// Emit `PropertiesChanged` after a successful `Set`, honoring the
/// property's `EmitsChangedSignal` mode.
async fn emit_properties_changed(
    conn: &Connection,
    path: &str,
    iface_name: &str,
    prop_name: &str,
    mode: EmitsChanged,
    value: Value,
) {
    let (changed, invalidated) = match mode {
        EmitsChanged::True => (
            vec![(Value::Str(prop_name.to_string()), value.into_variant())],
            vec![],
        ),
        EmitsChanged::Invalidates => (vec![], vec![Value::Str(prop_name.to_string())]),
        EmitsChanged::Const | EmitsChanged::False => return,
    };
    let body = [
        Value::Str(iface_name.to_string()),
        Value::Dict(Type::String, Type::Variant, changed),
        Value::Array(Type::String, invalidated),
    ];
    let msg = Message::signal(path, PROPERTIES_IFACE, "PropertiesChanged")
        .and_then(|m| m.with_body(&body));
    match msg {
        Ok(msg) => {
            if let Err(e) = conn.send(msg).await {
                debug!(error = %e, "could not emit PropertiesChanged");
            }
        }
        Err(e) => warn!(error = %e, "could not build PropertiesChanged"),
    }
}

fn object_manager_call(conn: &Connection, path: &str, member: &str, msg: &Message) -> CallResult {
    let registry = &conn.inner.registry;
    if !registry.is_manager(path) {
        return Err(CallError::new(
            fault::UNKNOWN_INTERFACE,
            format!("no interface {} at {}", OBJECT_MANAGER_IFACE, path),
        ));
    }
    if member != "GetManagedObjects" {
        return Err(CallError::new(
            fault::UNKNOWN_METHOD,
            format!("no method {:?} on {}", member, OBJECT_MANAGER_IFACE),
        ));
    }
    expect_args(msg, "")?;

    let mut objects = Vec::new();
    for (obj_path, interfaces) in registry.subtree(path) {
        let entries: Vec<_> = interfaces
            .iter()
            .map(|iface| {
                (
                    Value::Str(iface.name().to_string()),
                    property_snapshot(iface),
                )
            })
            .collect();
        objects.push((
            Value::ObjectPath(obj_path),
            Value::Dict(Type::String, props_dict_type(), entries),
        ));
    }
    let iface_dict_ty = Type::Array(Box::new(Type::DictEntry(
        Box::new(Type::String),
        Box::new(props_dict_type()),
    )));
    Ok(vec![Value::Dict(Type::ObjectPath, iface_dict_ty, objects)])
}

async fn user_call(
    conn: &Connection,
    path: &str,
    iface_name: &str,
    member: &str,
    msg: &Message,
) -> CallResult {
    let iface = conn
        .inner
        .registry
        .lookup(path, iface_name)
        .ok_or_else(|| {
            CallError::new(
                fault::UNKNOWN_INTERFACE,
                format!("no interface {:?} at {}", iface_name, path),
            )
        })?;
    let (handler, out_sig) = {
        let method = iface.method(member).ok_or_else(|| {
            CallError::new(
                fault::UNKNOWN_METHOD,
                format!("no method {:?} on {}", member, iface_name),
            )
        })?;
        // The declared input signature must match byte for byte
        let declared = method.in_sig.to_string();
        let actual = msg.signature.to_string();
        if declared != actual {
            return Err(CallError::invalid_args(format!(
                "method {:?} takes {:?}, got {:?}",
                member, declared, actual
            )));
        }
        (Arc::clone(&method.handler), method.out_sig.clone())
    };
    let args = msg
        .body_values()
        .map_err(|e| CallError::invalid_args(e.to_string()))?;

    match AssertUnwindSafe(handler(args)).catch_unwind().await {
        Ok(Ok(values)) => {
            let produced: Signature = values.iter().map(Value::ty).collect();
            if produced != out_sig {
                error!(
                    method = member,
                    expected = %out_sig,
                    produced = %produced,
                    "handler returned unexpected signature"
                );
                return Err(CallError::failed("method returned unexpected signature"));
            }
            Ok(values)
        }
        Ok(Err(call_error)) => Err(call_error),
        Err(panic) => {
            let text = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "method handler panicked".to_string());
            error!(method = member, panic = %text, "method handler panicked");
            Err(CallError::failed(text))
        }
    }
}
