//! Client-side proxies built from introspection data
//!
//! [`Connection::proxy_object`] introspects a remote object and exposes
//! each discovered interface as a [`ProxyInterface`]: methods become
//! signature-checked async calls, properties go through
//! `org.freedesktop.DBus.Properties`, and signal subscription installs a
//! match rule keyed on (sender, path, interface) with the member filtered
//! locally.

use crate::connection::{Connection, MessageStream};
use crate::error::{Error, Result};
use crate::introspect::{self, InterfaceInfo, Node};
use crate::match_rule::MatchRule;
use crate::service::{INTROSPECTABLE_IFACE, PROPERTIES_IFACE};
use dbus_wire::{
    validate_bus_name, validate_object_path, Message, MessageType, Signature, Value,
};
use std::collections::HashMap;
use tracing::debug;

/// A remote object: a (destination, path) pair and its interfaces
pub struct ProxyObject {
    destination: String,
    path: String,
    node: Node,
    interfaces: HashMap<String, ProxyInterface>,
}

impl ProxyObject {
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Child node names discovered during introspection
    pub fn children(&self) -> &[String] {
        &self.node.children
    }

    pub fn interface_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.interfaces.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn interface(&self, name: &str) -> Option<&ProxyInterface> {
        self.interfaces.get(name)
    }
}

/// One interface of a remote object
pub struct ProxyInterface {
    conn: Connection,
    destination: String,
    path: String,
    info: InterfaceInfo,
}

impl ProxyInterface {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &InterfaceInfo {
        &self.info
    }

    fn unknown(&self, member: &str) -> Error {
        Error::UnknownMember {
            interface: self.info.name.clone(),
            member: member.to_string(),
        }
    }

    /// Call `member` with `args`, checking both directions against the
    /// introspected signatures.
    pub async fn call(&self, member: &str, args: &[Value]) -> Result<Vec<Value>> {
        let method = self.info.method(member).ok_or_else(|| self.unknown(member))?;

        let given: Signature = args.iter().map(Value::ty).collect();
        if given != method.in_sig {
            return Err(Error::Wire(dbus_wire::WireError::TypeMismatch {
                expected: method.in_sig.to_string(),
                found: given.to_string(),
            }));
        }

        let msg = Message::method_call(&self.path, member)?
            .with_destination(&self.destination)?
            .with_interface(&self.info.name)?
            .with_body(args)?;
        let reply = self
            .conn
            .call(msg)
            .await?
            .ok_or(Error::InvalidState("reply-expecting"))?;

        if reply.signature != method.out_sig {
            debug!(
                member,
                expected = %method.out_sig,
                got = %reply.signature,
                "reply signature differs from introspection data"
            );
        }
        Ok(reply.body_values()?)
    }

    async fn properties_call(&self, member: &str, args: &[Value]) -> Result<Vec<Value>> {
        let msg = Message::method_call(&self.path, member)?
            .with_destination(&self.destination)?
            .with_interface(PROPERTIES_IFACE)?
            .with_body(args)?;
        let reply = self
            .conn
            .call(msg)
            .await?
            .ok_or(Error::InvalidState("reply-expecting"))?;
        Ok(reply.body_values()?)
    }

    /// Read a property via `Properties.Get`
    pub async fn get_property(&self, name: &str) -> Result<Value> {
        if self.info.property(name).is_none() {
            return Err(self.unknown(name));
        }
        let reply = self
            .properties_call(
                "Get",
                &[Value::from(self.info.name.as_str()), Value::from(name)],
            )
            .await?;
        match reply.into_iter().next() {
            Some(Value::Variant(inner)) => Ok(*inner),
            _ => Err(Error::method_error(
                crate::error::fault::FAILED,
                "Get returned no variant",
            )),
        }
    }

    /// Write a property via `Properties.Set`
    pub async fn set_property(&self, name: &str, value: Value) -> Result<()> {
        if self.info.property(name).is_none() {
            return Err(self.unknown(name));
        }
        self.properties_call(
            "Set",
            &[
                Value::from(self.info.name.as_str()),
                Value::from(name),
                value.into_variant(),
            ],
        )
        .await?;
        Ok(())
    }

    /// Snapshot all readable properties via `Properties.GetAll`
    pub async fn get_all_properties(&self) -> Result<HashMap<String, Value>> {
        let reply = self
            .properties_call("GetAll", &[Value::from(self.info.name.as_str())])
            .await?;
        let mut out = HashMap::new();
        if let Some(Value::Dict(_, _, entries)) = reply.into_iter().next() {
            for (key, value) in entries {
                if let Value::Str(key) = key {
                    out.insert(key, value.unwrap_variant());
                }
            }
        }
        Ok(out)
    }

    /// Subscribe to `member`. The bus-side match covers (sender, path,
    /// interface); the member is filtered locally.
    pub async fn receive_signal(&self, member: &str) -> Result<SignalStream> {
        if self.info.signal(member).is_none() {
            return Err(self.unknown(member));
        }
        let mut rule = MatchRule::new()
            .with_type(MessageType::Signal)
            .with_path(&self.path)?
            .with_interface(&self.info.name)?;
        // Direct connections carry no sender names
        if self.conn.is_bus() {
            rule = rule.with_sender(&self.destination)?;
        }
        let inner = self.conn.subscribe(rule).await?;
        Ok(SignalStream {
            inner,
            member: member.to_string(),
        })
    }
}

/// A [`MessageStream`] narrowed to one signal member
pub struct SignalStream {
    inner: MessageStream,
    member: String,
}

impl SignalStream {
    /// The next occurrence of the subscribed signal
    pub async fn recv(&mut self) -> Option<Message> {
        while let Some(msg) = self.inner.recv().await {
            if msg.member.as_deref() == Some(self.member.as_str()) {
                return Some(msg);
            }
        }
        None
    }
}

impl Connection {
    /// Introspect a remote object and build a proxy for it
    pub async fn proxy_object(&self, destination: &str, path: &str) -> Result<ProxyObject> {
        validate_bus_name(destination)?;
        validate_object_path(path)?;

        let msg = Message::method_call(path, "Introspect")?
            .with_destination(destination)?
            .with_interface(INTROSPECTABLE_IFACE)?;
        let reply = self
            .call(msg)
            .await?
            .ok_or(Error::InvalidState("reply-expecting"))?;
        let xml = match reply.body_values()?.into_iter().next() {
            Some(Value::Str(xml)) => xml,
            _ => {
                return Err(Error::Introspection(
                    "Introspect returned no document".to_string(),
                ))
            }
        };

        let node = introspect::parse(&xml)?;
        debug!(
            destination,
            path,
            interfaces = node.interfaces.len(),
            "proxy constructed"
        );
        let interfaces = node
            .interfaces
            .iter()
            .map(|info| {
                (
                    info.name.clone(),
                    ProxyInterface {
                        conn: self.clone(),
                        destination: destination.to_string(),
                        path: path.to_string(),
                        info: info.clone(),
                    },
                )
            })
            .collect();
        Ok(ProxyObject {
            destination: destination.to_string(),
            path: path.to_string(),
            node,
            interfaces,
        })
    }
}
