//! Bus match rules
//!
//! A match rule selects messages by header fields and leading string
//! arguments. The same struct serves two purposes: it renders to the
//! rule string sent to the daemon with `AddMatch`, and it evaluates
//! locally to pick which subscribers receive an inbound message.

use crate::error::{Error, Result};
use dbus_wire::{
    validate_bus_name, validate_interface_name, validate_member_name, validate_object_path,
    Message, MessageType, Value,
};
use std::fmt;

/// Highest argument index addressable by `argN` keys
pub const MAX_ARG_INDEX: u8 = 63;

/// A predicate over messages
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchRule {
    pub msg_type: Option<MessageType>,
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub path_namespace: Option<String>,
    pub destination: Option<String>,
    /// `argN='value'` constraints, sorted by index
    pub args: Vec<(u8, String)>,
    pub arg0_namespace: Option<String>,
}

impl MatchRule {
    pub fn new() -> Self {
        Self::default()
    }

    /// The usual rule shape for subscribing to a signal
    pub fn signal(interface: &str, member: &str) -> Result<Self> {
        validate_interface_name(interface)?;
        validate_member_name(member)?;
        Ok(Self {
            msg_type: Some(MessageType::Signal),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            ..Self::default()
        })
    }

    pub fn with_type(mut self, msg_type: MessageType) -> Self {
        self.msg_type = Some(msg_type);
        self
    }

    pub fn with_sender(mut self, sender: &str) -> Result<Self> {
        validate_bus_name(sender)?;
        self.sender = Some(sender.to_string());
        Ok(self)
    }

    pub fn with_interface(mut self, interface: &str) -> Result<Self> {
        validate_interface_name(interface)?;
        self.interface = Some(interface.to_string());
        Ok(self)
    }

    pub fn with_member(mut self, member: &str) -> Result<Self> {
        validate_member_name(member)?;
        self.member = Some(member.to_string());
        Ok(self)
    }

    pub fn with_path(mut self, path: &str) -> Result<Self> {
        validate_object_path(path)?;
        self.path = Some(path.to_string());
        Ok(self)
    }

    pub fn with_path_namespace(mut self, namespace: &str) -> Result<Self> {
        validate_object_path(namespace)?;
        self.path_namespace = Some(namespace.to_string());
        Ok(self)
    }

    pub fn with_destination(mut self, destination: &str) -> Result<Self> {
        validate_bus_name(destination)?;
        self.destination = Some(destination.to_string());
        Ok(self)
    }

    /// Constrain string argument `index` to equal `value`
    pub fn with_arg(mut self, index: u8, value: &str) -> Result<Self> {
        if index > MAX_ARG_INDEX {
            return Err(Error::Declaration(format!(
                "argument index {} out of range",
                index
            )));
        }
        match self.args.binary_search_by_key(&index, |(i, _)| *i) {
            Ok(at) => self.args[at].1 = value.to_string(),
            Err(at) => self.args.insert(at, (index, value.to_string())),
        }
        Ok(self)
    }

    pub fn with_arg0_namespace(mut self, namespace: &str) -> Self {
        self.arg0_namespace = Some(namespace.to_string());
        self
    }

    fn path_in_namespace(path: &str, namespace: &str) -> bool {
        if namespace == "/" {
            return true;
        }
        path == namespace
            || (path.len() > namespace.len()
                && path.starts_with(namespace)
                && path.as_bytes()[namespace.len()] == b'/')
    }

    fn name_in_namespace(name: &str, namespace: &str) -> bool {
        name == namespace
            || (name.len() > namespace.len()
                && name.starts_with(namespace)
                && name.as_bytes()[namespace.len()] == b'.')
    }

    /// Whether every present key matches `msg`
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(t) = self.msg_type {
            if msg.message_type != t {
                return false;
            }
        }
        if let Some(s) = &self.sender {
            if msg.sender.as_deref() != Some(s.as_str()) {
                return false;
            }
        }
        if let Some(i) = &self.interface {
            if msg.interface.as_deref() != Some(i.as_str()) {
                return false;
            }
        }
        if let Some(m) = &self.member {
            if msg.member.as_deref() != Some(m.as_str()) {
                return false;
            }
        }
        if let Some(p) = &self.path {
            if msg.path.as_deref() != Some(p.as_str()) {
                return false;
            }
        }
        if let Some(ns) = &self.path_namespace {
            match msg.path.as_deref() {
                Some(path) if Self::path_in_namespace(path, ns) => {}
                _ => return false,
            }
        }
        if let Some(d) = &self.destination {
            if msg.destination.as_deref() != Some(d.as_str()) {
                return false;
            }
        }

        if self.args.is_empty() && self.arg0_namespace.is_none() {
            return true;
        }
        let values = match msg.body_values() {
            Ok(v) => v,
            Err(_) => return false,
        };
        for (index, expected) in &self.args {
            match values.get(*index as usize) {
                Some(Value::Str(s)) if s == expected => {}
                _ => return false,
            }
        }
        if let Some(ns) = &self.arg0_namespace {
            match values.first() {
                Some(Value::Str(s)) if Self::name_in_namespace(s, ns) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Quote a value for the rule string: apostrophes around the value, with
/// literal apostrophes spliced in outside the quotes.
fn quote(value: &str, out: &mut String) {
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<(String, &str)> = Vec::new();
        if let Some(t) = self.msg_type {
            let name = match t {
                MessageType::MethodCall => "method_call",
                MessageType::MethodReturn => "method_return",
                MessageType::Error => "error",
                MessageType::Signal => "signal",
            };
            parts.push(("type".to_string(), name));
        }
        if let Some(v) = &self.sender {
            parts.push(("sender".to_string(), v.as_str()));
        }
        if let Some(v) = &self.interface {
            parts.push(("interface".to_string(), v.as_str()));
        }
        if let Some(v) = &self.member {
            parts.push(("member".to_string(), v.as_str()));
        }
        if let Some(v) = &self.path {
            parts.push(("path".to_string(), v.as_str()));
        }
        if let Some(v) = &self.path_namespace {
            parts.push(("path_namespace".to_string(), v.as_str()));
        }
        if let Some(v) = &self.destination {
            parts.push(("destination".to_string(), v.as_str()));
        }
        for (index, value) in &self.args {
            parts.push((format!("arg{}", index), value.as_str()));
        }
        if let Some(v) = &self.arg0_namespace {
            parts.push(("arg0namespace".to_string(), v.as_str()));
        }

        let mut out = String::new();
        for (i, (key, value)) in parts.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(key);
            out.push('=');
            quote(value, &mut out);
        }
        f.write_str(&out)
    }
}
