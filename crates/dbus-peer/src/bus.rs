//! Operations on the message bus itself
//!
//! Thin typed wrappers around `org.freedesktop.DBus`: `Hello`, name
//! ownership, match registration and daemon queries. The owned-name set
//! is tracked locally and cleared on disconnect.

use crate::connection::Connection;
use crate::error::{Error, Result};
use dbus_wire::{validate_bus_name, Message, Value};
use tracing::debug;

/// The daemon's bus name
pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
/// The daemon's object path
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
/// The daemon's interface
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Flags for [`Connection::request_name`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestNameFlags(u32);

impl RequestNameFlags {
    /// Let another peer take the name from us
    pub const ALLOW_REPLACEMENT: u32 = 0x1;
    /// Take the name from its current owner if allowed
    pub const REPLACE_EXISTING: u32 = 0x2;
    /// Fail instead of queueing when the name is taken
    pub const DO_NOT_QUEUE: u32 = 0x4;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn allow_replacement(mut self) -> Self {
        self.0 |= Self::ALLOW_REPLACEMENT;
        self
    }

    pub fn replace_existing(mut self) -> Self {
        self.0 |= Self::REPLACE_EXISTING;
        self
    }

    pub fn do_not_queue(mut self) -> Self {
        self.0 |= Self::DO_NOT_QUEUE;
        self
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Reply codes from `RequestName`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

impl RequestNameReply {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::PrimaryOwner),
            2 => Some(Self::InQueue),
            3 => Some(Self::Exists),
            4 => Some(Self::AlreadyOwner),
            _ => None,
        }
    }
}

/// Reply codes from `ReleaseName`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released = 1,
    NonExistent = 2,
    NotOwner = 3,
}

impl ReleaseNameReply {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Released),
            2 => Some(Self::NonExistent),
            3 => Some(Self::NotOwner),
            _ => None,
        }
    }
}

fn daemon_call(member: &str) -> Result<Message> {
    Ok(Message::method_call(DBUS_PATH, member)?
        .with_destination(DBUS_SERVICE)?
        .with_interface(DBUS_INTERFACE)?)
}

fn bad_reply(member: &str) -> Error {
    Error::method_error(
        crate::error::fault::FAILED,
        format!("unexpected reply shape from {}", member),
    )
}

impl Connection {
    async fn daemon_round_trip(&self, msg: Message) -> Result<Vec<Value>> {
        let member = msg.member.clone().unwrap_or_default();
        let reply = self
            .call(msg)
            .await?
            .ok_or_else(|| bad_reply(&member))?;
        Ok(reply.body_values()?)
    }

    /// `Hello()`: must be the first call on a bus connection; returns and
    /// records the unique name.
    pub(crate) async fn hello(&self) -> Result<String> {
        let reply = self.daemon_round_trip(daemon_call("Hello")?).await?;
        match reply.into_iter().next() {
            Some(Value::Str(name)) => {
                self.set_unique_name(name.clone());
                Ok(name)
            }
            _ => Err(bad_reply("Hello")),
        }
    }

    /// Ask the daemon for ownership of a well-known name
    pub async fn request_name(
        &self,
        name: &str,
        flags: RequestNameFlags,
    ) -> Result<RequestNameReply> {
        validate_bus_name(name)?;
        let msg = daemon_call("RequestName")?
            .with_body(&[Value::from(name), Value::UInt32(flags.as_u32())])?;
        let reply = self.daemon_round_trip(msg).await?;
        let code = match reply.into_iter().next() {
            Some(Value::UInt32(code)) => {
                RequestNameReply::from_u32(code).ok_or_else(|| bad_reply("RequestName"))?
            }
            _ => return Err(bad_reply("RequestName")),
        };
        if matches!(
            code,
            RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner
        ) {
            self.inner.owned_names.lock().insert(name.to_string());
            debug!(name, "name acquired");
        }
        Ok(code)
    }

    /// Give a well-known name back to the daemon
    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        validate_bus_name(name)?;
        let msg = daemon_call("ReleaseName")?.with_body(&[Value::from(name)])?;
        let reply = self.daemon_round_trip(msg).await?;
        let code = match reply.into_iter().next() {
            Some(Value::UInt32(code)) => {
                ReleaseNameReply::from_u32(code).ok_or_else(|| bad_reply("ReleaseName"))?
            }
            _ => return Err(bad_reply("ReleaseName")),
        };
        self.inner.owned_names.lock().remove(name);
        Ok(code)
    }

    /// Well-known names currently owned by this connection
    pub fn owned_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.owned_names.lock().iter().cloned().collect();
        names.sort();
        names
    }

    /// The daemon's machine id
    pub async fn get_id(&self) -> Result<String> {
        let reply = self.daemon_round_trip(daemon_call("GetId")?).await?;
        match reply.into_iter().next() {
            Some(Value::Str(id)) => Ok(id),
            _ => Err(bad_reply("GetId")),
        }
    }

    /// All names currently on the bus
    pub async fn list_names(&self) -> Result<Vec<String>> {
        let reply = self.daemon_round_trip(daemon_call("ListNames")?).await?;
        match reply.into_iter().next() {
            Some(Value::Array(_, items)) => Ok(items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Str(s) => Some(s),
                    _ => None,
                })
                .collect()),
            _ => Err(bad_reply("ListNames")),
        }
    }

    /// Whether `name` currently has an owner
    pub async fn name_has_owner(&self, name: &str) -> Result<bool> {
        validate_bus_name(name)?;
        let msg = daemon_call("NameHasOwner")?.with_body(&[Value::from(name)])?;
        let reply = self.daemon_round_trip(msg).await?;
        match reply.into_iter().next() {
            Some(Value::Boolean(b)) => Ok(b),
            _ => Err(bad_reply("NameHasOwner")),
        }
    }

    pub(crate) async fn bus_add_match(&self, rule: &str) -> Result<()> {
        let msg = daemon_call("AddMatch")?.with_body(&[Value::from(rule)])?;
        self.call(msg).await?;
        Ok(())
    }

    pub(crate) async fn bus_remove_match(&self, rule: &str) -> Result<()> {
        let msg = daemon_call("RemoveMatch")?.with_body(&[Value::from(rule)])?;
        self.call(msg).await?;
        Ok(())
    }
}
