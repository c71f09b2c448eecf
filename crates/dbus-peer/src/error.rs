//! Error types for the connection runtime

use thiserror::Error;

/// Well-known error names sent in ERROR replies
pub mod fault {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const PROPERTY_WRITE_ONLY: &str = "org.freedesktop.DBus.Error.PropertyWriteOnly";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
}

/// Runtime errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] dbus_wire::WireError),

    #[error("cannot parse bus address {0:?}")]
    AddressParse(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The connection is closed; all pending calls fail with this
    #[error("disconnected")]
    Disconnected,

    /// No reply arrived within the caller's deadline
    #[error("call timed out")]
    Timeout,

    /// ERROR reply from the remote peer, surfaced verbatim
    #[error("{name}: {message}")]
    MethodError { name: String, message: String },

    #[error("connection is not in the {0} state")]
    InvalidState(&'static str),

    #[error("file descriptor passing was not negotiated on this connection")]
    FdPassingDisabled,

    #[error("invalid interface declaration: {0}")]
    Declaration(String),

    #[error("cannot parse introspection data: {0}")]
    Introspection(String),

    /// A proxy was asked for a member its introspection data lacks
    #[error("no member {member:?} on interface {interface:?}")]
    UnknownMember { interface: String, member: String },
}

impl Error {
    /// Build a remote-error value from an ERROR reply
    pub fn method_error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MethodError {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Whether this error represents a normal connection close
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Disconnected => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;
