//! Async D-Bus client and service runtime
//!
//! This crate connects to a message bus (or a direct peer), speaks the
//! SASL handshake, and runs the message pump: method calls are correlated
//! with replies by serial, signals fan out to match-rule subscribers, and
//! inbound calls are routed to exported objects with the standard
//! `org.freedesktop.DBus.*` interfaces provided automatically.
//!
//! # Exporting an object
//!
//! ```no_run
//! use dbus_peer::{Connection, Interface, Method, RequestNameFlags};
//!
//! #[tokio::main]
//! async fn main() -> dbus_peer::Result<()> {
//!     let conn = Connection::session().await?;
//!
//!     let iface = Interface::builder("org.example.Echo")?
//!         .method(Method::new("Echo", "s", "s", |args| async move {
//!             Ok(args)
//!         })?)
//!         .build()?;
//!     conn.export("/org/example/Echo", iface).await?;
//!     conn.request_name("org.example.Echo", RequestNameFlags::new())
//!         .await?;
//!
//!     std::future::pending::<()>().await;
//!     Ok(())
//! }
//! ```
//!
//! # Calling a remote object
//!
//! ```no_run
//! use dbus_peer::Connection;
//! use dbus_wire::Value;
//!
//! #[tokio::main]
//! async fn main() -> dbus_peer::Result<()> {
//!     let conn = Connection::session().await?;
//!     let proxy = conn
//!         .proxy_object("org.example.Echo", "/org/example/Echo")
//!         .await?;
//!     let echo = proxy.interface("org.example.Echo").expect("introspected");
//!     let reply = echo.call("Echo", &[Value::from("hello")]).await?;
//!     println!("{:?}", reply);
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod auth;
pub mod bus;
pub mod connection;
pub mod error;
pub mod interface;
pub mod introspect;
pub mod match_rule;
pub mod proxy;
pub mod service;
mod sys;
pub mod transport;

pub use address::BusAddress;
pub use auth::{AuthMechanism, AuthResult};
pub use bus::{
    ReleaseNameReply, RequestNameFlags, RequestNameReply, DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE,
};
pub use connection::{
    Connection, ConnectionBuilder, ConnectionState, MessageStream, DEFAULT_CALL_TIMEOUT,
};
pub use error::{fault, Error, Result};
pub use interface::{
    Access, CallError, EmitsChanged, Interface, InterfaceBuilder, Method, MethodHandler,
    MethodResult, Property, PropertyGetter, PropertySetter, SignalSpec,
};
pub use introspect::{InterfaceInfo, MethodInfo, Node, PropertyInfo, SignalInfo};
pub use match_rule::MatchRule;
pub use proxy::{ProxyInterface, ProxyObject, SignalStream};
pub use service::{INTROSPECTABLE_IFACE, OBJECT_MANAGER_IFACE, PEER_IFACE, PROPERTIES_IFACE};
pub use transport::Transport;

/// Re-export of the wire layer
pub use dbus_wire as wire;
