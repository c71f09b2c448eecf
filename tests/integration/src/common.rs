//! Shared fixtures for the integration suites
#![allow(dead_code)]

use dbus_peer::{
    CallError, Connection, ConnectionBuilder, Interface, Method, Property, SignalSpec,
};
use dbus_wire::Value;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

pub const TEST_IFACE: &str = "org.test.iface";
pub const TEST_PATH: &str = "/org/test/obj";

pub fn init_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .try_init();
    });
}

/// Two authenticated connections over one socketpair: the full handshake
/// (EXTERNAL, fd negotiation, BEGIN) runs for real.
pub async fn connected_pair() -> (Connection, Connection) {
    let (a, b) = tokio::net::UnixStream::pair().expect("socketpair");
    let (client, server) = tokio::join!(
        ConnectionBuilder::peer_client(a).build(),
        ConnectionBuilder::peer_server(b, None).build(),
    );
    (client.expect("client connects"), server.expect("server connects"))
}

/// The canonical test interface:
///
/// - `Echo(s) -> s`
/// - `Slow(s) -> s` sleeps long enough to outlive any test deadline
/// - property `propertyNamedDifferently` declared as `SomeProperty`,
///   readwrite, initial value `"SomeProperty"`
/// - disabled property `DisabledProperty`
/// - signal `signalNamedDifferently` declared as `RenamedSignal(s)`
/// - disabled method `HiddenMethod`
pub fn test_interface(value: Arc<Mutex<String>>) -> Interface {
    let get_value = Arc::clone(&value);
    let set_value = Arc::clone(&value);
    Interface::builder(TEST_IFACE)
        .expect("interface name")
        .method(
            Method::new("Echo", "s", "s", |args| async move { Ok(args) })
                .expect("echo method"),
        )
        .method(
            Method::new("Slow", "s", "s", |args| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(args)
            })
            .expect("slow method"),
        )
        .method(
            Method::new("HiddenMethod", "", "", |_| async { Ok(vec![]) })
                .expect("hidden method")
                .disabled(true),
        )
        .property(
            Property::new(
                "propertyNamedDifferently",
                "s",
                dbus_peer::Access::ReadWrite,
            )
            .expect("property")
            .named("SomeProperty")
            .expect("rename")
            .with_getter(move || Ok(Value::Str(get_value.lock().clone())))
            .with_setter(move |v| match v {
                Value::Str(s) => {
                    *set_value.lock() = s;
                    Ok(())
                }
                _ => Err(CallError::invalid_args("expected a string")),
            }),
        )
        .property(
            Property::read("DisabledProperty", "s", || Ok(Value::from("hidden")))
                .expect("disabled property")
                .disabled(true),
        )
        .signal(
            SignalSpec::new("signalNamedDifferently", "s")
                .expect("signal")
                .named("RenamedSignal")
                .expect("signal rename"),
        )
        .build()
        .expect("interface builds")
}

/// Export the canonical interface on `server` and return the property
/// storage cell.
pub async fn export_test_object(server: &Connection) -> Arc<Mutex<String>> {
    let value = Arc::new(Mutex::new("SomeProperty".to_string()));
    server
        .export(TEST_PATH, test_interface(Arc::clone(&value)))
        .await
        .expect("export");
    value
}

/// Build a method call against the canonical test object
pub fn test_call(member: &str, args: &[Value]) -> dbus_wire::Message {
    dbus_wire::Message::method_call(TEST_PATH, member)
        .expect("call")
        .with_interface(TEST_IFACE)
        .expect("interface")
        .with_body(args)
        .expect("body")
}

/// Unwrap a reply into its body values
pub fn body_of(reply: Option<dbus_wire::Message>) -> Vec<Value> {
    reply
        .expect("reply expected")
        .body_values()
        .expect("body decodes")
}
