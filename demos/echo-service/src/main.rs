//! Echo Service Example
//!
//! Exports `org.example.Echo` on one end of a socketpair and drives it
//! from the other end: a method call, a property read and write, and a
//! signal subscription. Everything runs in one process over a direct
//! peer-to-peer connection, so no bus daemon is needed.
//!
//! Usage:
//!   cargo run -p echo-service

use dbus_peer::{CallError, Connection, ConnectionBuilder, Interface, Method, Property, SignalSpec};
use dbus_wire::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const ECHO_INTERFACE: &str = "org.example.Echo";
const ECHO_PATH: &str = "/org/example/Echo";

fn create_interface(calls: Arc<AtomicU32>) -> dbus_peer::Result<Interface> {
    let counter = Arc::clone(&calls);
    Interface::builder(ECHO_INTERFACE)?
        .method(Method::new("Echo", "s", "s", move |args| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                info!("Echo called");
                Ok(args)
            }
        })?)
        .method(Method::new("Reverse", "s", "s", |args| async move {
            match args.into_iter().next() {
                Some(Value::Str(s)) => {
                    Ok(vec![Value::Str(s.chars().rev().collect::<String>())])
                }
                _ => Err(CallError::invalid_args("expected a string")),
            }
        })?)
        .property(Property::read("CallCount", "u", move || {
            Ok(Value::UInt32(calls.load(Ordering::Relaxed)))
        })?)
        .signal(SignalSpec::new("Echoed", "s")?)
        .build()
}

async fn run_server(conn: &Connection) -> dbus_peer::Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    conn.export(ECHO_PATH, create_interface(calls)?).await?;
    info!("echo object exported at {}", ECHO_PATH);
    Ok(())
}

async fn run_client(conn: &Connection, server: &Connection) -> dbus_peer::Result<()> {
    // The peer ignores the destination on a direct connection; any valid
    // name will do for the proxy.
    let proxy = conn.proxy_object(":0.1", ECHO_PATH).await?;
    let echo = proxy
        .interface(ECHO_INTERFACE)
        .expect("echo interface introspected");

    let reply = echo.call("Echo", &[Value::from("hello world")]).await?;
    info!("Echo replied: {:?}", reply);

    let reversed = echo.call("Reverse", &[Value::from("hello world")]).await?;
    info!("Reverse replied: {:?}", reversed);

    let count = echo.get_property("CallCount").await?;
    info!("CallCount is {:?}", count);

    let mut echoes = echo.receive_signal("Echoed").await?;
    server
        .emit_signal(ECHO_PATH, ECHO_INTERFACE, "Echoed", &[Value::from("hello world")])
        .await?;
    if let Some(signal) = echoes.recv().await {
        info!("signal received: {:?}", signal.body_values()?);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> dbus_peer::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("set tracing subscriber");

    let (client_end, server_end) = tokio::net::UnixStream::pair()?;
    let (client, server) = tokio::try_join!(
        ConnectionBuilder::peer_client(client_end).build(),
        ConnectionBuilder::peer_server(server_end, None).build(),
    )?;

    run_server(&server).await?;
    run_client(&client, &server).await?;

    client.disconnect().await;
    info!("done");
    Ok(())
}
