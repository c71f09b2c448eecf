//! Introspection Example
//!
//! Connects to the session bus, proxies the daemon itself, and prints
//! what the proxy learned: interfaces, their members, and the daemon's
//! answers to a few queries.
//!
//! Usage:
//!   cargo run -p introspect

use dbus_peer::{Connection, DBUS_PATH, DBUS_SERVICE};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> dbus_peer::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("set tracing subscriber");

    let conn = Connection::session().await?;
    info!(
        unique_name = conn.unique_name().as_deref().unwrap_or("?"),
        "connected to the session bus"
    );

    let proxy = conn.proxy_object(DBUS_SERVICE, DBUS_PATH).await?;
    for name in proxy.interface_names() {
        let iface = proxy.interface(&name).expect("listed interface");
        println!("{}", name);
        for method in &iface.info().methods {
            println!(
                "  method {}({}) -> ({})",
                method.name, method.in_sig, method.out_sig
            );
        }
        for prop in &iface.info().properties {
            println!("  property {}: {} [{}]", prop.name, prop.ty, prop.access.as_str());
        }
        for signal in &iface.info().signals {
            println!("  signal {}({})", signal.name, signal.sig);
        }
    }

    let names = conn.list_names().await?;
    println!("\n{} names on the bus", names.len());

    let id = conn.get_id().await?;
    println!("daemon id: {}", id);

    conn.disconnect().await;
    Ok(())
}
