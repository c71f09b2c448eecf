//! Proxy Tests - Introspection-Driven Clients
//!
//! These tests build proxies against a live exported object:
//! - Interface discovery from introspection XML
//! - Signature-checked method calls
//! - Property access through org.freedesktop.DBus.Properties
//! - Signal subscription with local member filtering

mod common;

use common::*;
use dbus_peer::Error;
use dbus_wire::Value;
use std::time::Duration;

/// Any valid bus name works as the proxy destination on a direct
/// connection: the peer routes by path, not by name.
const DEST: &str = "org.test.peer";

#[tokio::test]
async fn test_proxy_discovers_interfaces() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    let proxy = client.proxy_object(DEST, TEST_PATH).await.expect("proxy");
    assert_eq!(proxy.destination(), DEST);
    assert_eq!(proxy.path(), TEST_PATH);

    let names = proxy.interface_names();
    assert!(names.contains(&TEST_IFACE.to_string()));
    assert!(names.contains(&"org.freedesktop.DBus.Peer".to_string()));
    assert!(names.contains(&"org.freedesktop.DBus.Properties".to_string()));

    let echo = proxy.interface(TEST_IFACE).expect("test interface");
    let method = echo.info().method("Echo").expect("echo method");
    assert_eq!(method.in_sig.to_string(), "s");
    assert_eq!(method.out_sig.to_string(), "s");
    // Disabled members never reached the XML
    assert!(echo.info().method("HiddenMethod").is_none());
    assert!(echo.info().property("DisabledProperty").is_none());
}

#[tokio::test]
async fn test_proxy_call_round_trip() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    let proxy = client.proxy_object(DEST, TEST_PATH).await.expect("proxy");
    let echo = proxy.interface(TEST_IFACE).expect("test interface");

    let reply = echo
        .call("Echo", &[Value::from("via proxy")])
        .await
        .expect("call succeeds");
    assert_eq!(reply, vec![Value::from("via proxy")]);
}

#[tokio::test]
async fn test_proxy_rejects_bad_arguments_locally() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;
    let mut tap = server.monitor();

    let proxy = client.proxy_object(DEST, TEST_PATH).await.expect("proxy");
    let echo = proxy.interface(TEST_IFACE).expect("test interface");

    let result = echo.call("Echo", &[Value::UInt32(1)]).await;
    assert!(matches!(result, Err(Error::Wire(_))), "local type check");

    let result = echo.call("NoSuchMethod", &[]).await;
    assert!(matches!(result, Err(Error::UnknownMember { .. })));

    // Neither bad call reached the wire after introspection finished
    let quiet = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match tap.recv().await {
                Some(msg) if msg.member.as_deref() == Some("Echo") => break,
                Some(_) => continue,
                None => break,
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "no Echo call observed on the wire");
}

#[tokio::test]
async fn test_proxy_property_access() {
    init_logging();
    let (client, server) = connected_pair().await;
    let storage = export_test_object(&server).await;

    let proxy = client.proxy_object(DEST, TEST_PATH).await.expect("proxy");
    let iface = proxy.interface(TEST_IFACE).expect("test interface");

    let value = iface.get_property("SomeProperty").await.expect("get");
    assert_eq!(value, Value::from("SomeProperty"));

    iface
        .set_property("SomeProperty", Value::from("rewritten"))
        .await
        .expect("set");
    assert_eq!(*storage.lock(), "rewritten");

    let all = iface.get_all_properties().await.expect("get all");
    assert_eq!(all.len(), 1);
    assert_eq!(all.get("SomeProperty"), Some(&Value::from("rewritten")));

    let missing = iface.get_property("DisabledProperty").await;
    assert!(matches!(missing, Err(Error::UnknownMember { .. })));
}

#[tokio::test]
async fn test_proxy_signal_filtering_by_member() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    let proxy = client.proxy_object(DEST, TEST_PATH).await.expect("proxy");
    let iface = proxy.interface(TEST_IFACE).expect("test interface");

    let mut renamed = iface
        .receive_signal("RenamedSignal")
        .await
        .expect("subscribe");

    // A different signal on the same interface is filtered out locally,
    // so only the subscribed member comes through.
    let other = dbus_wire::Message::signal(TEST_PATH, TEST_IFACE, "Unrelated")
        .expect("signal")
        .with_body(&[Value::from("ignore me")])
        .expect("body");
    server.send(other).await.expect("send");
    server
        .emit_signal(
            TEST_PATH,
            TEST_IFACE,
            "signalNamedDifferently",
            &[Value::from("hello")],
        )
        .await
        .expect("emit");

    let msg = tokio::time::timeout(Duration::from_secs(5), renamed.recv())
        .await
        .expect("signal in time")
        .expect("stream open");
    assert_eq!(msg.member.as_deref(), Some("RenamedSignal"));
    assert_eq!(msg.body_values().expect("body"), vec![Value::from("hello")]);

    let extra = tokio::time::timeout(Duration::from_millis(300), renamed.recv()).await;
    assert!(extra.is_err(), "only the subscribed member is delivered");
}

#[tokio::test]
async fn test_proxy_subscribing_unknown_signal_fails() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    let proxy = client.proxy_object(DEST, TEST_PATH).await.expect("proxy");
    let iface = proxy.interface(TEST_IFACE).expect("test interface");
    let result = iface.receive_signal("NoSuchSignal").await;
    assert!(matches!(result, Err(Error::UnknownMember { .. })));
}
