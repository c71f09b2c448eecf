//! Service Tests - Routing, Properties, Renames and ObjectManager
//!
//! These tests exercise the exported-object side:
//! - Renamed and disabled members on the wire and in introspection
//! - Properties.Get/Set/GetAll with access control and change signals
//! - Empty-interface dispatch and its ambiguity rule
//! - Standard interfaces: Peer, Introspectable, ObjectManager
//! - Handler failure containment

mod common;

use common::*;
use dbus_peer::{fault, CallError, Error, Interface, MatchRule, Method, Property};
use dbus_wire::{Message, MessageType, Value};
use std::time::Duration;

fn error_name(result: Result<Option<Message>, Error>) -> String {
    match result {
        Err(Error::MethodError { name, .. }) => name,
        other => panic!("expected MethodError, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_get_all_returns_exactly_the_renamed_property() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    let reply = client
        .call(
            Message::method_call(TEST_PATH, "GetAll")
                .unwrap()
                .with_interface("org.freedesktop.DBus.Properties")
                .unwrap()
                .with_body(&[Value::from(TEST_IFACE)])
                .unwrap(),
        )
        .await
        .expect("GetAll succeeds");

    match body_of(reply).into_iter().next() {
        Some(Value::Dict(_, _, entries)) => {
            assert_eq!(entries.len(), 1, "exactly one visible property");
            assert_eq!(entries[0].0, Value::Str("SomeProperty".to_string()));
            assert_eq!(
                entries[0].1,
                Value::Variant(Box::new(Value::from("SomeProperty")))
            );
        }
        other => panic!("expected dict, got {:?}", other),
    }
}

#[tokio::test]
async fn test_disabled_property_fails_with_invalid_args() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    let result = client
        .call(
            Message::method_call(TEST_PATH, "Get")
                .unwrap()
                .with_interface("org.freedesktop.DBus.Properties")
                .unwrap()
                .with_body(&[Value::from(TEST_IFACE), Value::from("DisabledProperty")])
                .unwrap(),
        )
        .await;
    assert_eq!(error_name(result), fault::INVALID_ARGS);
}

#[tokio::test]
async fn test_property_set_updates_and_emits_changed() {
    init_logging();
    let (client, server) = connected_pair().await;
    let storage = export_test_object(&server).await;

    let rule = MatchRule::signal("org.freedesktop.DBus.Properties", "PropertiesChanged")
        .expect("rule")
        .with_path(TEST_PATH)
        .expect("path");
    let mut changes = client.subscribe(rule).await.expect("subscribe");

    client
        .call(
            Message::method_call(TEST_PATH, "Set")
                .unwrap()
                .with_interface("org.freedesktop.DBus.Properties")
                .unwrap()
                .with_body(&[
                    Value::from(TEST_IFACE),
                    Value::from("SomeProperty"),
                    Value::from("updated").into_variant(),
                ])
                .unwrap(),
        )
        .await
        .expect("Set succeeds");
    assert_eq!(*storage.lock(), "updated");

    let signal = tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("signal in time")
        .expect("stream open");
    let body = signal.body_values().expect("body");
    assert_eq!(body[0], Value::from(TEST_IFACE));
    match &body[1] {
        Value::Dict(_, _, entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].0, Value::Str("SomeProperty".to_string()));
            assert_eq!(
                entries[0].1,
                Value::Variant(Box::new(Value::from("updated")))
            );
        }
        other => panic!("expected changed dict, got {:?}", other),
    }
}

#[tokio::test]
async fn test_silent_property_does_not_emit_on_set() {
    init_logging();
    let (client, server) = connected_pair().await;

    let cell = std::sync::Arc::new(parking_lot::Mutex::new(0u32));
    let get_cell = std::sync::Arc::clone(&cell);
    let set_cell = std::sync::Arc::clone(&cell);
    let iface = Interface::builder(TEST_IFACE)
        .expect("name")
        .property(
            Property::new("Quiet", "u", dbus_peer::Access::ReadWrite)
                .expect("property")
                .with_getter(move || Ok(Value::UInt32(*get_cell.lock())))
                .with_setter(move |v| {
                    if let Value::UInt32(v) = v {
                        *set_cell.lock() = v;
                    }
                    Ok(())
                })
                .emits_changed(dbus_peer::EmitsChanged::False),
        )
        .build()
        .expect("interface");
    server.export(TEST_PATH, iface).await.expect("export");

    let rule = MatchRule::signal("org.freedesktop.DBus.Properties", "PropertiesChanged")
        .expect("rule");
    let mut changes = client.subscribe(rule).await.expect("subscribe");

    client
        .call(
            Message::method_call(TEST_PATH, "Set")
                .unwrap()
                .with_interface("org.freedesktop.DBus.Properties")
                .unwrap()
                .with_body(&[
                    Value::from(TEST_IFACE),
                    Value::from("Quiet"),
                    Value::UInt32(9).into_variant(),
                ])
                .unwrap(),
        )
        .await
        .expect("Set succeeds");
    assert_eq!(*cell.lock(), 9);

    let quiet = tokio::time::timeout(Duration::from_millis(300), changes.recv()).await;
    assert!(quiet.is_err(), "no PropertiesChanged for a silent property");
}

#[tokio::test]
async fn test_wrong_access_error_names() {
    init_logging();
    let (client, server) = connected_pair().await;

    let iface = Interface::builder(TEST_IFACE)
        .expect("name")
        .property(Property::read("ReadOnly", "s", || Ok(Value::from("r"))).expect("ro"))
        .property(
            Property::new("WriteOnly", "s", dbus_peer::Access::Write)
                .expect("wo")
                .with_setter(|_| Ok(())),
        )
        .build()
        .expect("interface");
    server.export(TEST_PATH, iface).await.expect("export");

    let set_ro = client
        .call(
            Message::method_call(TEST_PATH, "Set")
                .unwrap()
                .with_interface("org.freedesktop.DBus.Properties")
                .unwrap()
                .with_body(&[
                    Value::from(TEST_IFACE),
                    Value::from("ReadOnly"),
                    Value::from("x").into_variant(),
                ])
                .unwrap(),
        )
        .await;
    assert_eq!(error_name(set_ro), fault::PROPERTY_READ_ONLY);

    let get_wo = client
        .call(
            Message::method_call(TEST_PATH, "Get")
                .unwrap()
                .with_interface("org.freedesktop.DBus.Properties")
                .unwrap()
                .with_body(&[Value::from(TEST_IFACE), Value::from("WriteOnly")])
                .unwrap(),
        )
        .await;
    assert_eq!(error_name(get_wo), fault::PROPERTY_WRITE_ONLY);
}

#[tokio::test]
async fn test_renamed_signal_delivered_exactly_once() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    let rule = MatchRule::signal(TEST_IFACE, "RenamedSignal").expect("rule");
    let mut signals = client.subscribe(rule).await.expect("subscribe");

    // Emission goes by implementation id; the wire carries the declared name
    server
        .emit_signal(TEST_PATH, TEST_IFACE, "signalNamedDifferently", &[Value::from("hello")])
        .await
        .expect("emit");

    let msg = tokio::time::timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("delivered in time")
        .expect("stream open");
    assert_eq!(msg.member.as_deref(), Some("RenamedSignal"));
    assert_eq!(msg.body_values().expect("body"), vec![Value::from("hello")]);

    let again = tokio::time::timeout(Duration::from_millis(300), signals.recv()).await;
    assert!(again.is_err(), "signal delivered exactly once");
}

#[tokio::test]
async fn test_disabled_and_renamed_members_on_the_wire() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    // The disabled method behaves as never declared
    let result = client.call(test_call("HiddenMethod", &[])).await;
    assert_eq!(error_name(result), fault::UNKNOWN_METHOD);

    // Introspection shows declared names only
    let reply = client
        .call(
            Message::method_call(TEST_PATH, "Introspect")
                .unwrap()
                .with_interface("org.freedesktop.DBus.Introspectable")
                .unwrap(),
        )
        .await
        .expect("Introspect succeeds");
    let xml = match body_of(reply).into_iter().next() {
        Some(Value::Str(xml)) => xml,
        other => panic!("expected xml, got {:?}", other),
    };
    assert!(xml.contains("SomeProperty"));
    assert!(xml.contains("RenamedSignal"));
    assert!(xml.contains("Echo"));
    assert!(!xml.contains("HiddenMethod"));
    assert!(!xml.contains("DisabledProperty"));
    assert!(!xml.contains("propertyNamedDifferently"));
    assert!(!xml.contains("signalNamedDifferently"));
}

#[tokio::test]
async fn test_empty_interface_dispatch() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    // Unique match: routed without an interface header
    let reply = client
        .call(
            Message::method_call(TEST_PATH, "Echo")
                .unwrap()
                .with_body(&[Value::from("bare")])
                .unwrap(),
        )
        .await
        .expect("bare call succeeds");
    assert_eq!(body_of(reply), vec![Value::from("bare")]);

    // A second interface with the same member makes it ambiguous
    let clashing = Interface::builder("org.test.other")
        .expect("name")
        .method(Method::new("Echo", "s", "s", |args| async move { Ok(args) }).expect("method"))
        .build()
        .expect("interface");
    server.export(TEST_PATH, clashing).await.expect("export");

    let result = client
        .call(
            Message::method_call(TEST_PATH, "Echo")
                .unwrap()
                .with_body(&[Value::from("bare")])
                .unwrap(),
        )
        .await;
    assert_eq!(error_name(result), fault::INVALID_ARGS);
}

#[tokio::test]
async fn test_signature_mismatch_and_unknown_targets() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    // Wrong argument signature is rejected before the handler runs
    let result = client.call(test_call("Echo", &[Value::UInt32(1)])).await;
    assert_eq!(error_name(result), fault::INVALID_ARGS);

    let result = client
        .call(
            Message::method_call("/org/nowhere", "Echo")
                .unwrap()
                .with_interface(TEST_IFACE)
                .unwrap()
                .with_body(&[Value::from("x")])
                .unwrap(),
        )
        .await;
    assert_eq!(error_name(result), fault::UNKNOWN_OBJECT);

    let result = client
        .call(
            Message::method_call(TEST_PATH, "Echo")
                .unwrap()
                .with_interface("org.test.missing")
                .unwrap()
                .with_body(&[Value::from("x")])
                .unwrap(),
        )
        .await;
    assert_eq!(error_name(result), fault::UNKNOWN_INTERFACE);
}

#[tokio::test]
async fn test_peer_ping_and_panic_containment() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    let reply = client
        .call(
            Message::method_call(TEST_PATH, "Ping")
                .unwrap()
                .with_interface("org.freedesktop.DBus.Peer")
                .unwrap(),
        )
        .await
        .expect("Ping succeeds");
    assert!(body_of(reply).is_empty());

    let panicking = Interface::builder("org.test.panics")
        .expect("name")
        .method(
            Method::new("Boom", "", "", |_| async { panic!("kaboom") }).expect("method"),
        )
        .build()
        .expect("interface");
    server.export(TEST_PATH, panicking).await.expect("export");

    let result = client
        .call(
            Message::method_call(TEST_PATH, "Boom")
                .unwrap()
                .with_interface("org.test.panics")
                .unwrap(),
        )
        .await;
    match result {
        Err(Error::MethodError { name, message }) => {
            assert_eq!(name, fault::FAILED);
            assert!(message.contains("kaboom"));
        }
        other => panic!("expected MethodError, got {:?}", other.map(|_| ())),
    }

    // The connection survives the panic
    let reply = client
        .call(test_call("Echo", &[Value::from("still here")]))
        .await
        .expect("later call succeeds");
    assert_eq!(body_of(reply), vec![Value::from("still here")]);
}

#[tokio::test]
async fn test_object_manager_snapshot_and_signals() {
    init_logging();
    let (client, server) = connected_pair().await;

    server.enable_object_manager("/org/test").expect("manager");
    export_test_object(&server).await;

    // Snapshot covers the descendant and its readable properties
    let reply = client
        .call(
            Message::method_call("/org/test", "GetManagedObjects")
                .unwrap()
                .with_interface("org.freedesktop.DBus.ObjectManager")
                .unwrap(),
        )
        .await
        .expect("GetManagedObjects succeeds");
    match body_of(reply).into_iter().next() {
        Some(Value::Dict(_, _, objects)) => {
            assert_eq!(objects.len(), 1);
            assert_eq!(objects[0].0, Value::ObjectPath(TEST_PATH.to_string()));
            match &objects[0].1 {
                Value::Dict(_, _, interfaces) => {
                    assert_eq!(interfaces.len(), 1);
                    assert_eq!(interfaces[0].0, Value::Str(TEST_IFACE.to_string()));
                }
                other => panic!("expected interface dict, got {:?}", other),
            }
        }
        other => panic!("expected object dict, got {:?}", other),
    }

    // Additions and removals under the manager are announced
    let added_rule = MatchRule::signal("org.freedesktop.DBus.ObjectManager", "InterfacesAdded")
        .expect("rule");
    let mut added = client.subscribe(added_rule).await.expect("subscribe");
    let removed_rule =
        MatchRule::signal("org.freedesktop.DBus.ObjectManager", "InterfacesRemoved")
            .expect("rule");
    let mut removed = client.subscribe(removed_rule).await.expect("subscribe");

    let extra = Interface::builder("org.test.extra")
        .expect("name")
        .method(Method::new("Noop", "", "", |_| async { Ok(vec![]) }).expect("method"))
        .build()
        .expect("interface");
    server
        .export("/org/test/extra", extra)
        .await
        .expect("export");

    let msg = tokio::time::timeout(Duration::from_secs(5), added.recv())
        .await
        .expect("InterfacesAdded in time")
        .expect("stream open");
    let body = msg.body_values().expect("body");
    assert_eq!(body[0], Value::ObjectPath("/org/test/extra".to_string()));

    server
        .unexport("/org/test/extra", None)
        .await
        .expect("unexport");
    let msg = tokio::time::timeout(Duration::from_secs(5), removed.recv())
        .await
        .expect("InterfacesRemoved in time")
        .expect("stream open");
    let body = msg.body_values().expect("body");
    assert_eq!(body[0], Value::ObjectPath("/org/test/extra".to_string()));
    assert_eq!(
        body[1],
        Value::Array(
            dbus_wire::Type::String,
            vec![Value::Str("org.test.extra".to_string())]
        )
    );
}

#[test]
fn test_call_error_helper_names() {
    // CallError falls back to Failed for malformed names; the router
    // sends whatever survives validation.
    let err = CallError::new("bogus name", "x");
    assert_eq!(err.name, fault::FAILED);
    let err = CallError::invalid_args("x");
    assert_eq!(err.name, fault::INVALID_ARGS);
}

#[tokio::test]
async fn test_signal_subscription_survives_unrelated_traffic() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    let rule = MatchRule::new()
        .with_type(MessageType::Signal)
        .with_interface(TEST_IFACE)
        .expect("rule");
    let mut signals = client.subscribe(rule).await.expect("subscribe");

    // Unrelated request/reply traffic is not delivered to the stream
    let reply = client
        .call(test_call("Echo", &[Value::from("noise")]))
        .await
        .expect("call");
    assert_eq!(body_of(reply), vec![Value::from("noise")]);

    server
        .emit_signal(TEST_PATH, TEST_IFACE, "RenamedSignal", &[Value::from("ping")])
        .await
        .expect("emit");
    let msg = tokio::time::timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("signal in time")
        .expect("stream open");
    assert_eq!(msg.member.as_deref(), Some("RenamedSignal"));
}
