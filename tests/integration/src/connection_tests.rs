//! Connection Tests - Correlation, Cancellation and Teardown
//!
//! These tests drive two real connections over a socketpair:
//! - Method call round-trips and serial ordering
//! - Reply deadlines and the NO_REPLY_EXPECTED fast path
//! - Call cancellation with silent late-reply disposal
//! - Disconnect failing every pending call

mod common;

use common::*;
use dbus_peer::Error;
use dbus_wire::Value;
use futures::future::join_all;
use std::time::Duration;

#[tokio::test]
async fn test_echo_round_trip() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    let reply = client
        .call(test_call("Echo", &[Value::from("hello")]))
        .await
        .expect("call succeeds");
    assert_eq!(body_of(reply), vec![Value::from("hello")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_keep_serials_ordered() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;
    let mut tap = server.monitor();

    const CALLS: usize = 50;
    let tasks: Vec<_> = (0..CALLS)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let payload = format!("msg-{}", i);
                let reply = client
                    .call(test_call("Echo", &[Value::from(payload.as_str())]))
                    .await
                    .expect("call succeeds");
                assert_eq!(body_of(reply), vec![Value::from(payload.as_str())]);
            })
        })
        .collect();
    join_all(tasks).await.into_iter().for_each(|r| r.expect("join"));

    // The server saw every request with strictly increasing serials
    let mut last = 0;
    let mut seen = 0;
    while seen < CALLS {
        let msg = tokio::time::timeout(Duration::from_secs(5), tap.recv())
            .await
            .expect("tap alive")
            .expect("message");
        if msg.member.as_deref() == Some("Echo") {
            assert!(
                msg.serial > last,
                "serial {} not above {}",
                msg.serial,
                last
            );
            last = msg.serial;
            seen += 1;
        }
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_no_reply_expected_resolves_on_write() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    // Slow would stall for ~30s; the no-reply call must return at once
    let msg = test_call("Slow", &[Value::from("x")]).with_no_reply();
    let started = std::time::Instant::now();
    let reply = client.call(msg).await.expect("send succeeds");
    assert!(reply.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_call_timeout() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    let result = client
        .call_with_timeout(
            test_call("Slow", &[Value::from("x")]),
            Some(Duration::from_millis(200)),
        )
        .await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_cancelled_call_drops_late_reply_silently() {
    init_logging();
    let (client, server) = connected_pair().await;

    // A handler that replies only when released
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let release_rx = std::sync::Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
    let iface = dbus_peer::Interface::builder(TEST_IFACE)
        .expect("name")
        .method(
            dbus_peer::Method::new("Gated", "", "", move |_| {
                let release_rx = std::sync::Arc::clone(&release_rx);
                async move {
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    Ok(vec![])
                }
            })
            .expect("method"),
        )
        .build()
        .expect("interface");
    server.export(TEST_PATH, iface).await.expect("export");

    let call = test_call("Gated", &[]);
    {
        let fut = client.call_with_timeout(call, None);
        tokio::pin!(fut);
        assert!(futures::poll!(fut.as_mut()).is_pending());
        // Dropping the pinned future cancels the call
    }
    assert_eq!(client.pending_calls(), 0, "cancelled slot removed");

    // Release the handler: its reply arrives with no matching slot and
    // the connection keeps working.
    release_tx.send(()).expect("handler waiting");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let ping = dbus_wire::Message::method_call(TEST_PATH, "Ping")
        .expect("call")
        .with_interface("org.freedesktop.DBus.Peer")
        .expect("interface");
    let reply = client.call(ping).await.expect("connection still alive");
    assert!(reply.is_some());
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_disconnect_fails_pending_calls_and_empties_table() {
    init_logging();
    let (client, server) = connected_pair().await;
    export_test_object(&server).await;

    let mut in_flight = Vec::new();
    for _ in 0..5 {
        let client = client.clone();
        in_flight.push(tokio::spawn(async move {
            client
                .call_with_timeout(test_call("Slow", &[Value::from("x")]), None)
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.disconnect().await;
    for task in in_flight {
        let result = task.await.expect("join");
        assert!(
            matches!(result, Err(Error::Disconnected)),
            "expected Disconnected, got {:?}",
            result.map(|_| ())
        );
    }
    assert_eq!(client.pending_calls(), 0, "call table empty after disconnect");
}

#[tokio::test]
async fn test_method_error_surfaces_name_and_message() {
    init_logging();
    let (client, server) = connected_pair().await;

    let iface = dbus_peer::Interface::builder(TEST_IFACE)
        .expect("name")
        .method(
            dbus_peer::Method::new("Fail", "", "", |_| async {
                Err(dbus_peer::CallError::new(
                    "org.test.Error.Custom",
                    "deliberate",
                ))
            })
            .expect("method"),
        )
        .build()
        .expect("interface");
    server.export(TEST_PATH, iface).await.expect("export");

    let result = client.call(test_call("Fail", &[])).await;
    match result {
        Err(Error::MethodError { name, message }) => {
            assert_eq!(name, "org.test.Error.Custom");
            assert_eq!(message, "deliberate");
        }
        other => panic!("expected MethodError, got {:?}", other.map(|_| ())),
    }
}
