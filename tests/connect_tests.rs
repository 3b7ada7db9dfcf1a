//! Handshake, graceful disconnect and connection-level error reporting.

mod common;

use std::io;
use std::time::Duration;

use common::{MockTransport, connected_client, quiet_config};
use osmium_stomp::{
    AckMode, Client, Command, ConnectionEvent, ConnectionState, Frame, HandlerError, Message,
    StompError,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

async fn next_event(rx: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn noop(_msg: Message) -> Result<(), HandlerError> {
    Ok(())
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn connect_sends_configured_headers() {
    let transport = MockTransport::new();
    let mut broker = transport.broker();
    let config = quiet_config()
        .with_credentials("guest", "secret")
        .with_virtual_host("vhost-a")
        .with_heartbeat(5000, 7000)
        .with_connect_header("client-id", "tests");
    let client = Client::with_transport(config, transport.clone());

    let (res, connect) = tokio::join!(client.connect(), broker.accept("0,0"));
    res.expect("connect");

    assert_eq!(connect.get_header("accept-version"), Some("1.2"));
    assert_eq!(connect.get_header("host"), Some("vhost-a"));
    assert_eq!(connect.get_header("login"), Some("guest"));
    assert_eq!(connect.get_header("passcode"), Some("secret"));
    assert_eq!(connect.get_header("heart-beat"), Some("5000,7000"));
    assert_eq!(connect.get_header("client-id"), Some("tests"));

    assert_eq!(client.state(), ConnectionState::Connected);
    let info = client.manager().session_info().expect("session info");
    assert_eq!(info.session_id.as_deref(), Some("session-1"));
    assert_eq!(info.heartbeat_outgoing, None);
    assert_eq!(info.heartbeat_incoming, None);
}

#[tokio::test]
async fn host_header_defaults_to_broker_host() {
    let transport = MockTransport::new();
    let mut broker = transport.broker();
    let client = Client::with_transport(quiet_config(), transport.clone());
    let (res, connect) = tokio::join!(client.connect(), broker.accept("0,0"));
    res.expect("connect");
    assert_eq!(connect.get_header("host"), Some("broker.test"));
    assert!(!connect.has_header("login"));
}

#[tokio::test]
async fn line_breaks_in_connect_headers_are_rejected() {
    let configs = [
        quiet_config().with_credentials("guest", "secret\nlogin:admin"),
        quiet_config().with_credentials("guest\r", "secret"),
        quiet_config().with_connect_header("client-id", "a\0b"),
        quiet_config().with_connect_header("x:y", "value"),
    ];
    for config in configs {
        let transport = MockTransport::new();
        let client = Client::with_transport(config, transport.clone());
        let err = client.connect().await.expect_err("invalid header");
        assert!(matches!(err, StompError::InvalidHeader(_)), "{:?}", err);
        assert_eq!(transport.open_count(), 0);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}

#[tokio::test]
async fn colon_in_passcode_is_sent_as_is() {
    let transport = MockTransport::new();
    let mut broker = transport.broker();
    let client = Client::with_transport(
        quiet_config().with_credentials("guest", "pa:ss"),
        transport.clone(),
    );
    let (res, connect) = tokio::join!(client.connect(), broker.accept("0,0"));
    res.expect("connect");
    assert_eq!(connect.get_header("passcode"), Some("pa:ss"));
}

#[tokio::test]
async fn error_reply_is_handshake_rejected() {
    let transport = MockTransport::new();
    let mut broker = transport.broker();
    let client = Client::with_transport(quiet_config(), transport.clone());

    let (res, _) = tokio::join!(client.connect(), broker.reject("bad credentials", "denied"));
    match res {
        Err(StompError::HandshakeRejected { message, body }) => {
            assert_eq!(message, "bad credentials");
            assert_eq!(body.as_deref(), Some("denied"));
        }
        other => panic!("expected HandshakeRejected, got {:?}", other),
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn refused_transport_is_unavailable() {
    let transport = MockTransport::new();
    let client = Client::with_transport(quiet_config(), transport.clone());
    match client.connect().await {
        Err(StompError::TransportUnavailable(e)) => {
            assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused)
        }
        other => panic!("expected TransportUnavailable, got {:?}", other),
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test]
async fn close_before_connected_is_unavailable() {
    let transport = MockTransport::new();
    let mut broker = transport.broker();
    let client = Client::with_transport(quiet_config(), transport.clone());

    let (res, _) = tokio::join!(client.connect(), async move {
        let connect = broker.next_frame().await;
        assert_eq!(connect.command(), Command::Connect);
        broker.close();
    });
    match res {
        Err(StompError::TransportUnavailable(e)) => {
            assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof)
        }
        other => panic!("expected TransportUnavailable, got {:?}", other),
    }
}

#[tokio::test]
async fn garbage_reply_is_malformed() {
    let transport = MockTransport::new();
    let mut broker = transport.broker();
    let client = Client::with_transport(quiet_config(), transport.clone());

    let (res, _) = tokio::join!(client.connect(), async {
        broker.next_frame().await;
        broker.send_raw(b"BOGUS\n\n\0").await;
    });
    assert!(matches!(res, Err(StompError::MalformedFrame(_))), "{:?}", res);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn silent_broker_hits_connect_timeout() {
    let transport = MockTransport::new();
    let _broker = transport.broker();
    let client = Client::with_transport(quiet_config().with_connect_timeout(1000), transport.clone());

    match client.connect().await {
        Err(StompError::TransportUnavailable(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn cancelled_connect_leaves_registry_alone() {
    let transport = MockTransport::new();
    let mut broker = transport.broker();
    let client = Client::with_transport(quiet_config(), transport.clone());
    let id = client
        .subscribe("/queue/a", AckMode::Auto, noop)
        .await
        .expect("subscribe while disconnected");

    let token = CancellationToken::new();
    let (res, _) = tokio::join!(client.connect_with_cancel(&token), async {
        // CONNECT arrived, the broker never answers
        broker.next_frame().await;
        token.cancel();
    });

    assert!(matches!(res, Err(StompError::Cancelled)), "{:?}", res);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    let subs = client.subscriptions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].id, id);
}

#[tokio::test]
async fn second_connect_is_a_no_op() {
    let (client, transport, _broker) = connected_client(quiet_config()).await;
    client.connect().await.expect("second connect");
    assert_eq!(transport.open_count(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
}

// =============================================================================
// Disconnect
// =============================================================================

#[tokio::test]
async fn disconnect_waits_for_receipt() {
    let (client, _transport, mut broker) = connected_client(quiet_config()).await;
    client
        .subscribe("/queue/a", AckMode::Client, noop)
        .await
        .expect("subscribe");
    assert_eq!(broker.next_frame().await.command(), Command::Subscribe);
    let mut events = client.events();

    let (res, _) = tokio::join!(client.disconnect(), async {
        let frame = broker.next_frame().await;
        assert_eq!(frame.command(), Command::Disconnect);
        let receipt = frame.get_header("receipt").expect("receipt header").to_string();
        broker.send_receipt(&receipt).await;
    });
    res.expect("disconnect");

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.subscriptions().is_empty());
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Disconnected));
    assert!(broker.try_next_frame(Duration::from_millis(200)).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn disconnect_without_receipt_gives_up_after_timeout() {
    let (client, _transport, mut broker) = connected_client(quiet_config()).await;
    let mut events = client.events();

    let (res, frame) = tokio::join!(client.disconnect(), broker.next_frame());
    res.expect("disconnect completes without a receipt");
    assert_eq!(frame.command(), Command::Disconnect);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let receipt = frame.get_header("receipt").expect("receipt header");
    match next_event(&mut events).await {
        ConnectionEvent::Error(err) => match err.as_ref() {
            StompError::ReceiptTimeout(id) => assert_eq!(id, receipt),
            other => panic!("expected ReceiptTimeout, got {:?}", other),
        },
        other => panic!("expected error event, got {:?}", other),
    }
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Disconnected));
}

#[tokio::test]
async fn disconnect_when_never_connected_is_ok() {
    let client = Client::with_transport(quiet_config(), MockTransport::new());
    client.disconnect().await.expect("disconnect");
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

// =============================================================================
// Errors after CONNECTED
// =============================================================================

#[tokio::test]
async fn broker_error_frame_is_reported() {
    let (client, _transport, mut broker) = connected_client(quiet_config()).await;
    let mut events = client.events();

    broker
        .send(
            Frame::new(Command::Error)
                .header("message", "queue full")
                .set_body(b"try later".to_vec()),
        )
        .await;

    match next_event(&mut events).await {
        ConnectionEvent::Error(err) => match err.as_ref() {
            StompError::BrokerError { message, body } => {
                assert_eq!(message, "queue full");
                assert_eq!(body.as_deref(), Some("try later"));
            }
            other => panic!("expected BrokerError, got {:?}", other),
        },
        other => panic!("expected error event, got {:?}", other),
    }
}

#[tokio::test]
async fn malformed_inbound_frame_closes_without_reconnect() {
    let mut config = quiet_config().with_reconnect_delay(10, None);
    config.reconnect.enabled = true;
    let (client, transport, mut broker) = connected_client(config).await;
    let mut events = client.events();

    broker.send_raw(b"MESSAGE\nno-colon\n\n\0").await;

    match next_event(&mut events).await {
        ConnectionEvent::Error(err) => {
            assert!(matches!(err.as_ref(), StompError::MalformedFrame(_)), "{:?}", err)
        }
        other => panic!("expected error event, got {:?}", other),
    }
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Disconnected));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test]
async fn lost_link_without_reconnect_reports_link_lost() {
    let (client, transport, broker) = connected_client(quiet_config()).await;
    let mut events = client.events();

    broker.close();

    match next_event(&mut events).await {
        ConnectionEvent::Error(err) => {
            assert!(matches!(err.as_ref(), StompError::LinkLost), "{:?}", err)
        }
        other => panic!("expected error event, got {:?}", other),
    }
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Disconnected));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(transport.open_count(), 1);
}
