//! End-to-end tunnel tests against the in-process mock relay.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{spawn_echo_server, MockRelay, TestTokenProvider};
use futures_util::future::BoxFuture;
use hctunnel::control::{self, ControlConfig};
use hctunnel::metrics::Metrics;
use hctunnel::{listener, sender};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn listener_config(
    relay: &MockRelay,
    tp: Arc<TestTokenProvider>,
    allow: &[&str],
    metrics: Option<Arc<Metrics>>,
) -> listener::Config {
    let mut cfg = listener::Config::new(relay.endpoint(), "test-hc".to_string(), tp);
    cfg.allow_list = allow.iter().map(|s| s.to_string()).collect();
    cfg.metrics = metrics;
    cfg
}

/// A client byte pattern travels sender → relay → listener → echo server
/// and back, byte-exact.
#[tokio::test]
async fn test_echo_through_port_forward() {
    let relay = MockRelay::start().await;
    let echo = spawn_echo_server().await;
    let cancel = CancellationToken::new();

    let cfg = listener_config(&relay, TestTokenProvider::new(), &["127.0.0.0/8:*"], None);
    tokio::spawn(listener::listen_and_serve(cancel.child_token(), cfg));
    relay.wait_for_controls(1).await;

    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local.local_addr().unwrap();
    let pf = sender::PortForwardConfig {
        endpoint: relay.endpoint(),
        entity_path: "test-hc".to_string(),
        token_provider: TestTokenProvider::new(),
        target: format!("127.0.0.1:{}", echo.port()),
        bind_address: String::new(),
        tcp_keepalive: Duration::from_secs(30),
        dial_timeout: Duration::ZERO,
        metrics: None,
    };
    tokio::spawn(sender::port_forward_listener(cancel.child_token(), local, pf));

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    client.write_all(b"hello tunnel\n\0").await.unwrap();

    let mut echoed = [0u8; 14];
    timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"hello tunnel\n\0");

    cancel.cancel();
}

/// A target outside the allowlist comes back as SOCKS5 host-unreachable
/// and one allowlist rejection lands in the listener's metrics.
#[tokio::test]
async fn test_socks5_rejected_by_allowlist() {
    let relay = MockRelay::start().await;
    let echo = spawn_echo_server().await;
    let cancel = CancellationToken::new();
    let metrics = Metrics::new(0);

    let cfg = listener_config(
        &relay,
        TestTokenProvider::new(),
        &["192.0.2.0/24:*"],
        Some(Arc::clone(&metrics)),
    );
    tokio::spawn(listener::listen_and_serve(cancel.child_token(), cfg));
    relay.wait_for_controls(1).await;

    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local.local_addr().unwrap();
    let socks = sender::Socks5Config {
        endpoint: relay.endpoint(),
        entity_path: "test-hc".to_string(),
        token_provider: TestTokenProvider::new(),
        bind_address: String::new(),
        tcp_keepalive: Duration::from_secs(30),
        dial_timeout: Duration::ZERO,
        metrics: None,
    };
    tokio::spawn(sender::socks5_proxy_listener(cancel.child_token(), local, socks));

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    client.write_all(&[5, 1, 0]).await.unwrap();
    let mut auth = [0u8; 2];
    client.read_exact(&mut auth).await.unwrap();
    assert_eq!(auth, [5, 0]);

    let mut req = vec![5, 1, 0, 1, 127, 0, 0, 1];
    req.extend_from_slice(&echo.port().to_be_bytes());
    client.write_all(&req).await.unwrap();

    let mut reply = [0u8; 10];
    timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .expect("socks5 reply timed out")
        .unwrap();
    assert_eq!(reply[1], hctunnel::socks5::REP_HOST_UNREACHABLE);

    // Connection is terminal after the failure reply.
    let mut rest = Vec::new();
    let n = timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .expect("close timed out")
        .unwrap();
    assert_eq!(n, 0);

    let text = metrics.to_prometheus();
    assert!(
        text.contains(r#"hctunnel_connection_errors_total{role="listener",reason="allowlist_rejected"} 1"#),
        "{text}"
    );

    cancel.cancel();
}

fn noop_handler() -> control::AcceptHandler {
    Arc::new(|_token, _ws| -> BoxFuture<'static, ()> { Box::pin(async {}) })
}

/// When the relay stops answering pings the session ends and the listener
/// dials again, fetching a fresh token for the new session.
#[tokio::test]
async fn test_reconnect_on_ping_failure() {
    let relay = MockRelay::start().await;
    let cancel = CancellationToken::new();
    let tp = TestTokenProvider::new();

    let mut cfg = ControlConfig::new(
        relay.endpoint(),
        "test-hc".to_string(),
        tp.clone(),
        noop_handler(),
    );
    cfg.ping_interval = Duration::from_millis(200);
    cfg.ping_timeout = Duration::from_millis(300);
    tokio::spawn(control::listen_and_serve(cancel.child_token(), cfg));

    relay.wait_for_controls(1).await;
    relay.stall_control();

    timeout(Duration::from_secs(12), relay.wait_for_controls(2))
        .await
        .expect("listener did not reconnect after ping failure");
    assert!(tp.calls() >= 2, "expected a token per session, got {}", tp.calls());

    cancel.cancel();
}

/// Persistent token failure at a renewal tick cancels the session; the
/// reconnect loop then establishes a fresh control channel.
#[tokio::test]
async fn test_reconnect_on_renewal_failure() {
    let relay = MockRelay::start().await;
    let cancel = CancellationToken::new();
    // Call 1 connects; calls 2-4 are the three failed renewal attempts;
    // call 5 backs the reconnect dial.
    let tp = TestTokenProvider::failing_between(2, 4);

    let mut cfg = ControlConfig::new(
        relay.endpoint(),
        "test-hc".to_string(),
        tp.clone(),
        noop_handler(),
    );
    cfg.renew_interval = Duration::from_millis(200);
    tokio::spawn(control::listen_and_serve(cancel.child_token(), cfg));

    relay.wait_for_controls(1).await;
    // The renewal retries themselves take 15s (5s + 10s spacing) before the
    // session is cancelled, so this deadline is generous.
    timeout(Duration::from_secs(30), relay.wait_for_controls(2))
        .await
        .expect("listener did not reconnect after renewal failure");
    assert!(tp.calls() >= 5, "got {} token calls", tp.calls());

    cancel.cancel();
}

/// connect_io drives the same pipeline as stdio connect mode.
#[tokio::test]
async fn test_connect_io_round_trip() {
    let relay = MockRelay::start().await;
    let echo = spawn_echo_server().await;
    let cancel = CancellationToken::new();

    let cfg = listener_config(&relay, TestTokenProvider::new(), &["127.0.0.0/8:*"], None);
    tokio::spawn(listener::listen_and_serve(cancel.child_token(), cfg));
    relay.wait_for_controls(1).await;

    let (mut client, local) = tokio::io::duplex(4096);
    let ccfg = sender::ConnectConfig {
        endpoint: relay.endpoint(),
        entity_path: "test-hc".to_string(),
        token_provider: TestTokenProvider::new(),
        target: format!("127.0.0.1:{}", echo.port()),
        dial_timeout: Duration::ZERO,
        metrics: None,
    };
    let conn_cancel = cancel.child_token();
    tokio::spawn(async move {
        let _ = sender::connect_io(conn_cancel, ccfg, local).await;
    });

    client.write_all(b"ping over stdio").await.unwrap();
    let mut got = [0u8; 15];
    timeout(Duration::from_secs(5), client.read_exact(&mut got))
        .await
        .expect("stdio echo timed out")
        .unwrap();
    assert_eq!(&got, b"ping over stdio");

    cancel.cancel();
}

/// A sender pointed at an entity with no listener gets a dead rendezvous
/// and the connection fails rather than hanging.
#[tokio::test]
async fn test_sender_fails_without_listener() {
    let relay = MockRelay::start().await;
    let cancel = CancellationToken::new();

    let (client, local) = tokio::io::duplex(64);
    let ccfg = sender::ConnectConfig {
        endpoint: relay.endpoint(),
        entity_path: "test-hc".to_string(),
        token_provider: TestTokenProvider::new(),
        target: "127.0.0.1:1".to_string(),
        dial_timeout: Duration::ZERO,
        metrics: None,
    };
    let result = timeout(
        Duration::from_secs(10),
        sender::connect_io(cancel, ccfg, local),
    )
    .await
    .expect("sender hung with no listener");
    assert!(result.is_err());
    drop(client);
}
