//! Listener control channel.
//!
//! The listener keeps one outbound WebSocket open to the relay. The relay
//! pushes accept notifications on it; we push token renewals back and ping
//! it to detect dead peers. The session supervises the read loop, the
//! renewal loop, the ping loop, and one task per in-flight accepted
//! connection; the outer loop reconnects with exponential backoff
//! whenever a session ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::future::BoxFuture;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::auth::TokenProvider;
use crate::dial::{redact_token, WsConn, DEFAULT_DIAL_TIMEOUT};
use crate::endpoint::{endpoint_to_wss, path_escape, query_escape, resource_uri};
use crate::socket::ConnSemaphore;

pub const RENEW_INTERVAL: Duration = Duration::from_secs(45 * 60);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);
pub const RECONNECT_MIN: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX: Duration = Duration::from_secs(30);

const MAX_RENEW_RETRIES: u32 = 3;
const RENEW_RETRY_STEP: Duration = Duration::from_secs(5);

type SharedSink = Arc<Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>>;

/// Called for each accepted rendezvous connection. The handler owns the
/// WebSocket, performs the envelope exchange and bridging, and closes the
/// socket before returning.
pub type AcceptHandler =
    Arc<dyn Fn(CancellationToken, WsConn) -> BoxFuture<'static, ()> + Send + Sync>;

/// Notification pushed by the relay when a sender is waiting to be paired.
#[derive(Debug, Deserialize)]
pub struct AcceptNotification {
    /// Fully-qualified rendezvous URL, dialed verbatim.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "connectHeaders")]
    pub connect_headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ControlMessage {
    accept: Option<AcceptNotification>,
}

/// Parameters for the listener control channel.
pub struct ControlConfig {
    pub endpoint: String,
    pub entity_path: String,
    pub token_provider: Arc<dyn TokenProvider>,
    pub handler: AcceptHandler,
    /// Max concurrent accepted connections; zero means unlimited.
    pub max_connections: usize,
    /// Per-attempt timeout for the control and rendezvous dials.
    pub dial_timeout: Duration,
    pub renew_interval: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    /// Called when the control channel connects. Optional.
    pub on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Called when an established control channel disconnects. Optional.
    pub on_disconnect: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl ControlConfig {
    pub fn new(
        endpoint: String,
        entity_path: String,
        token_provider: Arc<dyn TokenProvider>,
        handler: AcceptHandler,
    ) -> Self {
        Self {
            endpoint,
            entity_path,
            token_provider,
            handler,
            max_connections: 0,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            renew_interval: RENEW_INTERVAL,
            ping_interval: PING_INTERVAL,
            ping_timeout: PING_TIMEOUT,
            on_connect: None,
            on_disconnect: None,
        }
    }
}

/// Connects to the relay control channel and accepts incoming connections,
/// reconnecting with exponential backoff until `cancel` fires. Returns
/// `Ok(())` on cancellation.
pub async fn listen_and_serve(cancel: CancellationToken, cfg: ControlConfig) -> Result<()> {
    let cfg = Arc::new(cfg);
    let mut delay = RECONNECT_MIN;
    loop {
        let start = Instant::now();
        let (connected, err) = run_control_loop(&cancel, &cfg).await;

        if cancel.is_cancelled() {
            if connected {
                if let Some(f) = &cfg.on_disconnect {
                    f();
                }
            }
            return Ok(());
        }

        // A session that outlived the backoff cap earns a fresh start.
        if start.elapsed() > RECONNECT_MAX {
            delay = RECONNECT_MIN;
        }
        warn!("control channel disconnected, reconnecting in {delay:?}: {err:#}");
        if connected {
            if let Some(f) = &cfg.on_disconnect {
                f();
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = sleep(delay) => {}
        }
        delay = next_delay(delay);
    }
}

fn next_delay(delay: Duration) -> Duration {
    (delay * 2).min(RECONNECT_MAX)
}

/// Runs one control-channel session. Returns whether the channel reached
/// the connected state, together with the error that ended the session.
async fn run_control_loop(
    cancel: &CancellationToken,
    cfg: &Arc<ControlConfig>,
) -> (bool, anyhow::Error) {
    let res_uri = resource_uri(&cfg.endpoint, &cfg.entity_path);
    let token = match cfg.token_provider.get_token(&res_uri).await {
        Ok(t) => t,
        Err(e) => return (false, e.context("get token")),
    };

    let listen_url = format!(
        "{}/$hc/{}?sb-hc-action=listen&sb-hc-token={}",
        endpoint_to_wss(&cfg.endpoint),
        path_escape(&cfg.entity_path),
        query_escape(&token)
    );

    let ws = match timeout(cfg.dial_timeout, connect_async(&listen_url)).await {
        Ok(Ok((ws, _resp))) => ws,
        Ok(Err(e)) => {
            return (
                false,
                anyhow!("dial control: {}", redact_token(&e.to_string())),
            )
        }
        Err(_) => {
            return (
                false,
                anyhow!("dial control: timed out after {:?}", cfg.dial_timeout),
            )
        }
    };

    info!("control channel connected entity={}", cfg.entity_path);
    if let Some(f) = &cfg.on_connect {
        f();
    }

    // Cancelled by ping or renewal failure to force a reconnect; also the
    // parent of every in-flight handler.
    let loop_token = cancel.child_token();

    let (sink, mut stream) = ws.split();
    let sink: SharedSink = Arc::new(Mutex::new(sink));
    let (pong_tx, pong_rx) = watch::channel(());

    let sem = ConnSemaphore::new(cfg.max_connections);
    let mut handlers = JoinSet::new();

    let renew_task = tokio::spawn(renew_loop(
        loop_token.clone(),
        sink.clone(),
        res_uri,
        cfg.token_provider.clone(),
        cfg.renew_interval,
    ));
    let ping_task = tokio::spawn(ping_loop(
        loop_token.clone(),
        sink.clone(),
        pong_rx,
        cfg.ping_interval,
        cfg.ping_timeout,
    ));

    let err = loop {
        let msg = tokio::select! {
            _ = loop_token.cancelled() => break anyhow!("control session cancelled"),
            msg = stream.next() => msg,
        };
        match msg {
            None => break anyhow!("read control: connection closed"),
            Some(Err(e)) => break anyhow!("read control: {e}"),
            Some(Ok(Message::Pong(_))) => {
                let _ = pong_tx.send(());
            }
            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                let parsed: ControlMessage = match serde_json::from_slice(&msg.into_data()) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("invalid control message: {e}");
                        continue;
                    }
                };
                let Some(accept) = parsed.accept else {
                    continue;
                };
                let Some(permit) = sem.try_acquire() else {
                    warn!("max connections reached, dropping accept");
                    continue;
                };
                let handler = cfg.handler.clone();
                let token = loop_token.clone();
                let dial_timeout = cfg.dial_timeout;
                handlers.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = handle_accept(token, &accept.address, dial_timeout, handler).await
                    {
                        warn!("accept failed: {e:#}");
                    }
                });
            }
            Some(Ok(_)) => {} // control frames the library answers itself
        }
    };

    // End the session: stop renew/ping, then drain in-flight handlers
    // before the error propagates to the reconnect loop.
    loop_token.cancel();
    let _ = renew_task.await;
    let _ = ping_task.await;
    while handlers.join_next().await.is_some() {}

    (true, err)
}

/// Dials the rendezvous address from an accept notification and hands the
/// WebSocket to the accept handler. Handler failures never terminate the
/// control session.
async fn handle_accept(
    token: CancellationToken,
    address: &str,
    dial_timeout: Duration,
    handler: AcceptHandler,
) -> Result<()> {
    let ws = match timeout(dial_timeout, connect_async(address)).await {
        Ok(Ok((ws, _resp))) => ws,
        Ok(Err(e)) => {
            return Err(anyhow!(
                "dial rendezvous: {}",
                redact_token(&e.to_string())
            ))
        }
        Err(_) => return Err(anyhow!("dial rendezvous: timed out after {dial_timeout:?}")),
    };
    handler(token, ws).await;
    Ok(())
}

async fn renew_loop(
    token: CancellationToken,
    sink: SharedSink,
    res_uri: String,
    tp: Arc<dyn TokenProvider>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the immediate first tick
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = renew_once(&token, &sink, &res_uri, tp.as_ref()).await {
            warn!("token renewal failed, forcing reconnect: {e:#}");
            token.cancel();
            return;
        }
    }
}

/// Renews the session token, retrying `GetToken` up to three times with
/// 5 s and 10 s spacing. A write failure is a connection problem and is
/// returned without retry.
async fn renew_once(
    token: &CancellationToken,
    sink: &SharedSink,
    res_uri: &str,
    tp: &dyn TokenProvider,
) -> Result<()> {
    let mut last_err = anyhow!("token renewal cancelled");
    for attempt in 0..MAX_RENEW_RETRIES {
        if attempt > 0 {
            tokio::select! {
                _ = token.cancelled() => return Err(last_err),
                _ = sleep(RENEW_RETRY_STEP * attempt) => {}
            }
        }
        match tp.get_token(res_uri).await {
            Err(e) => {
                warn!("token renewal attempt {} failed: {e:#}", attempt + 1);
                last_err = e;
            }
            Ok(fresh) => {
                let msg = serde_json::json!({ "renewToken": { "token": fresh } });
                sink.lock()
                    .await
                    .send(Message::Text(msg.to_string()))
                    .await
                    .context("send renewToken")?;
                debug!("token renewed");
                return Ok(());
            }
        }
    }
    Err(last_err)
}

async fn ping_loop(
    token: CancellationToken,
    sink: SharedSink,
    mut pong_rx: watch::Receiver<()>,
    interval: Duration,
    ping_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        // Flush any stale pong notification, then require a fresh one.
        pong_rx.borrow_and_update();
        let ping = async {
            sink.lock()
                .await
                .send(Message::Ping(Vec::new()))
                .await
                .context("send ping")?;
            pong_rx.changed().await.context("pong channel closed")
        };
        match timeout(ping_timeout, ping).await {
            Ok(Ok(())) => {}
            _ => {
                warn!("ping failed, forcing reconnect");
                token.cancel();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_backoff_sequence() {
        let mut delay = RECONNECT_MIN;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = next_delay(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_accept_notification_parsing() {
        let msg: ControlMessage = serde_json::from_str(
            r#"{"accept":{"address":"wss://g0.example.net/$hc/x?sb-hc-action=accept","id":"abc","connectHeaders":{"Host":"x"}}}"#,
        )
        .unwrap();
        let accept = msg.accept.unwrap();
        assert!(accept.address.starts_with("wss://"));
        assert_eq!(accept.id, "abc");
        assert_eq!(accept.connect_headers["Host"], "x");
    }

    #[test]
    fn test_non_accept_message_ignored() {
        let msg: ControlMessage = serde_json::from_str(r#"{"somethingElse":{}}"#).unwrap();
        assert!(msg.accept.is_none());
        let msg: ControlMessage = serde_json::from_str(r#"{"accept":null}"#).unwrap();
        assert!(msg.accept.is_none());
    }
}
