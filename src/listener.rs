//! The relay-listener: accepts connections pushed over the control
//! channel, reads the connect envelope, checks the target against the
//! allowlist, dials the target, and bridges data bidirectionally.
//!
//! Only fixed phrases cross the wire on failure; addresses, paths, and
//! tokens stay out of responses and logs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::allowlist::is_allowed;
use crate::auth::TokenProvider;
use crate::control::{self, AcceptHandler, ControlConfig};
use crate::dial::{WsConn, DEFAULT_DIAL_TIMEOUT};
use crate::metrics::{
    dial_reason, tracked_bridge, Metrics, REASON_ALLOWLIST_REJECTED, REASON_DIAL_FAILED,
    REASON_ENVELOPE_ERROR,
};
use crate::protocol::{ConnectEnvelope, ConnectResponse, CURRENT_VERSION};
use crate::socket::set_tcp_keepalive;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Relay-listener configuration.
pub struct Config {
    pub endpoint: String,
    pub entity_path: String,
    pub token_provider: Arc<dyn TokenProvider>,
    /// Optional target allowlist; empty permits every target.
    pub allow_list: Vec<String>,
    /// Max concurrent tunneled connections; zero means unlimited.
    pub max_connections: usize,
    /// Deadline for the envelope read and the target dial.
    pub connect_timeout: Duration,
    pub tcp_keepalive: Duration,
    /// Per-attempt timeout for control and rendezvous dials.
    pub dial_timeout: Duration,
    pub metrics: Option<Arc<Metrics>>,
}

impl Config {
    pub fn new(
        endpoint: String,
        entity_path: String,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            endpoint,
            entity_path,
            token_provider,
            allow_list: Vec::new(),
            max_connections: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tcp_keepalive: DEFAULT_TCP_KEEPALIVE,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            metrics: None,
        }
    }
}

/// Starts the relay-listener. Blocks until `cancel` fires.
pub async fn listen_and_serve(cancel: CancellationToken, mut cfg: Config) -> Result<()> {
    if cfg.connect_timeout.is_zero() {
        cfg.connect_timeout = DEFAULT_CONNECT_TIMEOUT;
    }
    if cfg.tcp_keepalive.is_zero() {
        cfg.tcp_keepalive = DEFAULT_TCP_KEEPALIVE;
    }
    if cfg.allow_list.is_empty() {
        warn!("no allowlist configured, all targets will be permitted");
    }

    let cfg = Arc::new(cfg);
    let handler: AcceptHandler = {
        let cfg = Arc::clone(&cfg);
        Arc::new(move |token, ws| -> BoxFuture<'static, ()> {
            let cfg = Arc::clone(&cfg);
            Box::pin(async move {
                handle_connection(token, ws, cfg).await;
            })
        })
    };

    let mut ctrl = ControlConfig::new(
        cfg.endpoint.clone(),
        cfg.entity_path.clone(),
        cfg.token_provider.clone(),
        handler,
    );
    ctrl.max_connections = cfg.max_connections;
    ctrl.dial_timeout = cfg.dial_timeout;
    if let Some(m) = &cfg.metrics {
        let up = Arc::clone(m);
        let down = Arc::clone(m);
        ctrl.on_connect = Some(Arc::new(move || up.set_control_channel_connected(true)));
        ctrl.on_disconnect = Some(Arc::new(move || down.set_control_channel_connected(false)));
    }

    control::listen_and_serve(cancel, ctrl).await
}

/// Runs one accepted rendezvous connection: envelope, allowlist, target
/// dial, response, bridge. Failures are reported to the sender as fixed
/// phrases and to metrics by category; they never carry internal detail.
async fn handle_connection(cancel: CancellationToken, mut ws: WsConn, cfg: Arc<Config>) {
    let metrics = cfg.metrics.as_ref();

    let data = match timeout(cfg.connect_timeout, read_data_frame(&mut ws)).await {
        Ok(Ok(data)) => data,
        Ok(Err(e)) => {
            warn!("failed to read envelope: {e:#}");
            if let Some(m) = metrics {
                m.connection_error("listener", REASON_ENVELOPE_ERROR);
            }
            return;
        }
        Err(_) => {
            warn!("timed out reading envelope");
            if let Some(m) = metrics {
                m.connection_error("listener", REASON_ENVELOPE_ERROR);
            }
            return;
        }
    };

    let env: ConnectEnvelope = match serde_json::from_slice(&data) {
        Ok(env) => env,
        Err(e) => {
            warn!("invalid envelope: {e}");
            let _ = send_response(&mut ws, ConnectResponse::err("invalid envelope")).await;
            if let Some(m) = metrics {
                m.connection_error("listener", REASON_ENVELOPE_ERROR);
            }
            return;
        }
    };
    if env.version != CURRENT_VERSION {
        warn!("unsupported protocol version {}", env.version);
        let _ = send_response(&mut ws, ConnectResponse::err("unsupported protocol version")).await;
        if let Some(m) = metrics {
            m.connection_error("listener", REASON_ENVELOPE_ERROR);
        }
        return;
    }
    if env.target.is_empty() {
        let _ = send_response(&mut ws, ConnectResponse::err("missing target")).await;
        if let Some(m) = metrics {
            m.connection_error("listener", REASON_ENVELOPE_ERROR);
        }
        return;
    }

    info!("connection requested target={}", env.target);

    if !is_allowed(&env.target, &cfg.allow_list) {
        warn!("target not allowed: {}", env.target);
        let _ = send_response(&mut ws, ConnectResponse::err("target not allowed")).await;
        if let Some(m) = metrics {
            m.connection_error("listener", REASON_ALLOWLIST_REJECTED);
        }
        return;
    }

    let dial_start = Instant::now();
    let conn = timeout(cfg.connect_timeout, TcpStream::connect(&env.target)).await;
    if let Some(m) = metrics {
        m.observe_dial_duration("listener", dial_start.elapsed().as_secs_f64());
    }
    let conn = match conn {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            warn!("dial target failed: {}: {e}", env.target);
            let _ = send_response(&mut ws, ConnectResponse::err("connection failed")).await;
            if let Some(m) = metrics {
                let err = anyhow::Error::new(e);
                m.connection_error("listener", dial_reason(&err, REASON_DIAL_FAILED));
            }
            return;
        }
        Err(elapsed) => {
            warn!("dial target timed out: {}", env.target);
            let _ = send_response(&mut ws, ConnectResponse::err("connection failed")).await;
            if let Some(m) = metrics {
                let err = anyhow::Error::new(elapsed);
                m.connection_error("listener", dial_reason(&err, REASON_DIAL_FAILED));
            }
            return;
        }
    };

    set_tcp_keepalive(&conn, cfg.tcp_keepalive);

    if let Err(e) = send_response(&mut ws, ConnectResponse::ok()).await {
        warn!("failed to send response: {e:#}");
        return;
    }

    let (_stats, result) =
        tracked_bridge(metrics, &cancel, ws, conn, "listener", &env.target).await;
    if let Err(e) = result {
        log::debug!("bridge ended target={}: {e:#}", env.target);
    }
}

/// Reads the next data-bearing frame, skipping control frames. The
/// envelope is a text frame, but any data frame is accepted and left to
/// the JSON parser.
async fn read_data_frame(ws: &mut WsConn) -> Result<Vec<u8>> {
    loop {
        match ws.next().await {
            None => anyhow::bail!("connection closed before envelope"),
            Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
            Some(Ok(Message::Binary(data))) => return Ok(data),
            Some(Ok(Message::Close(_))) => anyhow::bail!("connection closed before envelope"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e).context("read envelope"),
        }
    }
}

async fn send_response(ws: &mut WsConn, resp: ConnectResponse) -> Result<()> {
    let data = serde_json::to_string(&resp).context("encode response")?;
    ws.send(Message::Text(data)).await.context("send response")?;
    Ok(())
}
