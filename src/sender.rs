//! The relay-sender modes: port-forward, socks5-proxy, and connect
//! (stdin/stdout). All three share the dial → envelope → bridge sequence
//! and differ only in where the local bytes come from.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::io::{stdin, stdout, AsyncRead, AsyncWrite, ReadBuf, Stdin, Stdout};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenProvider;
use crate::dial::WsConn;
use crate::metrics::{instrumented_dial, tracked_bridge, Metrics, REASON_ENVELOPE_ERROR};
use crate::protocol::{ConnectEnvelope, ConnectResponse};
use crate::socket::set_tcp_keepalive;
use crate::socks5;

const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const SOCKS5_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for port-forward mode.
pub struct PortForwardConfig {
    pub endpoint: String,
    pub entity_path: String,
    pub token_provider: Arc<dyn TokenProvider>,
    /// host:port the listener should dial for every connection.
    pub target: String,
    /// Local address to listen on.
    pub bind_address: String,
    pub tcp_keepalive: Duration,
    /// Total retry budget for the relay dial; zero means a single attempt.
    pub dial_timeout: Duration,
    pub metrics: Option<Arc<Metrics>>,
}

/// Starts a local TCP listener and forwards each connection through the
/// relay to the configured target. Blocks until `cancel` fires.
pub async fn port_forward(cancel: CancellationToken, cfg: PortForwardConfig) -> Result<()> {
    let listener = TcpListener::bind(&cfg.bind_address)
        .await
        .with_context(|| format!("listen {}", cfg.bind_address))?;
    port_forward_listener(cancel, listener, cfg).await
}

/// Like [`port_forward`] but serves an already-bound listener.
pub async fn port_forward_listener(
    cancel: CancellationToken,
    listener: TcpListener,
    mut cfg: PortForwardConfig,
) -> Result<()> {
    if cfg.tcp_keepalive.is_zero() {
        cfg.tcp_keepalive = DEFAULT_TCP_KEEPALIVE;
    }
    info!(
        "port-forward listening bind={} target={}",
        listener.local_addr().context("local addr")?,
        cfg.target
    );

    let cfg = Arc::new(cfg);
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((conn, _)) => conn,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            },
        };
        let cfg = Arc::clone(&cfg);
        let conn_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = forward_connection(conn_cancel, conn, cfg).await {
                warn!("forward failed: {e:#}");
            }
        });
    }
}

async fn forward_connection(
    cancel: CancellationToken,
    conn: TcpStream,
    cfg: Arc<PortForwardConfig>,
) -> Result<()> {
    set_tcp_keepalive(&conn, cfg.tcp_keepalive);

    let metrics = cfg.metrics.as_ref();
    let mut ws = instrumented_dial(
        metrics,
        &cfg.endpoint,
        &cfg.entity_path,
        cfg.token_provider.as_ref(),
        "sender",
        cfg.dial_timeout,
    )
    .await?;

    if let Err(e) = send_envelope_and_check(&mut ws, &cfg.target).await {
        if let Some(m) = metrics {
            m.connection_error("sender", REASON_ENVELOPE_ERROR);
        }
        return Err(e);
    }

    let (_stats, result) = tracked_bridge(metrics, &cancel, ws, conn, "sender", &cfg.target).await;
    result
}

/// Configuration for socks5-proxy mode.
pub struct Socks5Config {
    pub endpoint: String,
    pub entity_path: String,
    pub token_provider: Arc<dyn TokenProvider>,
    pub bind_address: String,
    pub tcp_keepalive: Duration,
    pub dial_timeout: Duration,
    pub metrics: Option<Arc<Metrics>>,
}

/// Starts a local SOCKS5 proxy; each connection's target comes from its
/// handshake. Blocks until `cancel` fires.
pub async fn socks5_proxy(cancel: CancellationToken, cfg: Socks5Config) -> Result<()> {
    let listener = TcpListener::bind(&cfg.bind_address)
        .await
        .with_context(|| format!("listen {}", cfg.bind_address))?;
    socks5_proxy_listener(cancel, listener, cfg).await
}

/// Like [`socks5_proxy`] but serves an already-bound listener.
pub async fn socks5_proxy_listener(
    cancel: CancellationToken,
    listener: TcpListener,
    mut cfg: Socks5Config,
) -> Result<()> {
    if cfg.tcp_keepalive.is_zero() {
        cfg.tcp_keepalive = DEFAULT_TCP_KEEPALIVE;
    }
    info!(
        "socks5-proxy listening bind={}",
        listener.local_addr().context("local addr")?
    );

    let cfg = Arc::new(cfg);
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((conn, _)) => conn,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            },
        };
        let cfg = Arc::clone(&cfg);
        let conn_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = handle_socks5(conn_cancel, conn, cfg).await {
                warn!("socks5 failed: {e:#}");
            }
        });
    }
}

async fn handle_socks5(
    cancel: CancellationToken,
    mut conn: TcpStream,
    cfg: Arc<Socks5Config>,
) -> Result<()> {
    set_tcp_keepalive(&conn, cfg.tcp_keepalive);

    // The handshake must finish within its own deadline; bridging
    // afterwards is unbounded.
    let target = match timeout(SOCKS5_HANDSHAKE_TIMEOUT, socks5::handshake(&mut conn)).await {
        Ok(Ok(target)) => target,
        Ok(Err(e)) => {
            let _ = socks5::send_reply(&mut conn, socks5::REP_GENERAL_FAILURE, None).await;
            return Err(e.context("socks5 handshake"));
        }
        Err(_) => {
            let _ = socks5::send_reply(&mut conn, socks5::REP_GENERAL_FAILURE, None).await;
            bail!("socks5 handshake: timed out");
        }
    };

    info!("socks5 connect target={target}");

    let metrics = cfg.metrics.as_ref();
    let mut ws = match instrumented_dial(
        metrics,
        &cfg.endpoint,
        &cfg.entity_path,
        cfg.token_provider.as_ref(),
        "sender",
        cfg.dial_timeout,
    )
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            let _ = socks5::send_reply(&mut conn, socks5::REP_GENERAL_FAILURE, None).await;
            return Err(e);
        }
    };

    if let Err(e) = send_envelope_and_check(&mut ws, &target).await {
        if let Some(m) = metrics {
            m.connection_error("sender", REASON_ENVELOPE_ERROR);
        }
        let _ = socks5::send_reply(&mut conn, socks5::REP_HOST_UNREACHABLE, None).await;
        return Err(e);
    }

    let bind_addr = conn.local_addr().ok();
    socks5::send_reply(&mut conn, socks5::REP_SUCCESS, bind_addr).await?;

    let (_stats, result) = tracked_bridge(metrics, &cancel, ws, conn, "sender", &target).await;
    result
}

/// Configuration for connect (stdin/stdout) mode.
pub struct ConnectConfig {
    pub endpoint: String,
    pub entity_path: String,
    pub token_provider: Arc<dyn TokenProvider>,
    pub target: String,
    pub dial_timeout: Duration,
    pub metrics: Option<Arc<Metrics>>,
}

/// One-shot connection bridging stdin/stdout with the tunnel. Returns when
/// either side closes.
pub async fn connect(cancel: CancellationToken, cfg: ConnectConfig) -> Result<()> {
    connect_io(cancel, cfg, StdioStream::new()).await
}

/// [`connect`] over an arbitrary local stream.
pub async fn connect_io<S>(cancel: CancellationToken, cfg: ConnectConfig, local: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let metrics = cfg.metrics.as_ref();
    let mut ws = instrumented_dial(
        metrics,
        &cfg.endpoint,
        &cfg.entity_path,
        cfg.token_provider.as_ref(),
        "sender",
        cfg.dial_timeout,
    )
    .await?;

    if let Err(e) = send_envelope_and_check(&mut ws, &cfg.target).await {
        if let Some(m) = metrics {
            m.connection_error("sender", REASON_ENVELOPE_ERROR);
        }
        return Err(e);
    }

    log::debug!("connected target={}", cfg.target);

    let (_stats, result) = tracked_bridge(metrics, &cancel, ws, local, "sender", &cfg.target).await;
    result
}

/// Sends the connect envelope and waits for the listener's response. A
/// rejection is terminal for the connection.
pub async fn send_envelope_and_check(ws: &mut WsConn, target: &str) -> Result<()> {
    let env = ConnectEnvelope::new(target);
    let data = serde_json::to_string(&env).context("encode envelope")?;
    ws.send(Message::Text(data)).await.context("send envelope")?;

    let data = loop {
        match ws.next().await {
            None => bail!("read response: connection closed"),
            Some(Ok(Message::Text(text))) => break text.into_bytes(),
            Some(Ok(Message::Binary(data))) => break data,
            Some(Ok(Message::Close(_))) => bail!("read response: connection closed"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e).context("read response"),
        }
    };

    let resp: ConnectResponse = serde_json::from_slice(&data).context("parse response")?;
    if !resp.ok {
        bail!("connection rejected: {}", resp.error);
    }
    Ok(())
}

/// Adapts stdin/stdout to a single byte stream for the bridge.
struct StdioStream {
    stdin: Stdin,
    stdout: Stdout,
}

impl StdioStream {
    fn new() -> Self {
        Self {
            stdin: stdin(),
            stdout: stdout(),
        }
    }
}

impl AsyncRead for StdioStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdioStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdout).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_shutdown(cx)
    }
}
