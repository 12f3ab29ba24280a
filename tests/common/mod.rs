//! Shared test helpers: an in-process mock relay implementing the
//! listen/connect/rendezvous pairing contract over plaintext ws://, an
//! echo server, and a scriptable token provider.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hctunnel::auth::TokenProvider;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

type ServerWs = WebSocketStream<TcpStream>;

/// A fake relay: pairs one listener control channel with per-connection
/// rendezvous sockets, pushing accept notifications the way the real
/// service does.
pub struct MockRelay {
    addr: SocketAddr,
    state: Arc<RelayState>,
}

struct RelayState {
    control_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<u64, ServerWs>>,
    next_id: AtomicU64,
    control_count: watch::Sender<usize>,
    stall: watch::Sender<bool>,
}

impl MockRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(RelayState {
            control_tx: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            control_count: watch::channel(0).0,
            stall: watch::channel(false).0,
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = handle_conn(state, addr, stream).await;
                });
            }
        });

        Self { addr, state }
    }

    /// Endpoint string for configs; carries a scheme so the tunnel dials
    /// plaintext ws:// instead of wss://.
    pub fn endpoint(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of control channels established so far.
    pub fn control_count(&self) -> usize {
        *self.state.control_count.borrow()
    }

    /// Waits until at least `n` control channels have been established.
    pub async fn wait_for_controls(&self, n: usize) {
        let mut rx = self.state.control_count.subscribe();
        while *rx.borrow_and_update() < n {
            rx.changed().await.unwrap();
        }
    }

    /// Stops reading from every control channel, so client pings go
    /// unanswered and the peer looks dead.
    pub fn stall_control(&self) {
        self.state.stall.send_replace(true);
    }
}

async fn handle_conn(state: Arc<RelayState>, relay_addr: SocketAddr, stream: TcpStream) -> Result<()> {
    let mut uri = String::new();
    let ws = accept_hdr_async(stream, |req: &HsRequest, resp: HsResponse| {
        uri = req.uri().to_string();
        Ok(resp)
    })
    .await?;

    if uri.contains("sb-hc-action=listen") {
        run_control(state, ws).await;
    } else if uri.contains("sb-hc-action=connect") {
        register_sender(state, relay_addr, ws);
    } else if let Some(id) = uri
        .strip_prefix("/rendezvous/")
        .and_then(|rest| rest.parse::<u64>().ok())
    {
        run_rendezvous(state, id, ws).await;
    }
    Ok(())
}

async fn run_control(state: Arc<RelayState>, ws: ServerWs) {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *state.control_tx.lock().unwrap() = Some(tx);
    state.control_count.send_modify(|c| *c += 1);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Read (and discard) control frames; polling is what answers pings.
    // When stalled, stop polling entirely so the channel looks dead.
    let mut stall_rx = state.stall.subscribe();
    loop {
        if *stall_rx.borrow_and_update() {
            std::future::pending::<()>().await;
        }
        tokio::select! {
            _ = stall_rx.changed() => continue,
            msg = stream.next() => match msg {
                None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    writer.abort();
}

fn register_sender(state: Arc<RelayState>, relay_addr: SocketAddr, ws: ServerWs) {
    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    state.pending.lock().unwrap().insert(id, ws);

    let accept = serde_json::json!({
        "accept": {
            "address": format!("ws://{relay_addr}/rendezvous/{id}"),
            "id": id.to_string(),
        }
    });
    let delivered = state
        .control_tx
        .lock()
        .unwrap()
        .as_ref()
        .map(|tx| tx.send(Message::Text(accept.to_string())).is_ok())
        .unwrap_or(false);
    if !delivered {
        state.pending.lock().unwrap().remove(&id);
    }
}

async fn run_rendezvous(state: Arc<RelayState>, id: u64, listener_ws: ServerWs) {
    let Some(sender_ws) = state.pending.lock().unwrap().remove(&id) else {
        return;
    };
    let (l_sink, l_stream) = listener_ws.split();
    let (s_sink, s_stream) = sender_ws.split();
    tokio::join!(pump(l_stream, s_sink), pump(s_stream, l_sink));
}

/// Forwards data and close frames from one side of a paired connection to
/// the other.
async fn pump(mut from: SplitStream<ServerWs>, mut to: SplitSink<ServerWs, Message>) {
    loop {
        match from.next().await {
            None | Some(Err(_)) => break,
            Some(Ok(msg)) => match msg {
                Message::Close(frame) => {
                    let _ = to.send(Message::Close(frame)).await;
                    break;
                }
                Message::Text(_) | Message::Binary(_) => {
                    if to.send(msg).await.is_err() {
                        break;
                    }
                }
                _ => {}
            },
        }
    }
    let _ = to.close().await;
}

/// Starts a TCP echo server and returns its address.
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Token provider whose call count is observable and whose failures are
/// scriptable by call number (1-based, inclusive range).
pub struct TestTokenProvider {
    calls: AtomicUsize,
    fail_range: Option<(usize, usize)>,
}

impl TestTokenProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_range: None,
        })
    }

    /// Fails every `get_token` whose 1-based call number falls inside the
    /// range.
    pub fn failing_between(start: usize, end: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_range: Some((start, end)),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for TestTokenProvider {
    async fn get_token(&self, _resource_uri: &str) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((start, end)) = self.fail_range {
            if n >= start && n <= end {
                anyhow::bail!("transient token failure {n}");
            }
        }
        Ok(format!("test-token-{n}"))
    }
}
