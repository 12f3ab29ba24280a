//! Bidirectional copy between a WebSocket and a byte stream.
//!
//! Each tunneled connection ends up here: one direction reads WebSocket
//! messages and writes the payload to the local stream, the other reads
//! the local stream in 32 KiB chunks and sends each one as a binary frame.
//! A keepalive ping keeps the relay from dropping idle data channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// How often pings are sent on data channels so the relay does not drop
/// idle connections (it times out around two minutes).
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Byte counters for a completed bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Bytes copied from the local stream into the WebSocket.
    pub tcp_to_ws: u64,
    /// Bytes copied from the WebSocket out to the local stream.
    pub ws_to_tcp: u64,
}

/// Copies data bidirectionally between a WebSocket and a local stream
/// until one side closes, either copy errors, or `cancel` fires. Returns
/// the byte counters together with the first error observed; a normal
/// WebSocket close and local-stream EOF both count as success.
pub async fn bridge<WS, S>(
    cancel: &CancellationToken,
    ws: WebSocketStream<WS>,
    local: S,
) -> (BridgeStats, Result<()>)
where
    WS: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (ws_sink, mut ws_stream) = ws.split();
    let ws_sink = Mutex::new(ws_sink);
    let (mut local_rd, mut local_wr) = tokio::io::split(local);

    let ws_to_tcp_bytes = AtomicU64::new(0);
    let tcp_to_ws_bytes = AtomicU64::new(0);

    let ws_to_tcp = ws_to_tcp_copy(&mut ws_stream, &mut local_wr, &ws_to_tcp_bytes);
    let tcp_to_ws = tcp_to_ws_copy(&mut local_rd, &ws_sink, &tcp_to_ws_bytes);
    let keepalive = keepalive_loop(&ws_sink);

    // First direction to finish wins; the losing copy and the keepalive
    // are dropped on the spot, which aborts their pending I/O.
    let result = tokio::select! {
        r = ws_to_tcp => r,
        r = tcp_to_ws => r,
        _ = keepalive => Ok(()),
        _ = cancel.cancelled() => Err(anyhow!("bridge cancelled")),
    };

    // Signal end-of-stream to the peer. Best-effort: the connection may
    // already be gone.
    let close = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    let _ = timeout(
        Duration::from_secs(5),
        ws_sink.lock().await.send(Message::Close(Some(close))),
    )
    .await;

    let stats = BridgeStats {
        tcp_to_ws: tcp_to_ws_bytes.load(Ordering::Relaxed),
        ws_to_tcp: ws_to_tcp_bytes.load(Ordering::Relaxed),
    };
    (stats, result)
}

async fn ws_to_tcp_copy<WS, W>(
    ws_stream: &mut SplitStream<WebSocketStream<WS>>,
    local_wr: &mut W,
    count: &AtomicU64,
) -> Result<()>
where
    WS: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = match ws_stream.next().await {
            None => return Ok(()),
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return if is_normal_close(&e) { Ok(()) } else { Err(e.into()) },
        };
        let data = match msg {
            Message::Binary(data) => data,
            Message::Text(text) => text.into_bytes(),
            Message::Close(_) => return Ok(()),
            // Pings are answered by the protocol layer; pongs carry no data.
            _ => continue,
        };
        // Empty frames are legal; skip them without ending the stream.
        if data.is_empty() {
            continue;
        }
        local_wr.write_all(&data).await?;
        count.fetch_add(data.len() as u64, Ordering::Relaxed);
    }
}

async fn tcp_to_ws_copy<WS, R>(
    local_rd: &mut R,
    ws_sink: &Mutex<SplitSink<WebSocketStream<WS>, Message>>,
    count: &AtomicU64,
) -> Result<()>
where
    WS: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = match local_rd.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(e.into()),
        };
        ws_sink
            .lock()
            .await
            .send(Message::Binary(buf[..n].to_vec()))
            .await?;
        count.fetch_add(n as u64, Ordering::Relaxed);
    }
}

async fn keepalive_loop<WS>(ws_sink: &Mutex<SplitSink<WebSocketStream<WS>, Message>>)
where
    WS: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        // Best-effort: a failed ping means the copy loops are about to
        // observe the failure themselves.
        let _ = timeout(
            KEEPALIVE_TIMEOUT,
            ws_sink.lock().await.send(Message::Ping(Vec::new())),
        )
        .await;
    }
}

fn is_normal_close(e: &WsError) -> bool {
    matches!(e, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, connect_async};

    /// Starts a ws:// echo server that reflects binary frames and returns
    /// its URL.
    async fn ws_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    while let Some(Ok(msg)) = ws.next().await {
                        match msg {
                            Message::Binary(_) | Message::Text(_) => {
                                if ws.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_bridge_counts_echoed_bytes() {
        let url = ws_echo_server().await;
        let (ws, _) = connect_async(&url).await.unwrap();

        let (mut client, server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(async move { bridge(&cancel, ws, server).await });

        client.write_all(b"hello tunnel\n\0").await.unwrap();
        let mut echoed = [0u8; 14];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello tunnel\n\0");

        // Local EOF ends the tcp→ws direction cleanly.
        drop(client);
        let (stats, result) = handle.await.unwrap();
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(stats.tcp_to_ws, 14);
        assert_eq!(stats.ws_to_tcp, 14);
    }

    #[tokio::test]
    async fn test_bridge_skips_empty_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Binary(Vec::new())).await.unwrap();
            ws.send(Message::Binary(b"after-empty".to_vec())).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let (mut client, server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(async move { bridge(&cancel, ws, server).await });

        let mut got = [0u8; 11];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"after-empty");

        let (stats, result) = handle.await.unwrap();
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(stats.ws_to_tcp, 11);
    }

    #[tokio::test]
    async fn test_bridge_normal_close_is_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let (_client, server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let (stats, result) = bridge(&cancel, ws, server).await;
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(stats, BridgeStats::default());
    }

    #[tokio::test]
    async fn test_bridge_cancellation() {
        let url = ws_echo_server().await;
        let (ws, _) = connect_async(&url).await.unwrap();
        let (_client, server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (_stats, result) = bridge(&cancel, ws, server).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bridge_chunks_large_transfer() {
        let url = ws_echo_server().await;
        let (ws, _) = connect_async(&url).await.unwrap();
        let (mut client, server) = tokio::io::duplex(256 * 1024);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(async move { bridge(&cancel, ws, server).await });

        // Larger than one copy buffer, so it crosses chunk boundaries.
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            let mut got = vec![0u8; expected.len()];
            client.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);
            drop(client);
        });
        writer.await.unwrap();

        let (stats, result) = handle.await.unwrap();
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(stats.tcp_to_ws, 100_000);
        assert_eq!(stats.ws_to_tcp, 100_000);
    }
}
