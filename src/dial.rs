//! Sender-side relay dialing with retry and token redaction.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::debug;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::auth::TokenProvider;
use crate::endpoint::{endpoint_to_wss, path_escape, query_escape, resource_uri};

/// A WebSocket connection dialed to the relay.
pub type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Per-attempt WebSocket dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

const DIAL_RETRY_BASE: Duration = Duration::from_secs(1);
const DIAL_RETRY_MAX: Duration = Duration::from_secs(30);

/// Connects to the relay as a sender, establishing a rendezvous WebSocket
/// that will be paired with a listener. Single attempt, bounded by
/// [`DEFAULT_DIAL_TIMEOUT`].
pub async fn dial(endpoint: &str, entity_path: &str, tp: &dyn TokenProvider) -> Result<WsConn> {
    let res_uri = resource_uri(endpoint, entity_path);
    let token = tp.get_token(&res_uri).await.context("get token")?;

    let connect_url = format!(
        "{}/$hc/{}?sb-hc-action=connect&sb-hc-token={}",
        endpoint_to_wss(endpoint),
        path_escape(entity_path),
        query_escape(&token)
    );

    match timeout(DEFAULT_DIAL_TIMEOUT, connect_async(&connect_url)).await {
        Ok(Ok((ws, _resp))) => Ok(ws),
        Ok(Err(e)) => Err(anyhow!("dial relay: {}", redact_token(&e.to_string()))),
        Err(elapsed) => Err(anyhow::Error::new(elapsed).context("dial relay: timed out")),
    }
}

/// Dials the relay, retrying with exponential backoff (1s, 2s, 4s, capped
/// at 30s) until `dial_budget` is exhausted. A zero budget means a single
/// attempt with no retries. `on_retry` is invoked once before each retry
/// sleep.
pub async fn dial_with_timeout(
    endpoint: &str,
    entity_path: &str,
    tp: &dyn TokenProvider,
    dial_budget: Duration,
    on_retry: Option<&(dyn Fn() + Send + Sync)>,
) -> Result<WsConn> {
    if dial_budget.is_zero() {
        return dial(endpoint, entity_path, tp).await;
    }

    let deadline = Instant::now() + dial_budget;
    let mut delay = DIAL_RETRY_BASE;
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 0.. {
        if attempt > 0 {
            debug!("retrying relay dial attempt={attempt} delay={delay:?}");
            if let Some(f) = on_retry {
                f();
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            if delay >= remaining {
                // The budget ends mid-backoff; no further attempt fits.
                sleep(remaining).await;
                break;
            }
            sleep(delay).await;
            delay = (delay * 2).min(DIAL_RETRY_MAX);
        }

        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            break;
        };
        match timeout(remaining, dial(endpoint, entity_path, tp)).await {
            Ok(Ok(ws)) => return Ok(ws),
            Ok(Err(e)) => {
                debug!("relay dial attempt {} failed: {e:#}", attempt + 1);
                last_err = Some(e);
            }
            Err(elapsed) => {
                return Err(last_err.unwrap_or_else(|| {
                    anyhow::Error::new(elapsed).context("dial relay: timed out")
                }));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("dial relay: budget exhausted before first attempt")))
}

/// Strips the `sb-hc-token` query value from an error string so
/// credentials never reach logs or wrapped errors.
pub fn redact_token(s: &str) -> String {
    const NEEDLE: &str = "sb-hc-token=";
    let Some(i) = s.find(NEEDLE) else {
        return s.to_string();
    };
    let rest = &s[i..];
    match rest.find(|c| c == '"' || c == ' ') {
        Some(end) => format!("{}sb-hc-token=REDACTED{}", &s[..i], &rest[end..]),
        None => format!("{}sb-hc-token=REDACTED", &s[..i]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SasTokenProvider;

    #[test]
    fn test_redact_token_at_end() {
        let msg = "dial wss://host/$hc?sb-hc-action=connect&sb-hc-token=XYZ";
        let got = redact_token(msg);
        assert!(got.contains("sb-hc-token=REDACTED"), "{got}");
        assert!(!got.contains("XYZ"), "{got}");
    }

    #[test]
    fn test_redact_token_mid_string() {
        let msg = r#"error for "wss://h/$hc?sb-hc-token=SECRET" after handshake"#;
        let got = redact_token(msg);
        assert!(got.contains(r#"sb-hc-token=REDACTED" after handshake"#), "{got}");
        assert!(!got.contains("SECRET"));
    }

    #[test]
    fn test_redact_token_space_delimited() {
        let got = redact_token("dial ws://h?sb-hc-token=AAA failed: refused");
        assert_eq!(got, "dial ws://h?sb-hc-token=REDACTED failed: refused");
    }

    #[test]
    fn test_redact_no_token_untouched() {
        assert_eq!(redact_token("plain error"), "plain error");
    }

    #[tokio::test]
    async fn test_dial_error_is_tagged_and_redacted() {
        // Nothing listens on port 1; the dial fails fast and the error must
        // carry the stable tag with no token material.
        let tp = SasTokenProvider {
            key_name: "kn".into(),
            key: "key".into(),
        };
        let err = dial("ws://127.0.0.1:1", "hc", &tp).await.unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("dial relay"), "{msg}");
        assert!(!msg.contains("SharedAccessSignature"), "{msg}");
    }

    #[tokio::test]
    async fn test_zero_budget_single_attempt() {
        let tp = SasTokenProvider {
            key_name: "kn".into(),
            key: "key".into(),
        };
        let start = std::time::Instant::now();
        let err = dial_with_timeout("ws://127.0.0.1:1", "hc", &tp, Duration::ZERO, None)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("dial relay"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_budget_invokes_retry_callback() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let retries = AtomicUsize::new(0);
        let cb = || {
            retries.fetch_add(1, Ordering::SeqCst);
        };
        let tp = SasTokenProvider {
            key_name: "kn".into(),
            key: "key".into(),
        };
        let _ = dial_with_timeout(
            "ws://127.0.0.1:1",
            "hc",
            &tp,
            Duration::from_millis(1500),
            Some(&cb),
        )
        .await;
        assert!(retries.load(Ordering::SeqCst) >= 1);
    }
}
