//! Token-based authentication for the relay.
//!
//! Two credential styles are supported: shared-access-signature tokens
//! computed locally from a named key, and bearer tokens obtained from an
//! external identity helper. Both are opaque strings to the rest of the
//! crate; they ride in the `sb-hc-token` query parameter on dials and in
//! `renewToken` control frames.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::process::Command;

use crate::endpoint::query_escape;

/// Default lifetime of generated SAS tokens. The control channel renews
/// well before this expires.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Generates authentication tokens for the relay.
///
/// Implementations must be safe for concurrent calls; the control channel
/// invokes `get_token` from its renewal loop while dials may be in flight.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a token string suitable for the `sb-hc-token` query
    /// parameter or the `renewToken` control message.
    async fn get_token(&self, resource_uri: &str) -> Result<String>;
}

/// Generates shared-access-signature tokens from a named key.
pub struct SasTokenProvider {
    pub key_name: String,
    pub key: String,
}

#[async_trait]
impl TokenProvider for SasTokenProvider {
    async fn get_token(&self, resource_uri: &str) -> Result<String> {
        generate_sas_token(resource_uri, &self.key_name, &self.key, TOKEN_LIFETIME)
    }
}

/// Obtains bearer tokens by running an external helper command.
///
/// The helper must print the raw token on stdout; anything it writes may be
/// a fresh network-obtained credential, so calls can block and can fail
/// transiently. The command string itself is never logged.
pub struct BearerTokenProvider {
    command: String,
}

impl BearerTokenProvider {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

#[async_trait]
impl TokenProvider for BearerTokenProvider {
    async fn get_token(&self, _resource_uri: &str) -> Result<String> {
        let mut parts = self.command.split_whitespace();
        let Some(program) = parts.next() else {
            bail!("token command is empty");
        };
        let output = Command::new(program)
            .args(parts)
            .output()
            .await
            .context("run token command")?;
        if !output.status.success() {
            bail!("token command exited with {}", output.status);
        }
        let token = String::from_utf8(output.stdout)
            .context("token command output is not UTF-8")?
            .trim()
            .to_string();
        if token.is_empty() {
            bail!("token command returned an empty token");
        }
        Ok(token)
    }
}

/// Creates a `SharedAccessSignature` token for the given resource URI.
/// The key is the raw key value, not base64.
pub fn generate_sas_token(
    resource_uri: &str,
    key_name: &str,
    key: &str,
    lifetime: Duration,
) -> Result<String> {
    if key_name.is_empty() || key.is_empty() {
        bail!("missing shared access key material");
    }
    let expiry = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before epoch")?
        .as_secs()
        + lifetime.as_secs();
    Ok(sas_token_at(resource_uri, key_name, key, expiry))
}

/// Signs `lowercase(escape(uri)) + "\n" + expiry` with HMAC-SHA256 and
/// assembles the token. Deterministic for a fixed (uri, key, expiry).
fn sas_token_at(resource_uri: &str, key_name: &str, key: &str, expiry: u64) -> String {
    let uri = query_escape(&resource_uri.to_lowercase());
    let canonical = format!("{uri}\n{expiry}");
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key.as_bytes()).expect("HMAC can take key of any size");
    mac.update(canonical.as_bytes());
    let sig = BASE64.encode(mac.finalize().into_bytes());
    format!(
        "SharedAccessSignature sr={uri}&sig={}&se={expiry}&skn={key_name}",
        query_escape(&sig)
    )
}
