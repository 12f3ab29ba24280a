//! Wire format for the tunnel protocol.
//!
//! Every connection through the relay begins with a single JSON envelope
//! exchange (one text WebSocket message in each direction), followed by raw
//! binary WebSocket frames carrying the tunneled bytes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const CURRENT_VERSION: u32 = 1;

/// Sent by the sender to the listener immediately after the rendezvous
/// WebSocket is established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectEnvelope {
    /// Protocol version (currently 1).
    #[serde(default)]
    pub version: u32,

    /// The host:port the sender wants the listener to dial.
    #[serde(default)]
    pub target: String,

    /// Extensible key-value pairs reserved for future use
    /// (auth tokens, compression negotiation, trace IDs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl ConnectEnvelope {
    pub fn new(target: &str) -> Self {
        Self {
            version: CURRENT_VERSION,
            target: target.to_string(),
            metadata: None,
        }
    }
}

/// Sent by the listener back to the sender after attempting to dial the
/// requested target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Protocol version (currently 1).
    #[serde(default)]
    pub version: u32,

    /// True if the listener successfully connected to the target.
    #[serde(default)]
    pub ok: bool,

    /// Human-readable error message when `ok` is false. Must not leak
    /// internal details (addresses, paths, tokens).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ConnectResponse {
    pub fn ok() -> Self {
        Self {
            version: CURRENT_VERSION,
            ok: true,
            error: String::new(),
        }
    }

    pub fn err(msg: &str) -> Self {
        Self {
            version: CURRENT_VERSION,
            ok: false,
            error: msg.to_string(),
        }
    }
}
