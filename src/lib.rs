pub mod allowlist;
pub mod auth;
pub mod bridge;
pub mod control;
pub mod dial;
pub mod endpoint;
pub mod http;
pub mod listener;
pub mod metrics;
pub mod protocol;
pub mod sender;
pub mod socket;
pub mod socks5;

// Re-export key types for easier access by consumers
pub use auth::{BearerTokenProvider, SasTokenProvider, TokenProvider};
pub use bridge::{bridge, BridgeStats};
pub use control::{AcceptHandler, AcceptNotification, ControlConfig};
pub use dial::{dial, dial_with_timeout, WsConn};
pub use endpoint::{parse_relay_endpoint, DEFAULT_RELAY_SUFFIX};
pub use metrics::Metrics;
pub use protocol::{ConnectEnvelope, ConnectResponse, CURRENT_VERSION};
