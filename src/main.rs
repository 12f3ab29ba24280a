use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use hctunnel::auth::{BearerTokenProvider, SasTokenProvider, TokenProvider};
use hctunnel::endpoint::{parse_relay_endpoint, DEFAULT_RELAY_SUFFIX};
use hctunnel::metrics::Metrics;
use hctunnel::{http, listener, sender};
use log::info;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const ENV_ENDPOINT: &str = "HCTUNNEL_ENDPOINT";
const ENV_ENTITY: &str = "HCTUNNEL_ENTITY";
const ENV_ENDPOINT_SUFFIX: &str = "HCTUNNEL_ENDPOINT_SUFFIX";
const ENV_KEY_NAME: &str = "HCTUNNEL_KEY_NAME";
const ENV_KEY: &str = "HCTUNNEL_KEY";
const ENV_TOKEN_COMMAND: &str = "HCTUNNEL_TOKEN_COMMAND";
const ENV_METRICS_ADDR: &str = "HCTUNNEL_METRICS_ADDR";

#[derive(Parser, Debug)]
#[command(
    name = "hctunnel",
    version,
    about = "Tunnel TCP connections through a relay hybrid connection",
    long_about = "Tunnel TCP connections through a message-relay hybrid connection.\n\n\
        A listener behind the firewall keeps an outbound control channel open\n\
        to the relay; senders dial the relay per connection and the two sides\n\
        bridge raw bytes.\n\n\
        Examples:\n  \
          # Behind the firewall\n  \
          hctunnel listener my-hc --allow 10.0.0.0/8:22\n\n  \
          # On the workstation\n  \
          hctunnel sender port-forward 10.0.5.1:22 --bind 127.0.0.1:2222"
)]
struct Cli {
    /// Relay namespace name, FQDN, or URI
    #[arg(long, global = true, value_name = "ENDPOINT")]
    endpoint: Option<String>,

    /// Hybrid connection (entity) name
    #[arg(long, global = true, value_name = "NAME")]
    entity: Option<String>,

    /// Namespace suffix for sovereign clouds
    #[arg(long, global = true, value_name = "SUFFIX")]
    endpoint_suffix: Option<String>,

    /// Log level (debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Address for the Prometheus metrics server (e.g. 127.0.0.1:9090); disabled if unset
    #[arg(long, global = true, value_name = "ADDR")]
    metrics_addr: Option<String>,

    /// Max unique target labels in metrics (0 = unlimited)
    #[arg(long, global = true, default_value_t = 500, value_name = "N")]
    metrics_max_targets: usize,

    /// Total time budget for relay dial retries (0 = single attempt)
    #[arg(long, global = true, value_parser = parse_duration, default_value = "30s", value_name = "DUR")]
    dial_timeout: Duration,

    /// TCP keepalive interval
    #[arg(long, global = true, value_parser = parse_duration, default_value = "30s", value_name = "DUR")]
    tcp_keepalive: Duration,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen on the relay and forward connections to allowed local targets
    Listener {
        /// Hybrid connection name (alternative to --entity)
        entity_path: Option<String>,

        /// Allowed targets (host:port, host:*, CIDR:port, CIDR:*, or *); repeatable
        #[arg(long, value_name = "ENTRY")]
        allow: Vec<String>,

        /// Max concurrent tunneled connections (0 = unlimited)
        #[arg(long, default_value_t = 0, value_name = "N")]
        max_connections: usize,

        /// Timeout for reading the connect envelope and dialing targets
        #[arg(long, value_parser = parse_duration, default_value = "30s", value_name = "DUR")]
        connect_timeout: Duration,
    },

    /// Open local front-ends that tunnel connections through the relay
    Sender {
        #[command(subcommand)]
        mode: SenderMode,
    },

    /// Print the version
    Version,
}

#[derive(Subcommand, Debug)]
enum SenderMode {
    /// Forward a local port through the relay to a fixed target
    PortForward {
        /// Target host:port the listener should dial
        target: String,

        /// Local bind address:port
        #[arg(short = 'b', long, default_value = "127.0.0.1:0", value_name = "ADDR")]
        bind: String,

        /// Bind to 0.0.0.0 instead of 127.0.0.1
        #[arg(long)]
        gateway: bool,
    },

    /// Run a local SOCKS5 proxy that forwards through the relay
    Socks5Proxy {
        /// Hybrid connection name (alternative to --entity)
        entity_path: Option<String>,

        /// Local bind address:port
        #[arg(short = 'b', long, default_value = "127.0.0.1:1080", value_name = "ADDR")]
        bind: String,

        /// Bind to 0.0.0.0 instead of 127.0.0.1
        #[arg(long)]
        gateway: bool,
    },

    /// One-shot stdin/stdout connection through the relay (ssh ProxyCommand)
    Connect {
        /// Target host:port the listener should dial
        target: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if matches!(cli.command, Command::Version) {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    if let Err(e) = run(cli, cancel.clone()).await {
        // A termination signal ends in-flight bridges with a cancellation
        // error; that is a clean shutdown, not a failure.
        if cancel.is_cancelled() {
            return;
        }
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let (endpoint, token_provider) = resolve_auth(&cli)?;
    let metrics = resolve_metrics(&cancel, &cli).await?;

    match cli.command {
        Command::Listener {
            entity_path,
            allow,
            max_connections,
            connect_timeout,
        } => {
            let entity = resolve_entity(&cli.entity, &entity_path)?;
            let mut cfg = listener::Config::new(endpoint, entity, token_provider);
            cfg.allow_list = allow;
            cfg.max_connections = max_connections;
            cfg.connect_timeout = connect_timeout;
            cfg.tcp_keepalive = cli.tcp_keepalive;
            cfg.metrics = metrics;
            listener::listen_and_serve(cancel, cfg).await
        }

        Command::Sender { mode } => match mode {
            SenderMode::PortForward {
                target,
                bind,
                gateway,
            } => {
                let entity = resolve_entity(&cli.entity, &None)?;
                let cfg = sender::PortForwardConfig {
                    endpoint,
                    entity_path: entity,
                    token_provider,
                    target,
                    bind_address: resolve_bind(&bind, gateway),
                    tcp_keepalive: cli.tcp_keepalive,
                    dial_timeout: cli.dial_timeout,
                    metrics,
                };
                sender::port_forward(cancel, cfg).await
            }

            SenderMode::Socks5Proxy {
                entity_path,
                bind,
                gateway,
            } => {
                let entity = resolve_entity(&cli.entity, &entity_path)?;
                let cfg = sender::Socks5Config {
                    endpoint,
                    entity_path: entity,
                    token_provider,
                    bind_address: resolve_bind(&bind, gateway),
                    tcp_keepalive: cli.tcp_keepalive,
                    dial_timeout: cli.dial_timeout,
                    metrics,
                };
                sender::socks5_proxy(cancel, cfg).await
            }

            SenderMode::Connect { target } => {
                let entity = resolve_entity(&cli.entity, &None)?;
                let cfg = sender::ConnectConfig {
                    endpoint,
                    entity_path: entity,
                    token_provider,
                    target,
                    dial_timeout: cli.dial_timeout,
                    metrics,
                };
                sender::connect(cancel, cfg).await
            }
        },

        Command::Version => Ok(()),
    }
}

fn init_logging(level: &str) {
    let filter = match level.to_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format_timestamp_millis()
        .init();
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Determines the endpoint and token provider from flags and environment.
/// SAS credentials win over a bearer token command when both are present.
fn resolve_auth(cli: &Cli) -> Result<(String, Arc<dyn TokenProvider>)> {
    let ns = cli
        .endpoint
        .clone()
        .filter(|v| !v.is_empty())
        .or_else(|| env_nonempty(ENV_ENDPOINT))
        .ok_or_else(|| {
            anyhow!("relay endpoint is required: use --endpoint or set {ENV_ENDPOINT}")
        })?;

    let suffix = cli
        .endpoint_suffix
        .clone()
        .filter(|v| !v.is_empty())
        .or_else(|| env_nonempty(ENV_ENDPOINT_SUFFIX))
        .unwrap_or_else(|| DEFAULT_RELAY_SUFFIX.to_string());

    let endpoint = parse_relay_endpoint(&ns, &suffix);
    if endpoint.is_empty() {
        bail!("invalid relay endpoint: {ns:?}");
    }

    let key_name = env_nonempty(ENV_KEY_NAME);
    let key = env_nonempty(ENV_KEY);
    if let (Some(key_name), Some(key)) = (key_name, key) {
        return Ok((endpoint, Arc::new(SasTokenProvider { key_name, key })));
    }

    if let Some(command) = env_nonempty(ENV_TOKEN_COMMAND) {
        return Ok((endpoint, Arc::new(BearerTokenProvider::new(command))));
    }

    bail!(
        "no credentials found: set {ENV_KEY_NAME}/{ENV_KEY} for shared-access auth \
         or {ENV_TOKEN_COMMAND} for bearer auth"
    )
}

/// Returns the entity path from --entity, the positional argument, or the
/// environment, in that order.
fn resolve_entity(flag: &Option<String>, positional: &Option<String>) -> Result<String> {
    if let Some(entity) = flag.clone().filter(|v| !v.is_empty()) {
        return Ok(entity);
    }
    if let Some(entity) = positional.clone().filter(|v| !v.is_empty()) {
        return Ok(entity);
    }
    if let Some(entity) = env_nonempty(ENV_ENTITY) {
        return Ok(entity);
    }
    bail!("entity path is required: use --entity or set {ENV_ENTITY}")
}

/// Rebinds to the wildcard address, keeping the configured port.
fn resolve_bind(bind: &str, gateway: bool) -> String {
    if !gateway {
        return bind.to_string();
    }
    let port = bind.rsplit_once(':').map(|(_, p)| p).unwrap_or("0");
    let port = if port.is_empty() { "0" } else { port };
    format!("0.0.0.0:{port}")
}

/// Starts the metrics server when an address is configured; returns the
/// registry handle for the tunnel components.
async fn resolve_metrics(cancel: &CancellationToken, cli: &Cli) -> Result<Option<Arc<Metrics>>> {
    let addr = cli
        .metrics_addr
        .clone()
        .filter(|v| !v.is_empty())
        .or_else(|| env_nonempty(ENV_METRICS_ADDR));
    let Some(addr) = addr else {
        return Ok(None);
    };

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("metrics listen on {addr}"))?;
    let metrics = Metrics::new(cli.metrics_max_targets);

    let serve_cancel = cancel.child_token();
    let serve_metrics = Arc::clone(&metrics);
    tokio::spawn(async move {
        if let Err(e) = http::serve_metrics(serve_cancel, serve_metrics, listener).await {
            log::error!("metrics server failed: {e:#}");
        }
    });

    Ok(Some(metrics))
}

/// Parses durations like `30s`, `500ms`, `5m`, `1h`, or bare seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let parse = |digits: &str, unit_ms: u64| -> Result<Duration, String> {
        digits
            .trim()
            .parse::<u64>()
            .map(|n| Duration::from_millis(n * unit_ms))
            .map_err(|e| format!("invalid duration {s:?}: {e}"))
    };
    if let Some(ms) = s.strip_suffix("ms") {
        return parse(ms, 1);
    }
    if let Some(h) = s.strip_suffix('h') {
        return parse(h, 3_600_000);
    }
    if let Some(m) = s.strip_suffix('m') {
        return parse(m, 60_000);
    }
    if let Some(sec) = s.strip_suffix('s') {
        return parse(sec, 1000);
    }
    parse(s, 1000)
}
