//! HTTP server exposing the metrics registry.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;

/// Serves `/metrics` and `/health` on the given listener until `cancel`
/// fires.
pub async fn serve_metrics(
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
    listener: TcpListener,
) -> Result<()> {
    info!(
        "metrics server listening on http://{}/metrics",
        listener.local_addr().context("local addr")?
    );

    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let metrics = Arc::clone(&metrics);
                handle_request(req, metrics)
            });

            let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);

            if let Err(e) = conn.await {
                debug!("metrics connection error: {e}");
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<String>, Infallible> {
    match req.uri().path() {
        "/metrics" => {
            let body = metrics.to_prometheus();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4")
                .body(body)
                .unwrap())
        }
        "/health" => Ok(Response::builder()
            .status(StatusCode::OK)
            .body("OK".to_string())
            .unwrap()),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body("Not Found".to_string())
            .unwrap()),
    }
}
