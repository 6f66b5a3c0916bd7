//! Read-only HTTP status page
//!
//! `GET /` lists the database pool size and, per port, raw and effective
//! traffic since the last flush. Peers outside the whitelist are dropped
//! without a response.

use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Local, TimeZone};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use ipnetwork::IpNetwork;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stats::{PortCounters, UsageMeter};
use crate::store::UsageStore;
use crate::transport::socket::normalize_ip;

const KB: i64 = 1024;
const MB: i64 = 1024 * KB;
const GB: i64 = 1024 * MB;

/// Human-readable byte count.
pub fn readable(bytes: i64) -> String {
    let float = bytes as f64;
    if bytes > GB {
        format!("{:.2} GB", float / GB as f64)
    } else if bytes > MB {
        format!("{:.2} MB", float / MB as f64)
    } else if bytes > KB {
        format!("{:.2} KB", float / KB as f64)
    } else {
        format!("{bytes} Bytes")
    }
}

fn format_time(t: i64) -> String {
    if t == 0 {
        return "-".to_string();
    }
    match Local.timestamp_opt(t, 0).single() {
        Some(at) => at.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => t.to_string(),
    }
}

pub fn render_status(pool_size: u32, ports: &[(u16, PortCounters)]) -> String {
    let mut out = String::with_capacity(64 + ports.len() * 96);
    let _ = writeln!(out, "Relay Server Stat:\n");
    let _ = writeln!(out, "DBPool: {pool_size}\n");
    for (port, c) in ports {
        let _ = writeln!(
            out,
            "Port: {port}\t U: {}({}) D: {}({}) T: {}",
            readable(c.u),
            readable(c.u + c.ue),
            readable(c.d),
            readable(c.d + c.de),
            format_time(c.t),
        );
    }
    out
}

#[derive(Clone)]
struct StatusState {
    meter: Arc<UsageMeter>,
    store: Arc<dyn UsageStore>,
}

fn allowed(whitelist: &[IpNetwork], peer: SocketAddr) -> bool {
    let ip = normalize_ip(peer).ip();
    whitelist.is_empty() || whitelist.iter().any(|net| net.contains(ip))
}

pub async fn serve(
    addr: SocketAddr,
    meter: Arc<UsageMeter>,
    store: Arc<dyn UsageStore>,
    whitelist: Vec<IpNetwork>,
    shutdown: CancellationToken,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, "Failed to bind status page on {}", addr);
            return;
        }
    };
    info!("Status page: http://{}/", addr);
    serve_on(listener, meter, store, whitelist, shutdown).await;
}

async fn serve_on(
    listener: TcpListener,
    meter: Arc<UsageMeter>,
    store: Arc<dyn UsageStore>,
    whitelist: Vec<IpNetwork>,
    shutdown: CancellationToken,
) {
    let state = StatusState { meter, store };

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = listener.accept() => r,
        };
        let (stream, peer) = match accepted {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Status accept error");
                continue;
            }
        };

        if !allowed(&whitelist, peer) {
            debug!(peer = %peer, "Status request denied by whitelist");
            continue;
        }

        let state = state.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let state = state.clone();
                async move { handle(req, &state) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(hyper_util::rt::TokioIo::new(stream), svc)
                .await
            {
                debug!(error = %e, "Status connection error");
            }
        });
    }
}

fn respond(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn handle(req: Request<hyper::body::Incoming>, state: &StatusState) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::GET || req.uri().path() != "/" {
        return Ok(respond(StatusCode::NOT_FOUND, "Not Found\n".to_string()));
    }
    let body = render_status(state.store.pool_size(), &state.meter.snapshot());
    Ok(respond(StatusCode::OK, body))
}
