//! Accept loop and per-connection dispatch.
//!
//! Each client connection is handled on its own task:
//!
//! read request head -> parse -> resolve -> static filter -> trust filter
//!   CONNECT -> tunnel
//!   other   -> cache hit, or forward and fill the cache

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

use crate::cache::ResponseCache;
use crate::config::ProxyConfig;
use crate::error::{is_expected_error, ProxyError, Result};
use crate::forward::{self, Transfer, RESPONSE_403};
use crate::request::{parse_request, read_request_head, ProxyRequest};
use crate::static_filter::StaticFilter;
use crate::stats::Stats;
use crate::trust_filter::TrustFilter;

/// Everything a connection task needs, shared across tasks.
pub struct ProxyState {
    pub config: ProxyConfig,
    pub cache: ResponseCache,
    pub static_filter: StaticFilter,
    /// `None` when dynamic filtering is switched off.
    pub trust_filter: Option<TrustFilter>,
    pub stats: Arc<Stats>,
}

/// Accepts connections until `shutdown` resolves or the listener fails.
///
/// Connection tasks already running are left to finish on their own.
pub async fn serve<F>(
    listener: TcpListener,
    state: Arc<ProxyState>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        let (client_stream, client_addr) = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, no longer accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    return Err(e);
                }
            },
        };

        state.stats.total.fetch_add(1, Ordering::Relaxed);
        state.stats.active.fetch_add(1, Ordering::Relaxed);

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(client_stream, client_addr, &state).await {
                log_connection_error(client_addr, &e);
                state.stats.failed.fetch_add(1, Ordering::Relaxed);
            }

            state.stats.active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

fn log_connection_error(client_addr: SocketAddr, e: &ProxyError) {
    match e {
        ProxyError::Io(io_err) if is_expected_error(io_err) => {
            trace!("Connection from {} closed: {}", client_addr, io_err);
        }
        ProxyError::Connect { .. } | ProxyError::Resolve { .. } => {
            info!("{}", e);
        }
        _ => debug!("Connection error from {}: {}", client_addr, e),
    }
}

async fn handle_connection(
    mut client: TcpStream,
    client_addr: SocketAddr,
    state: &ProxyState,
) -> Result<()> {
    let _ = client.set_nodelay(true);
    let config = &state.config;

    let raw = read_request_head(
        &mut client,
        config.buffer_size,
        config.max_header_size,
        config.request_timeout,
    )
    .await?;

    if raw.is_empty() {
        trace!("{} disconnected without a request", client_addr);
        return Ok(());
    }

    let request = parse_request(&raw)?;
    let dest_ip = resolve(&request.host, request.port).await?;

    info!(
        "Client request: {} {} ({}) port {}",
        request.method, request.target, dest_ip, request.port
    );

    if state.static_filter.is_blocked(dest_ip) {
        warn!("Blocked {} ({}) by {}", request.host, dest_ip, state.static_filter.mode());
        return reject(&mut client, state).await;
    }

    if let Some(trust_filter) = &state.trust_filter {
        let decision = trust_filter.check(&request.target).await;
        if decision.is_blocked() {
            warn!("Blocked {} by content filter ({:?})", request.target, decision);
            return reject(&mut client, state).await;
        }
    }

    let dest = SocketAddr::new(dest_ip, request.port);

    if request.is_connect() {
        let mut server =
            forward::connect_destination(&mut client, dest, config.connect_timeout).await?;
        debug!("HTTPS: tunnel to {}:{} open", request.host, request.port);

        let transfer = forward::https_forward(&mut client, &mut server, config).await;
        debug!("HTTPS: tunnel to {}:{} closed", request.host, request.port);
        record_transfer(state, transfer?);
        return Ok(());
    }

    if let Some(content) = state.cache.lookup(&request.target) {
        debug!("HTTP: cache hit {}", request.target);
        state.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        client.write_all(&content).await?;
        client.flush().await?;
        record_transfer(
            state,
            Transfer {
                sent: 0,
                received: content.len() as u64,
            },
        );
        return Ok(());
    }

    forward_http(&mut client, &request, &raw, dest, state).await
}

async fn forward_http(
    client: &mut TcpStream,
    request: &ProxyRequest,
    raw: &[u8],
    dest: SocketAddr,
    state: &ProxyState,
) -> Result<()> {
    let config = &state.config;
    let mut server = forward::connect_destination(client, dest, config.connect_timeout).await?;

    let remaining_body = request.remaining_body(raw.len());
    let (response, transfer) = forward::http_forward(
        client,
        &mut server,
        raw,
        remaining_body,
        state.cache.max_size(),
        config,
    )
    .await?;
    debug!("HTTP: done receiving {} ({} bytes)", request.target, transfer.received);
    record_transfer(state, transfer);

    match response {
        Some(response) if response.is_empty() => {}
        Some(response) => {
            if !state.cache.insert(&request.target, response) {
                debug!("HTTP: response for {} too large to cache", request.target);
            }
        }
        None => debug!("HTTP: response for {} too large to cache", request.target),
    }

    Ok(())
}

async fn reject(client: &mut TcpStream, state: &ProxyState) -> Result<()> {
    state.stats.blocked.fetch_add(1, Ordering::Relaxed);
    client.write_all(RESPONSE_403).await?;
    client.flush().await?;
    Ok(())
}

fn record_transfer(state: &ProxyState, transfer: Transfer) {
    state.stats.bytes_out.fetch_add(transfer.sent, Ordering::Relaxed);
    state.stats.bytes_in.fetch_add(transfer.received, Ordering::Relaxed);
}

/// Resolves `host`, preferring an IPv4 address when both families answer.
async fn resolve(host: &str, port: u16) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let resolve_error = |reason: String| ProxyError::Resolve {
        host: host.to_string(),
        reason,
    };

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| resolve_error(e.to_string()))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .map(|addr| addr.ip())
        .ok_or_else(|| resolve_error("no addresses returned".into()))
}
