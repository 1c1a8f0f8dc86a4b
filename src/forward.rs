//! Destination connections and byte relays.
//!
//! Plain HTTP requests are written to the destination once and the response
//! is streamed back to the client while being buffered for the cache. CONNECT
//! requests become an opaque tunnel: two one-way pumps raced against each
//! other, where the first one to stop tears the tunnel down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};

pub const RESPONSE_200: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";
pub const RESPONSE_403: &[u8] = b"HTTP/1.1 403 Site Blocked\r\n\r\n";
pub const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Connection Error\r\n\r\n";

/// Byte counts for one forwarded exchange.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Client to destination.
    pub sent: u64,
    /// Destination to client.
    pub received: u64,
}

/// Connects to `addr`, answering `502` to the client when that fails.
pub async fn connect_destination<C>(
    client: &mut C,
    addr: SocketAddr,
    connect_timeout: Duration,
) -> Result<TcpStream>
where
    C: AsyncWrite + Unpin,
{
    let reason = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(server)) => {
            let _ = server.set_nodelay(true);
            return Ok(server);
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {:?}", connect_timeout),
    };

    let _ = client.write_all(RESPONSE_502).await;
    let _ = client.shutdown().await;
    Err(ProxyError::Connect { addr, reason })
}

/// Relays one HTTP request/response pair.
///
/// `request` is the raw client request, written unmodified. When the client
/// declared a body longer than what was already read, the rest is copied
/// from the client before the response is read.
///
/// The response is streamed to the client and also buffered while it fits in
/// `buffer_limit` bytes. Past that point the buffer is dropped and `None` is
/// returned in its place.
pub async fn http_forward<C>(
    client: &mut C,
    server: &mut TcpStream,
    request: &[u8],
    remaining_body: usize,
    buffer_limit: usize,
    config: &ProxyConfig,
) -> Result<(Option<Bytes>, Transfer)>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let mut transfer = Transfer::default();

    server.write_all(request).await?;
    transfer.sent += request.len() as u64;

    if remaining_body > 0 {
        transfer.sent += relay_body(client, server, remaining_body, config).await?;
    }
    server.flush().await?;

    let mut response = Some(BytesMut::new());
    let mut buf = vec![0u8; config.buffer_size.max(1) * 2];

    loop {
        let n = match timeout(config.io_timeout, server.read(&mut buf)).await {
            Ok(Ok(0)) => {
                trace!("HTTP: destination closed");
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("HTTP: destination read failed: {}", e);
                break;
            }
            Err(_) => {
                trace!("HTTP: no data within {:?}, done", config.io_timeout);
                break;
            }
        };

        if transfer.received == 0 {
            trace!("HTTP: receiving response");
        }
        transfer.received += n as u64;

        if let Some(buffered) = response.as_mut() {
            if buffered.len() + n > buffer_limit {
                trace!("HTTP: response exceeds {} bytes, no longer buffering", buffer_limit);
                response = None;
            } else {
                buffered.extend_from_slice(&buf[..n]);
            }
        }

        if let Err(e) = client.write_all(&buf[..n]).await {
            debug!("HTTP: client went away: {}", e);
            break;
        }
    }

    let _ = client.flush().await;
    Ok((response.map(BytesMut::freeze), transfer))
}

/// Copies up to `remaining` request body bytes from the client.
///
/// Stops early when the client closes or stays silent for `io_timeout`.
async fn relay_body<C>(
    client: &mut C,
    server: &mut TcpStream,
    mut remaining: usize,
    config: &ProxyConfig,
) -> Result<u64>
where
    C: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; config.buffer_size.max(1)];
    let mut copied = 0u64;

    while remaining > 0 {
        let want = remaining.min(buf.len());
        let n = match timeout(config.io_timeout, client.read(&mut buf[..want])).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("HTTP: client body read failed: {}", e);
                break;
            }
            Err(_) => {
                debug!("HTTP: client body stalled with {} bytes unsent", remaining);
                break;
            }
        };

        server.write_all(&buf[..n]).await?;
        copied += n as u64;
        remaining -= n;
    }

    Ok(copied)
}

/// Answers `200` and relays bytes both ways until either side stops.
///
/// Each direction runs as its own pump. The tunnel ends when a pump sees
/// end-of-stream or an I/O error, or when neither direction has carried a
/// byte for `config.tunnel_idle_timeout`.
pub async fn https_forward(
    client: &mut TcpStream,
    server: &mut TcpStream,
    config: &ProxyConfig,
) -> Result<Transfer> {
    client.write_all(RESPONSE_200).await?;
    client.flush().await?;

    let (mut client_read, mut client_write) = client.split();
    let (mut server_read, mut server_write) = server.split();

    let activity = Activity::new();
    let up = AtomicU64::new(0);
    let down = AtomicU64::new(0);

    let outcome = tokio::select! {
        outcome = pump(&mut client_read, &mut server_write, &activity, &up, config) => {
            trace!("Tunnel: client side finished ({:?})", outcome);
            outcome
        }
        outcome = pump(&mut server_read, &mut client_write, &activity, &down, config) => {
            trace!("Tunnel: destination side finished ({:?})", outcome);
            outcome
        }
    };

    let _ = client_write.shutdown().await;
    let _ = server_write.shutdown().await;

    let transfer = Transfer {
        sent: up.load(Ordering::Relaxed),
        received: down.load(Ordering::Relaxed),
    };

    match outcome {
        PumpEnd::Closed | PumpEnd::Idle => Ok(transfer),
        PumpEnd::Failed(e) => Err(e.into()),
    }
}

#[derive(Debug)]
enum PumpEnd {
    Closed,
    Idle,
    Failed(std::io::Error),
}

/// Last time either tunnel direction moved data.
struct Activity {
    origin: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_millis.load(Ordering::Relaxed)))
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: &Activity,
    counter: &AtomicU64,
    config: &ProxyConfig,
) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; config.buffer_size.max(1)];
    let idle = config.tunnel_idle_timeout;

    loop {
        let n = match timeout(idle, reader.read(&mut buf)).await {
            Ok(Ok(0)) => return PumpEnd::Closed,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return PumpEnd::Failed(e),
            Err(_) => {
                // The other direction may still be busy.
                if activity.idle_for() >= idle {
                    return PumpEnd::Idle;
                }
                continue;
            }
        };

        activity.touch();
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return PumpEnd::Failed(e);
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}
