#![warn(clippy::all)]

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use trust_proxy::cache::ResponseCache;
use trust_proxy::config::{FilterMode, ProxyConfig};
use trust_proxy::phrases::{self, BannedPhrases};
use trust_proxy::server::{self, ProxyState};
use trust_proxy::static_filter::StaticFilter;
use trust_proxy::stats::Stats;
use trust_proxy::trust_filter::{self, TrustFilter};
use trust_proxy::verifier::HttpVerifier;

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    /// Listen address: an IP literal or a host name.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Pending-connection queue length for the listening socket.
    #[arg(long, default_value_t = 5)]
    backlog: i32,

    #[arg(long, value_enum, default_value_t = FilterMode::Denylist)]
    mode: FilterMode,

    #[arg(long, default_value = "denylist.txt")]
    denylist: PathBuf,

    #[arg(long, default_value = "allowlist.txt")]
    allowlist: PathBuf,

    /// Enable the content-inspecting trust filter.
    #[arg(long)]
    dynamic_filter: bool,

    #[arg(long, default_value = "banned_phrases.txt")]
    banned_phrases: PathBuf,

    #[arg(long, default_value = "banned_phrases_encoded.txt")]
    banned_phrases_encoded: PathBuf,

    /// Seconds allowed for a content verification fetch.
    #[arg(long, default_value_t = 5)]
    verify_timeout: u64,

    /// URLs remembered by the trust filter before the oldest are forgotten.
    #[arg(long, default_value_t = trust_filter::DEFAULT_CAPACITY)]
    trust_capacity: usize,

    #[arg(long, default_value_t = 4096)]
    buffer_size: usize,

    /// Relay poll window in milliseconds.
    #[arg(long, default_value_t = 250)]
    io_timeout_ms: u64,

    /// Tunnel idle window in milliseconds; defaults to --io-timeout-ms.
    #[arg(long)]
    tunnel_idle_ms: Option<u64>,

    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Response cache budget in bytes.
    #[arg(long, default_value_t = 1 << 24)]
    cache_size: usize,

    /// Response cache entry lifetime in seconds.
    #[arg(long, default_value_t = 60)]
    cache_ttl: u64,

    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    /// Write <name>_encoded.txt for the given phrase list and exit.
    #[arg(long, value_name = "PATH")]
    encode_phrases: Option<PathBuf>,

    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn proxy_config(&self) -> ProxyConfig {
        let io_timeout = Duration::from_millis(self.io_timeout_ms);
        ProxyConfig {
            buffer_size: self.buffer_size,
            io_timeout,
            tunnel_idle_timeout: self
                .tunnel_idle_ms
                .map(Duration::from_millis)
                .unwrap_or(io_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            ..ProxyConfig::default()
        }
    }
}

// ============================================================================
// MAIN
// ============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    if let Some(ref path) = args.encode_phrases {
        let written = phrases::encode_file(path)?;
        info!("Wrote {}", written.display());
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get() * 2)
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let static_filter = match args.mode {
        FilterMode::Denylist => StaticFilter::load(args.mode, &args.denylist).await?,
        FilterMode::Allowlist => StaticFilter::load(args.mode, &args.allowlist).await?,
        FilterMode::Disabled => StaticFilter::disabled(),
    };

    let trust_filter = if args.dynamic_filter {
        let phrases = Arc::new(BannedPhrases::load(
            &args.banned_phrases,
            &args.banned_phrases_encoded,
        )?);
        if phrases.is_empty() {
            warn!("Dynamic filter enabled with no banned phrases; every verified page passes");
        }
        let verifier = HttpVerifier::new(phrases, Duration::from_secs(args.verify_timeout))
            .context("Failed to build verification client")?;
        Some(TrustFilter::with_capacity(
            Arc::new(verifier),
            args.trust_capacity,
        ))
    } else {
        None
    };

    let state = Arc::new(ProxyState {
        config: args.proxy_config(),
        cache: ResponseCache::new(args.cache_size, Duration::from_secs(args.cache_ttl)),
        static_filter,
        trust_filter,
        stats: Arc::new(Stats::new()),
    });

    if args.stats_interval > 0 {
        let state_clone = state.clone();
        let interval = args.stats_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(interval));
            timer.tick().await;
            loop {
                timer.tick().await;
                print_stats(&state_clone);
            }
        });
    }

    let addr = listen_addr(&args.host, args.port).await?;
    let listener = bind_listener(addr, args.backlog)?;

    info!(
        "Running on {} (mode={}, dynamic filter={}, cache={}B/{}s)",
        addr,
        args.mode,
        if args.dynamic_filter { "on" } else { "off" },
        args.cache_size,
        args.cache_ttl
    );
    info!("Ctrl+C to stop");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    server::serve(listener, state.clone(), shutdown)
        .await
        .context("Accept loop terminated")?;

    print_stats(&state);
    Ok(())
}

fn print_stats(state: &ProxyState) {
    state.stats.print();
    info!(
        "cache: {} entries, {}/{} bytes, {} hits, {} misses",
        state.cache.len(),
        state.cache.current_size(),
        state.cache.max_size(),
        state.cache.hits(),
        state.cache.misses()
    );
    if let Some(trust_filter) = &state.trust_filter {
        info!("trust filter: {} URLs tracked", trust_filter.tracked_urls());
    }
}

/// Resolves `--host`, which may be an IP literal or a host name.
async fn listen_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .with_context(|| format!("{} resolved to no addresses", host))
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> anyhow::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    match socket.bind(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            anyhow::bail!("Port {} already in use, run with a different --port", addr.port());
        }
        Err(e) => return Err(e).with_context(|| format!("Bind failed on {}", addr)),
    }

    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into())?)
}

// ============================================================================
// TESTS
// ============================================================================
