use anyhow::{Context, Result};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

use crate::config::FilterMode;

const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;
const MAX_ENTRIES: usize = 1_000_000;

/// Resolved destination addresses checked on every connection.
///
/// Built once at startup; lookups are a single hash probe.
pub struct StaticFilter {
    mode: FilterMode,
    ips: HashSet<IpAddr>,
}

impl StaticFilter {
    pub fn new(mode: FilterMode, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            mode,
            ips: ips.into_iter().collect(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(FilterMode::Disabled, [])
    }

    /// Reads a list of domains or IPs and resolves every entry to its addresses.
    ///
    /// Names that do not resolve are skipped with a warning.
    pub async fn load(mode: FilterMode, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to read metadata for {} file: {:?}", mode, path))?;

        if metadata.len() > MAX_FILE_SIZE {
            anyhow::bail!("{} file too large", mode);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {} file: {:?}", mode, path))?;

        let mut ips = HashSet::new();
        let mut raw_count = 0;

        for line in content.lines() {
            raw_count += 1;

            let Some(entry) = parse_entry_line(line) else {
                continue;
            };

            if let Ok(ip) = entry.parse::<IpAddr>() {
                ips.insert(ip);
                continue;
            }

            match tokio::net::lookup_host((entry, 0)).await {
                Ok(addrs) => {
                    for addr in addrs {
                        ips.insert(addr.ip());
                    }
                }
                Err(e) => {
                    tracing::warn!("Skipping {} entry {}: {}", mode, entry, e);
                }
            }

            if ips.len() > MAX_ENTRIES {
                anyhow::bail!("Too many addresses in {}", mode);
            }
        }

        tracing::info!(
            "Initialized {} with {} addresses from {} lines",
            mode,
            ips.len(),
            raw_count
        );

        Ok(Self { mode, ips })
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        match self.mode {
            FilterMode::Denylist => self.ips.contains(&ip),
            FilterMode::Allowlist => !self.ips.contains(&ip),
            FilterMode::Disabled => false,
        }
    }
}

/// Reduces a list line to a bare host or IP, or `None` for comments and blanks.
fn parse_entry_line(line: &str) -> Option<&str> {
    let mut entry = line.trim();

    if entry.is_empty() || entry.starts_with('#') {
        return None;
    }

    for scheme in ["https://", "http://"] {
        if let Some(rest) = entry.strip_prefix(scheme) {
            entry = rest;
            break;
        }
    }

    entry = entry.split_whitespace().next()?;

    if let Some(idx) = entry.find(&['/', '?', '#'][..]) {
        entry = &entry[..idx];
    }

    // [v6]:port or [v6]
    if let Some(rest) = entry.strip_prefix('[') {
        return rest.split(']').next().filter(|h| !h.is_empty());
    }

    // host:port, but leave bare IPv6 literals alone
    if entry.matches(':').count() == 1 {
        entry = entry.split(':').next()?;
    }

    let entry = entry.trim_end_matches('.');
    if entry.is_empty() {
        None
    } else {
        Some(entry)
    }
}
