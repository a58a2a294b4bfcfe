//! Finding controllers on the local network.
//!
//! A [`ServiceBrowser`] yields raw advertisements; this module turns them
//! into [`DiscoveredServer`]s with a canonical URL, drops duplicates and
//! sorts the survivors for presentation.

mod browser;

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::error::Result;

pub use browser::{BrowseEvent, BrowseStream, MdnsBrowser, RawServiceEntry, ServiceBrowser};

/// DNS-SD service type advertised by the controller.
pub const SERVICE_TYPE: &str = "_home-assistant._tcp.local.";

const TXT_VERSION: &str = "version=";
const TXT_UUID: &str = "uuid=";
const TXT_INTERNAL_URL: &str = "internal_url=";
const TXT_EXTERNAL_URL: &str = "external_url=";

/// A controller found on the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredServer {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    /// Derived from the fields above; see [`resolve_url`].
    pub url: String,
}

impl fmt::Display for DiscoveredServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(version) = &self.version {
            write!(f, " (v{version})")?;
        }
        if !self.url.is_empty() {
            write!(f, " - {}", self.url)?;
        }
        Ok(())
    }
}

/// Browse for controllers with mDNS for `timeout`.
///
/// An empty list is a normal outcome.  Failing to set up the browser is an
/// [`AuthError::Discovery`] error.
pub async fn discover_servers(timeout: Duration) -> Result<Vec<DiscoveredServer>> {
    let browser = MdnsBrowser::new()?;
    discover_with(&browser, timeout).await
}

/// [`discover_servers`] over the configured discovery window.
pub async fn discover_servers_with(config: &AuthConfig) -> Result<Vec<DiscoveredServer>> {
    discover_servers(config.discovery_timeout).await
}

/// Drain `browser` until `timeout` elapses or the search stops.
///
/// Only starting the browse can fail; once advertisements are flowing the
/// window always ends with whatever was collected.
pub async fn discover_with(
    browser: &dyn ServiceBrowser,
    timeout: Duration,
) -> Result<Vec<DiscoveredServer>> {
    let deadline = Instant::now() + timeout;
    let mut stream = browser.browse(SERVICE_TYPE).inspect_err(|err| {
        warn!(error = %err, "failed to start browse");
    })?;

    let mut found = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(BrowseEvent::Resolved(raw))) => match parse_entry(raw) {
                Some(server) => {
                    debug!(name = %server.name, url = %server.url, "controller resolved");
                    found.push(server);
                }
                None => debug!("dropping advertisement without a usable address"),
            },
            Ok(Some(BrowseEvent::SearchStopped) | None) => break,
            Err(_) => break,
        }
    }

    let servers = collect_servers(found);
    info!(count = servers.len(), "discovery finished");
    Ok(servers)
}

/// Parse one advertisement. `None` when no URL can be derived.
pub fn parse_entry(raw: RawServiceEntry) -> Option<DiscoveredServer> {
    let mut version = None;
    let mut uuid = None;
    let mut internal_url = None;
    let mut external_url = None;
    for record in &raw.txt {
        let slot = if let Some(value) = record.strip_prefix(TXT_VERSION) {
            Some((&mut version, value))
        } else if let Some(value) = record.strip_prefix(TXT_UUID) {
            Some((&mut uuid, value))
        } else if let Some(value) = record.strip_prefix(TXT_INTERNAL_URL) {
            Some((&mut internal_url, value))
        } else if let Some(value) = record.strip_prefix(TXT_EXTERNAL_URL) {
            Some((&mut external_url, value))
        } else {
            None
        };
        if let Some((field, value)) = slot {
            if !value.is_empty() {
                *field = Some(value.to_string());
            }
        }
    }

    let mut server = DiscoveredServer {
        name: raw.instance.replace("\\ ", " "),
        hostname: raw.hostname,
        port: raw.port,
        ipv4: raw.ipv4,
        ipv6: raw.ipv6,
        version,
        uuid,
        internal_url,
        external_url,
        url: String::new(),
    };
    server.url = resolve_url(&server)?;
    Some(server)
}

/// Canonical URL for `server`.
///
/// Priority: internal URL override, first IPv4 address, first IPv6
/// address, then the hostname without its trailing root dot.
pub fn resolve_url(server: &DiscoveredServer) -> Option<String> {
    if let Some(url) = &server.internal_url {
        return Some(url.clone());
    }

    let host = if let Some(ip) = server.ipv4.first() {
        ip.to_string()
    } else if let Some(ip) = server.ipv6.first() {
        format!("[{ip}]")
    } else {
        let name = server.hostname.trim_end_matches('.');
        if name.is_empty() {
            return None;
        }
        name.to_string()
    };

    let (scheme, default_port) = match server.port {
        443 | 8443 => ("https", 443),
        _ => ("http", 80),
    };
    if server.port == default_port {
        Some(format!("{scheme}://{host}"))
    } else {
        Some(format!("{scheme}://{host}:{}", server.port))
    }
}

/// Deduplicate on URL, keeping the shorter name, then sort by name.
pub fn collect_servers(
    servers: impl IntoIterator<Item = DiscoveredServer>,
) -> Vec<DiscoveredServer> {
    let mut by_url: HashMap<String, DiscoveredServer> = HashMap::new();
    for server in servers {
        match by_url.get(&server.url) {
            Some(kept) if kept.name.len() <= server.name.len() => {}
            _ => {
                by_url.insert(server.url.clone(), server);
            }
        }
    }

    let mut servers: Vec<_> = by_url.into_values().collect();
    servers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.url.cmp(&b.url)));
    servers
}
