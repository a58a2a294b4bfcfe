use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::{AuthError, Result};

/// How often the blocking receiver wakes to check for a dropped consumer.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

const EVENT_BUFFER: usize = 32;

/// One advertisement as seen on the wire, before any interpretation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawServiceEntry {
    /// Instance label, still DNS-escaped.
    pub instance: String,
    pub hostname: String,
    pub port: u16,
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
    /// TXT records as `key=value` strings.
    pub txt: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Resolved(RawServiceEntry),
    /// Terminal: nothing further will be produced.
    SearchStopped,
}

pub type BrowseStream = Pin<Box<dyn Stream<Item = BrowseEvent> + Send>>;

/// Source of service advertisements.
///
/// Dropping the returned stream cancels the browse.
pub trait ServiceBrowser: Send + Sync {
    fn browse(&self, service_type: &str) -> Result<BrowseStream>;
}

/// Browser backed by the `mdns-sd` daemon.
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
}

impl MdnsBrowser {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| AuthError::Discovery(e.to_string()))?;
        Ok(Self { daemon })
    }
}

impl ServiceBrowser for MdnsBrowser {
    fn browse(&self, service_type: &str) -> Result<BrowseStream> {
        let events = self
            .daemon
            .browse(service_type)
            .map_err(|e| AuthError::Discovery(e.to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let daemon = self.daemon.clone();
        let service_type = service_type.to_string();

        tokio::task::spawn_blocking(move || {
            while !tx.is_closed() {
                let Ok(event) = events.recv_timeout(POLL_INTERVAL) else {
                    if events.is_disconnected() {
                        let _ = tx.blocking_send(BrowseEvent::SearchStopped);
                        break;
                    }
                    continue;
                };
                let forwarded = match event {
                    ServiceEvent::ServiceResolved(info) => {
                        BrowseEvent::Resolved(raw_entry(&info, &service_type))
                    }
                    ServiceEvent::SearchStopped(_) => {
                        let _ = tx.blocking_send(BrowseEvent::SearchStopped);
                        break;
                    }
                    _ => continue,
                };
                if tx.blocking_send(forwarded).is_err() {
                    break;
                }
            }

            if let Err(err) = daemon.stop_browse(&service_type) {
                debug!(error = %err, "stop_browse failed");
            }
            if let Err(err) = daemon.shutdown() {
                warn!(error = %err, "mDNS daemon shutdown failed");
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn raw_entry(info: &ServiceInfo, service_type: &str) -> RawServiceEntry {
    let fullname = info.get_fullname();
    let instance = fullname
        .strip_suffix(service_type)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(fullname)
        .to_string();

    let mut ipv4 = Vec::new();
    let mut ipv6 = Vec::new();
    for addr in info.get_addresses() {
        match addr {
            IpAddr::V4(v4) => ipv4.push(*v4),
            IpAddr::V6(v6) => ipv6.push(*v6),
        }
    }
    // The daemon hands addresses over as a set.
    ipv4.sort_unstable();
    ipv6.sort_unstable();

    let txt = info
        .get_properties()
        .iter()
        .map(|prop| format!("{}={}", prop.key(), prop.val_str()))
        .collect();

    RawServiceEntry {
        instance,
        hostname: info.get_hostname().to_string(),
        port: info.get_port(),
        ipv4,
        ipv6,
        txt,
    }
}
