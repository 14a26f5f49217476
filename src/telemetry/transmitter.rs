//! UDP fan-out of encoded telemetry records.
//!
//! Every record goes to every host in the [`HostRoster`] as a single
//! datagram. Hosts are independent: a host that fails to resolve or send
//! is recorded in the [`TransmitReport`] and the loop moves on.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::telemetry::config::TelemetryConfig;

/// Collector hosts plus the shared destination port.
///
/// The fixed hosts never change. The last entry is a single override slot
/// that can be replaced at any time; readers see either the old or the new
/// host, never a partial one.
#[derive(Debug)]
pub struct HostRoster {
    defaults: Vec<Arc<str>>,
    override_slot: RwLock<Arc<str>>,
    slot_default: Arc<str>,
    port: u16,
}

impl HostRoster {
    /// Create a roster from fixed hosts and the override slot's default.
    pub fn new<I, S>(defaults: I, slot_default: impl Into<String>, port: u16) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let slot_default: Arc<str> = Arc::from(slot_default.into());
        Self {
            defaults: defaults.into_iter().map(|h| Arc::from(h.as_ref())).collect(),
            override_slot: RwLock::new(slot_default.clone()),
            slot_default,
            port,
        }
    }

    /// Build the roster described by a configuration.
    pub fn from_config(config: &TelemetryConfig) -> Self {
        let roster = Self::new(
            &config.default_hosts,
            config.override_slot_default.clone(),
            config.port,
        );
        if let Some(host) = &config.host_override {
            roster.set_override_host(host);
        }
        roster
    }

    /// Replace the override slot. A blank host restores the slot default.
    pub fn set_override_host(&self, host: &str) {
        let host = host.trim();
        let next = if host.is_empty() {
            self.slot_default.clone()
        } else {
            Arc::from(host)
        };
        debug!("Override host set to {}", next);
        *self.override_slot.write() = next;
    }

    /// The host currently in the override slot.
    pub fn override_host(&self) -> Arc<str> {
        self.override_slot.read().clone()
    }

    /// Snapshot of every destination host, fixed hosts first.
    pub fn hosts(&self) -> Vec<Arc<str>> {
        let mut hosts = self.defaults.clone();
        hosts.push(self.override_host());
        hosts
    }

    /// Destination port shared by every host.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Resolves a host name or IP literal to a socket address.
#[async_trait]
pub trait HostResolver: Send + Sync + 'static {
    /// Resolve `host` to an address on `port`.
    async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr>;
}

/// Resolver backed by the system's name service.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl HostResolver for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses found"))
    }
}

/// Why a single host did not receive a record.
#[derive(Error, Debug)]
pub enum SendFailure {
    /// The host name could not be resolved.
    #[error("Failed to resolve host {host}: {source}")]
    HostResolutionFailed {
        host: String,
        #[source]
        source: io::Error,
    },

    /// The datagram could not be sent.
    #[error("Failed to send to {host}: {source}")]
    SendFailed {
        host: String,
        #[source]
        source: io::Error,
    },
}

impl SendFailure {
    /// The host the failure applies to.
    pub fn host(&self) -> &str {
        match self {
            Self::HostResolutionFailed { host, .. } | Self::SendFailed { host, .. } => host,
        }
    }
}

/// Outcome of sending one record to every host.
#[derive(Debug, Default)]
pub struct TransmitReport {
    /// Hosts the datagram was handed to.
    pub delivered: Vec<String>,
    /// Hosts that failed, in roster order.
    pub failures: Vec<SendFailure>,
}

impl TransmitReport {
    /// Check if every host received the record.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Sends encoded records to every host in a roster.
pub struct TelemetryTransmitter<R: HostResolver = DnsResolver> {
    roster: Arc<HostRoster>,
    resolver: R,
}

impl TelemetryTransmitter<DnsResolver> {
    /// Create a transmitter that resolves hosts through DNS.
    pub fn new(roster: Arc<HostRoster>) -> Self {
        Self::with_resolver(roster, DnsResolver)
    }
}

impl<R: HostResolver> TelemetryTransmitter<R> {
    /// Create a transmitter with a custom host resolver.
    pub fn with_resolver(roster: Arc<HostRoster>, resolver: R) -> Self {
        Self { roster, resolver }
    }

    /// Get the host roster.
    pub fn roster(&self) -> &Arc<HostRoster> {
        &self.roster
    }

    /// Send one record to every host.
    ///
    /// Per-host failures are collected in the report.
    ///
    /// # Errors
    ///
    /// Returns an error only if no local socket could be bound.
    pub async fn send(&self, record: &[u8]) -> Result<TransmitReport> {
        let v4 = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let mut v6: Option<UdpSocket> = None;
        let port = self.roster.port();
        let mut report = TransmitReport::default();

        for host in self.roster.hosts() {
            let host = host.to_string();

            let target = match self.resolver.resolve(&host, port).await {
                Ok(target) => target,
                Err(source) => {
                    warn!("Failed to resolve {}: {}", host, source);
                    report
                        .failures
                        .push(SendFailure::HostResolutionFailed { host, source });
                    continue;
                }
            };

            let socket = if target.is_ipv4() {
                &v4
            } else {
                let bound = match v6.take() {
                    Some(socket) => Ok(socket),
                    None => UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).await,
                };
                match bound {
                    Ok(socket) => &*v6.insert(socket),
                    Err(source) => {
                        warn!("Failed to bind IPv6 socket for {}: {}", host, source);
                        report.failures.push(SendFailure::SendFailed { host, source });
                        continue;
                    }
                }
            };

            match socket.send_to(record, target).await {
                Ok(sent) => {
                    trace!("Sent {} bytes to {} ({})", sent, host, target);
                    report.delivered.push(host);
                }
                Err(source) => {
                    warn!("Failed to send to {}: {}", host, source);
                    report.failures.push(SendFailure::SendFailed { host, source });
                }
            }
        }

        debug!(
            "Telemetry sent to {} host(s), {} failure(s)",
            report.delivered.len(),
            report.failures.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Resolves names from a fixed table.
    struct TableResolver(HashMap<String, SocketAddr>);

    #[async_trait]
    impl HostResolver for TableResolver {
        async fn resolve(&self, host: &str, _port: u16) -> io::Result<SocketAddr> {
            self.0
                .get(host)
                .copied()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, host.to_string()))
        }
    }

    async fn receive(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf[..len].to_vec()
    }

    #[test]
    fn test_roster_from_config() {
        let roster = HostRoster::from_config(&TelemetryConfig::default());
        let hosts = roster.hosts();

        assert_eq!(hosts.len(), 5);
        assert_eq!(&*hosts[0], "34.221.26.86");
        assert_eq!(&*hosts[4], "10.121.64.123");
        assert_eq!(roster.port(), 50000);
    }

    #[test]
    fn test_roster_override() {
        let config = TelemetryConfig::default().with_host_override("192.168.0.7");
        let roster = HostRoster::from_config(&config);
        assert_eq!(&*roster.override_host(), "192.168.0.7");

        roster.set_override_host("  collector.local ");
        assert_eq!(&*roster.override_host(), "collector.local");

        roster.set_override_host("   ");
        assert_eq!(&*roster.override_host(), "10.121.64.123");
        assert_eq!(roster.hosts().len(), 5);
    }

    #[test]
    fn test_roster_override_never_torn() {
        let roster = Arc::new(HostRoster::new(["a"], "slot-default", 1));
        let first = "first.example.com";
        let second = "a-much-longer-second-host.example.org";

        let writer = {
            let roster = roster.clone();
            std::thread::spawn(move || {
                for i in 0..1000 {
                    roster.set_override_host(if i % 2 == 0 { first } else { second });
                }
            })
        };

        for _ in 0..1000 {
            let seen = roster.override_host();
            assert!(
                &*seen == first || &*seen == second || &*seen == "slot-default",
                "torn read: {}",
                seen
            );
        }
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn test_send_continues_past_failed_host() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let table = HashMap::from([
            ("alpha".to_string(), a.local_addr().unwrap()),
            ("gamma".to_string(), b.local_addr().unwrap()),
        ]);
        let roster = Arc::new(HostRoster::new(["alpha", "beta"], "gamma", 50000));
        let transmitter = TelemetryTransmitter::with_resolver(roster, TableResolver(table));

        let report = transmitter.send(&[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();

        assert_eq!(report.delivered, vec!["alpha".to_string(), "gamma".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.is_complete());
        assert_eq!(report.failures[0].host(), "beta");
        assert!(matches!(
            report.failures[0],
            SendFailure::HostResolutionFailed { .. }
        ));

        assert_eq!(receive(&a).await, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(receive(&b).await, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[tokio::test]
    async fn test_send_continues_past_rejected_datagram() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let c = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // The OS refuses datagrams addressed to port 0.
        let table = HashMap::from([
            ("alpha".to_string(), a.local_addr().unwrap()),
            ("beta".to_string(), "127.0.0.1:0".parse().unwrap()),
            ("gamma".to_string(), c.local_addr().unwrap()),
        ]);
        let roster = Arc::new(HostRoster::new(["alpha", "beta"], "gamma", 50000));
        let transmitter = TelemetryTransmitter::with_resolver(roster, TableResolver(table));

        let report = transmitter.send(&[0x01, 0x02, 0x03]).await.unwrap();

        assert_eq!(report.delivered, vec!["alpha".to_string(), "gamma".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].host(), "beta");
        assert!(matches!(report.failures[0], SendFailure::SendFailed { .. }));

        assert_eq!(receive(&a).await, vec![0x01, 0x02, 0x03]);
        assert_eq!(receive(&c).await, vec![0x01, 0x02, 0x03]);
    }

    #[tokio::test]
    async fn test_dns_resolver_ip_literal() {
        let addr = DnsResolver.resolve("127.0.0.1", 50000).await.unwrap();
        assert_eq!(addr, "127.0.0.1:50000".parse().unwrap());
    }

    #[test]
    fn test_send_failure_display() {
        let failure = SendFailure::HostResolutionFailed {
            host: "beta".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such host"),
        };
        assert_eq!(failure.to_string(), "Failed to resolve host beta: no such host");
    }
}
