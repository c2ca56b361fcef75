//! NAT Traversal Strategies
//!
//! Each strategy prepares the local ports a provider advertises during the
//! config exchange. Strategies run in the configured order and the first
//! one that succeeds decides how the connection is started:
//! - `manual`: the operator forwarded ports, dial directly
//! - `upnp`: the gateway forwards mapped ports, dial directly
//! - `holepunching`: many ports, opened by the pinger

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::port::{acquire_local_ports, PortSupplier};
use crate::reachability::globally_reachable;
use crate::upnp::{MappingRelease, PortMapper};

/// Sockets every connection needs: the channel and the carried service
pub const REQUIRED_CONN_COUNT: usize = 2;

/// Ports punched in parallel by the pinger
pub const PING_MAX_PORTS: usize = 20;

/// Description attached to gateway mappings
const MAPPING_DESCRIPTION: &str = "dVPN p2p";

/// A traversal strategy name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraversalMethod {
    Manual,
    Upnp,
    #[serde(rename = "holepunching")]
    HolePunching,
}

impl TraversalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraversalMethod::Manual => "manual",
            TraversalMethod::Upnp => "upnp",
            TraversalMethod::HolePunching => "holepunching",
        }
    }

    /// `manual, upnp, holepunching`
    pub fn default_order() -> Vec<TraversalMethod> {
        vec![
            TraversalMethod::Manual,
            TraversalMethod::Upnp,
            TraversalMethod::HolePunching,
        ]
    }
}

impl std::fmt::Display for TraversalMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraversalMethod {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(TraversalMethod::Manual),
            "upnp" => Ok(TraversalMethod::Upnp),
            "holepunching" => Ok(TraversalMethod::HolePunching),
            other => Err(NetworkError::ConfigError(format!(
                "unknown traversal method {:?}",
                other
            ))),
        }
    }
}

/// How the prepared ports become connected sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPorts {
    /// Bind and connect straight to the peer
    Direct,
    /// Run the hole punching pinger first
    Ping,
}

/// Releases the gateway mappings behind a set of prepared ports.
///
/// Cheap to clone; releasing twice is a no-op.
#[derive(Debug, Clone, Default)]
pub struct PortsRelease {
    mappings: Vec<MappingRelease>,
}

impl PortsRelease {
    pub fn new(mappings: Vec<MappingRelease>) -> Self {
        Self { mappings }
    }

    pub fn release(&self) {
        for mapping in &self.mappings {
            if !mapping.is_released() {
                debug!("Releasing mapped port {}", mapping.port());
            }
            mapping.release();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Result of a successful strategy
#[derive(Debug, Clone)]
pub struct PreparedPorts {
    pub ports: Vec<u16>,
    pub release: PortsRelease,
    pub start: StartPorts,
}

impl PreparedPorts {
    pub fn direct(ports: Vec<u16>) -> Self {
        Self {
            ports,
            release: PortsRelease::default(),
            start: StartPorts::Direct,
        }
    }
}

/// One traversal strategy
#[async_trait]
pub trait PortPreparer: Send + Sync {
    fn method(&self) -> TraversalMethod;

    /// Prepare ports, or fail so the next strategy can run
    async fn prepare_ports(&self) -> NetworkResult<PreparedPorts>;
}

/// The operator forwarded ports by hand
pub struct ManualPreparer {
    ports: Arc<dyn PortSupplier>,
    enabled: bool,
}

impl ManualPreparer {
    pub fn new(ports: Arc<dyn PortSupplier>, enabled: bool) -> Self {
        Self { ports, enabled }
    }
}

#[async_trait]
impl PortPreparer for ManualPreparer {
    fn method(&self) -> TraversalMethod {
        TraversalMethod::Manual
    }

    async fn prepare_ports(&self) -> NetworkResult<PreparedPorts> {
        if !self.enabled {
            return Err(NetworkError::TraversalUnavailable(self.method().to_string()));
        }
        let ports = acquire_local_ports(self.ports.as_ref(), REQUIRED_CONN_COUNT)?;
        Ok(PreparedPorts::direct(ports))
    }
}

/// Ask the gateway to forward the ports
pub struct UpnpPreparer {
    ports: Arc<dyn PortSupplier>,
    mapper: Arc<dyn PortMapper>,
    echo_servers: Vec<String>,
    probe_timeout: Duration,
}

impl UpnpPreparer {
    pub fn new(ports: Arc<dyn PortSupplier>, mapper: Arc<dyn PortMapper>) -> Self {
        Self {
            ports,
            mapper,
            echo_servers: Vec::new(),
            probe_timeout: Duration::from_secs(2),
        }
    }

    /// Verify mappings through echo servers before trusting them
    pub fn with_echo_servers(mut self, servers: Vec<String>, timeout: Duration) -> Self {
        self.echo_servers = servers;
        self.probe_timeout = timeout;
        self
    }
}

#[async_trait]
impl PortPreparer for UpnpPreparer {
    fn method(&self) -> TraversalMethod {
        TraversalMethod::Upnp
    }

    async fn prepare_ports(&self) -> NetworkResult<PreparedPorts> {
        let ports = acquire_local_ports(self.ports.as_ref(), REQUIRED_CONN_COUNT)?;

        let mut mappings = Vec::with_capacity(ports.len());
        for &port in &ports {
            match self.mapper.map_udp(port, MAPPING_DESCRIPTION).await {
                Ok(mapping) => mappings.push(mapping),
                Err(e) => {
                    PortsRelease::new(mappings).release();
                    return Err(e);
                }
            }
        }
        let release = PortsRelease::new(mappings);

        if !self.echo_servers.is_empty() {
            let reachable =
                globally_reachable(ports[0], &self.echo_servers, self.probe_timeout).await;
            match reachable {
                Ok(true) => debug!("Mapped port {} is globally reachable", ports[0]),
                Ok(false) => {
                    release.release();
                    return Err(NetworkError::PortMappingFailed(format!(
                        "mapped port {} is not globally reachable",
                        ports[0]
                    )));
                }
                Err(e) => {
                    release.release();
                    return Err(e);
                }
            }
        }

        Ok(PreparedPorts {
            ports,
            release,
            start: StartPorts::Direct,
        })
    }
}

/// Punch holes with the pinger
pub struct HolePunchingPreparer {
    ports: Arc<dyn PortSupplier>,
    available: bool,
}

impl HolePunchingPreparer {
    /// `available` is false when the node runs a no-op pinger
    pub fn new(ports: Arc<dyn PortSupplier>, available: bool) -> Self {
        Self { ports, available }
    }
}

#[async_trait]
impl PortPreparer for HolePunchingPreparer {
    fn method(&self) -> TraversalMethod {
        TraversalMethod::HolePunching
    }

    async fn prepare_ports(&self) -> NetworkResult<PreparedPorts> {
        if !self.available {
            return Err(NetworkError::TraversalUnavailable(self.method().to_string()));
        }
        let ports = acquire_local_ports(self.ports.as_ref(), PING_MAX_PORTS)?;
        Ok(PreparedPorts {
            ports,
            release: PortsRelease::default(),
            start: StartPorts::Ping,
        })
    }
}

/// Run `preparers` in order and return the first success
pub async fn prepare_ports(preparers: &[Arc<dyn PortPreparer>]) -> NetworkResult<PreparedPorts> {
    let mut last_err = None;
    for preparer in preparers {
        match preparer.prepare_ports().await {
            Ok(prepared) => {
                info!(
                    "Prepared {} ports with {} traversal",
                    prepared.ports.len(),
                    preparer.method()
                );
                return Ok(prepared);
            }
            // Resource errors propagate immediately
            Err(e @ NetworkError::PortPoolExhausted) => return Err(e),
            Err(e) => {
                match &e {
                    NetworkError::TraversalUnavailable(_) => {
                        debug!("{} traversal not available", preparer.method())
                    }
                    _ => warn!("{} traversal failed: {}", preparer.method(), e),
                }
                last_err = Some(e);
            }
        }
    }
    Err(NetworkError::AllStrategiesFailed(
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no traversal strategy configured".into()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::FixedRangePool;
    use crate::upnp::NoopPortMapper;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool() -> Arc<dyn PortSupplier> {
        Arc::new(FixedRangePool::new(45000, 45999).unwrap())
    }

    /// Maps the first `ok` ports, then fails; counts releases
    struct FlakyMapper {
        ok: usize,
        mapped: AtomicUsize,
        released: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PortMapper for FlakyMapper {
        async fn map_udp(&self, port: u16, _description: &str) -> NetworkResult<MappingRelease> {
            if self.mapped.fetch_add(1, Ordering::SeqCst) >= self.ok {
                return Err(NetworkError::PortMappingFailed("refused".into()));
            }
            let released = self.released.clone();
            Ok(MappingRelease::new(port, move || {
                released.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("UPnP".parse::<TraversalMethod>().unwrap(), TraversalMethod::Upnp);
        assert_eq!(
            "holepunching".parse::<TraversalMethod>().unwrap(),
            TraversalMethod::HolePunching
        );
        assert!("stun".parse::<TraversalMethod>().is_err());
        assert_eq!(TraversalMethod::HolePunching.to_string(), "holepunching");
    }

    #[tokio::test]
    async fn test_manual_disabled_falls_through() {
        let preparers: Vec<Arc<dyn PortPreparer>> = vec![
            Arc::new(ManualPreparer::new(pool(), false)),
            Arc::new(UpnpPreparer::new(pool(), Arc::new(NoopPortMapper))),
            Arc::new(HolePunchingPreparer::new(pool(), true)),
        ];
        let prepared = prepare_ports(&preparers).await.unwrap();
        assert_eq!(prepared.start, StartPorts::Ping);
        assert_eq!(prepared.ports.len(), PING_MAX_PORTS);
        assert!(prepared.release.is_empty());
    }

    #[tokio::test]
    async fn test_manual_enabled() {
        let preparers: Vec<Arc<dyn PortPreparer>> = vec![Arc::new(ManualPreparer::new(pool(), true))];
        let prepared = prepare_ports(&preparers).await.unwrap();
        assert_eq!(prepared.start, StartPorts::Direct);
        assert_eq!(prepared.ports.len(), REQUIRED_CONN_COUNT);
    }

    #[tokio::test]
    async fn test_upnp_partial_failure_rolls_back() {
        let released = Arc::new(AtomicUsize::new(0));
        let mapper = Arc::new(FlakyMapper {
            ok: 1,
            mapped: AtomicUsize::new(0),
            released: released.clone(),
        });
        let upnp = UpnpPreparer::new(pool(), mapper);
        assert!(upnp.prepare_ports().await.is_err());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upnp_success_release_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let mapper = Arc::new(FlakyMapper {
            ok: 2,
            mapped: AtomicUsize::new(0),
            released: released.clone(),
        });
        let prepared = UpnpPreparer::new(pool(), mapper).prepare_ports().await.unwrap();
        assert_eq!(prepared.start, StartPorts::Direct);

        let copy = prepared.release.clone();
        prepared.release.release();
        copy.release();
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_all_strategies_fail() {
        let preparers: Vec<Arc<dyn PortPreparer>> = vec![
            Arc::new(ManualPreparer::new(pool(), false)),
            Arc::new(HolePunchingPreparer::new(pool(), false)),
        ];
        let result = prepare_ports(&preparers).await;
        assert!(matches!(result, Err(NetworkError::AllStrategiesFailed(_))));
        assert!(matches!(
            prepare_ports(&[]).await,
            Err(NetworkError::AllStrategiesFailed(_))
        ));
    }
}
