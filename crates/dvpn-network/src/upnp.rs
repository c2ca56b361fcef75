//! UPnP Port Mapping
//!
//! Asks the local IGD gateway to forward an external UDP port to a local
//! one. Mappings are process-wide gateway state, so every successful
//! mapping hands back a [`MappingRelease`] that removes it exactly once.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use igd_next::{PortMappingProtocol, SearchOptions};
use tracing::{debug, info, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::ip;

/// Lease requested for each mapping, in seconds
pub const UPNP_LEASE_DURATION: u32 = 3600;

/// How long gateway discovery may take
pub const GATEWAY_SEARCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Removes one gateway mapping. Safe to call any number of times.
#[derive(Clone)]
pub struct MappingRelease {
    port: u16,
    released: Arc<AtomicBool>,
    remove: Arc<dyn Fn() + Send + Sync>,
}

impl MappingRelease {
    pub fn new(port: u16, remove: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            port,
            released: Arc::new(AtomicBool::new(false)),
            remove: Arc::new(remove),
        }
    }

    /// External port this release removes
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        (self.remove)();
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MappingRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingRelease")
            .field("port", &self.port)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Creates gateway port mappings
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// Map external UDP `port` to the same local port
    async fn map_udp(&self, port: u16, description: &str) -> NetworkResult<MappingRelease>;
}

/// Mapper for nodes without a gateway; every mapping fails
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPortMapper;

#[async_trait]
impl PortMapper for NoopPortMapper {
    async fn map_udp(&self, port: u16, _description: &str) -> NetworkResult<MappingRelease> {
        Err(NetworkError::PortMappingFailed(format!(
            "port mapping disabled, cannot map {}",
            port
        )))
    }
}

/// Mapper talking to an IGD gateway through `igd-next`
#[derive(Debug, Clone)]
pub struct IgdPortMapper {
    search_timeout: Duration,
    lease: u32,
}

impl Default for IgdPortMapper {
    fn default() -> Self {
        Self {
            search_timeout: GATEWAY_SEARCH_TIMEOUT,
            lease: UPNP_LEASE_DURATION,
        }
    }
}

impl IgdPortMapper {
    pub fn new(search_timeout: Duration, lease: u32) -> Self {
        Self {
            search_timeout,
            lease,
        }
    }

    /// Whether a gateway answers discovery at all
    pub async fn is_available(&self) -> bool {
        let options = search_options(self.search_timeout);
        tokio::task::spawn_blocking(move || igd_next::search_gateway(options).is_ok())
            .await
            .unwrap_or(false)
    }
}

fn search_options(timeout: Duration) -> SearchOptions {
    SearchOptions {
        timeout: Some(timeout),
        ..Default::default()
    }
}

#[async_trait]
impl PortMapper for IgdPortMapper {
    async fn map_udp(&self, port: u16, description: &str) -> NetworkResult<MappingRelease> {
        let local_ip = ip::outbound_ip().await?;
        if !matches!(local_ip, IpAddr::V4(_)) {
            return Err(NetworkError::PortMappingFailed(
                "UPnP mapping needs an IPv4 outbound address".into(),
            ));
        }
        let local_addr = SocketAddr::new(local_ip, port);
        let timeout = self.search_timeout;
        let lease = self.lease;
        let description = description.to_string();

        let external_ip = tokio::task::spawn_blocking(move || {
            let gateway = igd_next::search_gateway(search_options(timeout))
                .map_err(|e| NetworkError::PortMappingFailed(format!("no UPnP gateway: {}", e)))?;
            gateway
                .add_port(PortMappingProtocol::UDP, port, local_addr, lease, &description)
                .map_err(|e| {
                    NetworkError::PortMappingFailed(format!("failed to map port {}: {}", port, e))
                })?;
            Ok::<_, NetworkError>(gateway.get_external_ip().ok())
        })
        .await
        .map_err(|e| NetworkError::PortMappingFailed(e.to_string()))??;

        match external_ip {
            Some(ext) => info!("UPnP mapped {}:{} -> {}", ext, port, local_addr),
            None => info!("UPnP mapped port {} -> {}", port, local_addr),
        }

        Ok(MappingRelease::new(port, move || remove_mapping(port, timeout)))
    }
}

/// Remove a mapping without blocking the async runtime
fn remove_mapping(port: u16, timeout: Duration) {
    let remove = move || match igd_next::search_gateway(search_options(timeout)) {
        Ok(gateway) => match gateway.remove_port(PortMappingProtocol::UDP, port) {
            Ok(()) => debug!("Removed UPnP mapping for port {}", port),
            Err(e) => warn!("Failed to remove UPnP mapping for port {}: {}", port, e),
        },
        Err(e) => warn!("No gateway to remove UPnP mapping for port {}: {}", port, e),
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(remove);
        }
        Err(_) => remove(),
    }
}
