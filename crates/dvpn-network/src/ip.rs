//! IP Resolution
//!
//! A node needs two addresses during the config exchange: the public IP it
//! advertises to the peer and the outbound IP of its default route. When the
//! two are equal the node is not behind NAT and no traversal is needed.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{NetworkError, NetworkResult};

/// Default service answering with the caller's public IP as plain text
pub const DEFAULT_IP_ECHO_URL: &str = "https://api.ipify.org";

/// Address used only to select the outbound route, nothing is sent to it
const ROUTE_PROBE_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);

/// Resolves the addresses a node advertises
#[async_trait]
pub trait IpResolver: Send + Sync {
    /// IP the rest of the internet sees
    async fn public_ip(&self) -> NetworkResult<IpAddr>;

    /// Local IP of the default route
    async fn outbound_ip(&self) -> NetworkResult<IpAddr>;
}

/// Fixed answers, for tests and for operators with a known address
#[derive(Debug, Clone, Copy)]
pub struct StaticResolver {
    public: IpAddr,
    outbound: IpAddr,
}

impl StaticResolver {
    pub fn new(public: IpAddr, outbound: IpAddr) -> Self {
        Self { public, outbound }
    }
}

#[async_trait]
impl IpResolver for StaticResolver {
    async fn public_ip(&self) -> NetworkResult<IpAddr> {
        Ok(self.public)
    }

    async fn outbound_ip(&self) -> NetworkResult<IpAddr> {
        Ok(self.outbound)
    }
}

/// Asks an HTTP echo service for the public IP
pub struct HttpResolver {
    client: reqwest::Client,
    url: String,
}

impl HttpResolver {
    pub fn new(url: impl Into<String>, timeout: Duration) -> NetworkResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl IpResolver for HttpResolver {
    async fn public_ip(&self) -> NetworkResult<IpAddr> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let ip = parse_ip(&body)?;
        debug!("Resolved public IP {} via {}", ip, self.url);
        Ok(ip)
    }

    async fn outbound_ip(&self) -> NetworkResult<IpAddr> {
        outbound_ip().await
    }
}

/// Local address the kernel picks for the default route
pub async fn outbound_ip() -> NetworkResult<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(ROUTE_PROBE_ADDR).await?;
    Ok(socket.local_addr()?.ip())
}

fn parse_ip(body: &str) -> NetworkResult<IpAddr> {
    body.trim()
        .parse()
        .map_err(|_| NetworkError::ResolveFailed(format!("unexpected IP echo body {:?}", body.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticResolver::new(
            "127.0.0.1".parse().unwrap(),
            "1.1.1.1".parse().unwrap(),
        );
        assert_eq!(resolver.public_ip().await.unwrap().to_string(), "127.0.0.1");
        assert_eq!(resolver.outbound_ip().await.unwrap().to_string(), "1.1.1.1");
    }

    #[test]
    fn test_parse_ip() {
        assert_eq!(parse_ip("93.184.216.34\n").unwrap().to_string(), "93.184.216.34");
        assert!(parse_ip("<html>").is_err());
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_http_resolver() {
        let resolver = HttpResolver::new(DEFAULT_IP_ECHO_URL, Duration::from_secs(5)).unwrap();
        let ip = resolver.public_ip().await.unwrap();
        assert!(!ip.is_loopback());
    }
}
