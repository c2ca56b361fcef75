//! Port Pools
//!
//! Pools hand out port *numbers*, never sockets. A port returned by
//! `acquire` was free when probed but nothing holds it afterwards, so
//! callers must still handle a failed bind.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{NetworkError, NetworkResult};

/// Default first port of the random pool
pub const DEFAULT_POOL_START: u16 = 40000;

/// Default size of the random pool
pub const DEFAULT_POOL_CAPACITY: u16 = 10000;

/// A port number handed out by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Port(u16);

impl Port {
    pub fn new(num: u16) -> Self {
        Self(num)
    }

    pub fn num(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supplies ports for p2p and service sockets
pub trait PortSupplier: Send + Sync {
    /// Acquire one port
    fn acquire(&self) -> NetworkResult<Port>;

    /// Acquire `n` distinct ports
    fn acquire_multiple(&self, n: usize) -> NetworkResult<Vec<Port>> {
        let mut seen = HashSet::with_capacity(n);
        let mut ports = Vec::with_capacity(n);
        // Random draws may repeat; give each slot a few tries before giving up.
        let mut budget = n.saturating_mul(8).max(8);
        while ports.len() < n {
            if budget == 0 {
                return Err(NetworkError::PortPoolExhausted);
            }
            budget -= 1;
            let port = self.acquire()?;
            if seen.insert(port) {
                ports.push(port);
            }
        }
        Ok(ports)
    }
}

/// Ports as plain numbers, in acquisition order
pub fn acquire_local_ports(supplier: &dyn PortSupplier, n: usize) -> NetworkResult<Vec<u16>> {
    Ok(supplier
        .acquire_multiple(n)?
        .into_iter()
        .map(|p| p.num())
        .collect())
}

/// Random draw from `[start, start + capacity)`
#[derive(Debug)]
pub struct Pool {
    start: u16,
    capacity: u16,
    rng: Mutex<rand::rngs::StdRng>,
}

impl Pool {
    pub fn new(start: u16, capacity: u16) -> NetworkResult<Self> {
        if capacity == 0 {
            return Err(NetworkError::ConfigError("port pool capacity must be > 0".into()));
        }
        if start.checked_add(capacity - 1).is_none() {
            return Err(NetworkError::ConfigError(format!(
                "port pool {}+{} exceeds 65535",
                start, capacity
            )));
        }
        Ok(Self {
            start,
            capacity,
            rng: Mutex::new(rand::SeedableRng::from_entropy()),
        })
    }

    pub fn range(&self) -> std::ops::Range<u32> {
        self.start as u32..self.start as u32 + self.capacity as u32
    }

    fn random_offset(&self) -> u16 {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0..self.capacity),
            Err(poisoned) => poisoned.into_inner().gen_range(0..self.capacity),
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            start: DEFAULT_POOL_START,
            capacity: DEFAULT_POOL_CAPACITY,
            rng: Mutex::new(rand::SeedableRng::from_entropy()),
        }
    }
}

impl PortSupplier for Pool {
    fn acquire(&self) -> NetworkResult<Port> {
        let offset = self.random_offset();
        seek_available(self.start, self.capacity, offset)
    }
}

/// Always the same, operator-chosen port
#[derive(Debug, Clone, Copy)]
pub struct PoolFixed {
    port: Port,
}

impl PoolFixed {
    pub fn new(port: u16) -> Self {
        Self { port: Port(port) }
    }
}

impl PortSupplier for PoolFixed {
    fn acquire(&self) -> NetworkResult<Port> {
        Ok(self.port)
    }

    fn acquire_multiple(&self, n: usize) -> NetworkResult<Vec<Port>> {
        match n {
            0 => Ok(Vec::new()),
            1 => Ok(vec![self.port]),
            _ => Err(NetworkError::ConfigError(format!(
                "fixed port pool supplies a single port, {} requested",
                n
            ))),
        }
    }
}

/// Random draw from an explicit inclusive `[start, end]` range
#[derive(Debug)]
pub struct FixedRangePool {
    inner: Pool,
}

impl FixedRangePool {
    pub fn new(start: u16, end: u16) -> NetworkResult<Self> {
        if end < start {
            return Err(NetworkError::ConfigError(format!(
                "invalid port range {}:{}",
                start, end
            )));
        }
        let capacity = u32::from(end) - u32::from(start) + 1;
        let inner = match u16::try_from(capacity) {
            Ok(capacity) => Pool::new(start, capacity)?,
            // Only 0:65535 is wider than a u16; port 0 is never handed out.
            Err(_) => Pool::new(1, u16::MAX)?,
        };
        Ok(Self { inner })
    }

    /// Parse the `start:end` form used in config files
    pub fn parse(range: &str) -> NetworkResult<Self> {
        let (start, end) = range
            .split_once(':')
            .ok_or_else(|| NetworkError::ConfigError(format!("invalid port range {:?}", range)))?;
        let parse = |s: &str| {
            s.trim()
                .parse::<u16>()
                .map_err(|e| NetworkError::ConfigError(format!("invalid port {:?}: {}", s, e)))
        };
        Self::new(parse(start)?, parse(end)?)
    }

    pub fn start(&self) -> u16 {
        self.inner.start
    }

    pub fn end(&self) -> u16 {
        self.inner.start + (self.inner.capacity - 1)
    }
}

impl PortSupplier for FixedRangePool {
    fn acquire(&self) -> NetworkResult<Port> {
        self.inner.acquire()
    }
}

/// Walk the range from a random offset and return the first port that binds.
fn seek_available(start: u16, capacity: u16, offset: u16) -> NetworkResult<Port> {
    for i in 0..capacity as u32 {
        let port = start as u32 + (offset as u32 + i) % capacity as u32;
        let port = port as u16;
        if is_udp_port_free(port) {
            trace!("Acquired port {}", port);
            return Ok(Port(port));
        }
    }
    debug!("No free port in {}..{}", start, start as u32 + capacity as u32);
    Err(NetworkError::PortPoolExhausted)
}

fn is_udp_port_free(port: u16) -> bool {
    UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_bounds() {
        let pool = Pool::new(41000, 50).unwrap();
        for _ in 0..200 {
            let port = pool.acquire().unwrap().num() as u32;
            assert!(pool.range().contains(&port), "port {} out of range", port);
        }
    }

    #[test]
    fn test_fixed_range_pool_bounds() {
        let pool = FixedRangePool::new(42000, 42010).unwrap();
        for _ in 0..200 {
            let port = pool.acquire().unwrap().num();
            assert!((42000..=42010).contains(&port), "port {} out of range", port);
        }
    }

    #[test]
    fn test_fixed_range_single_port() {
        let pool = FixedRangePool::parse("43210:43210").unwrap();
        assert_eq!(pool.acquire().unwrap().num(), 43210);
        assert_eq!((pool.start(), pool.end()), (43210, 43210));
    }

    #[test]
    fn test_pool_fixed_always_same() {
        let pool = PoolFixed::new(51820);
        for _ in 0..10 {
            assert_eq!(pool.acquire().unwrap(), Port::new(51820));
        }
        assert!(pool.acquire_multiple(2).is_err());
    }

    #[test]
    fn test_acquire_multiple_distinct() {
        let pool = FixedRangePool::new(44000, 44063).unwrap();
        let ports = pool.acquire_multiple(20).unwrap();
        let unique: HashSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), 20);
    }

    #[test]
    fn test_invalid_ranges() {
        assert!(FixedRangePool::new(5000, 4000).is_err());
        assert!(FixedRangePool::parse("abc").is_err());
        assert!(Pool::new(65000, 1000).is_err());
        assert!(Pool::new(1000, 0).is_err());
    }

    #[test]
    fn test_full_range_clamps_to_nonzero_ports() {
        let pool = FixedRangePool::parse("0:65535").unwrap();
        assert_eq!((pool.start(), pool.end()), (1, 65535));
        assert_ne!(pool.acquire().unwrap().num(), 0);

        let pool = FixedRangePool::new(1, 65535).unwrap();
        assert_eq!((pool.start(), pool.end()), (1, 65535));
    }

    #[test]
    fn test_exhausted_range() {
        let held = UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let pool = FixedRangePool::new(port, port).unwrap();
        assert!(matches!(pool.acquire(), Err(NetworkError::PortPoolExhausted)));
    }
}
