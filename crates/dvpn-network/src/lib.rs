//! dVPN Network Layer
//!
//! Provides the network primitives p2p channels are built from:
//! - Port pools handing out advisory port numbers
//! - IP resolution and UDP socket helpers
//! - NAT traversal: manual forwarding, UPnP mapping, hole punching
//! - STUN port classification and global reachability probes
//! - A proxy handing punched sockets off to local services

pub mod error;
pub mod port;
pub mod ip;
pub mod transport;
pub mod stun;
pub mod reachability;
pub mod upnp;
pub mod pinger;
pub mod nat_proxy;
pub mod traversal;

pub use error::{NetworkError, NetworkResult};
pub use port::{acquire_local_ports, FixedRangePool, Pool, PoolFixed, Port, PortSupplier};
pub use ip::{HttpResolver, IpResolver, StaticResolver};
pub use transport::{bind_udp, dial_pairs, dial_udp, UdpSocketBuilder};
pub use stun::{multi_server_stun, stun_ports, NatSymmetry, PortProbe, StunClient};
pub use reachability::globally_reachable;
pub use upnp::{IgdPortMapper, MappingRelease, NoopPortMapper, PortMapper};
pub use pinger::{NatPinger, NoopPinger, PingConfig, Pinger};
pub use nat_proxy::NatProxy;
pub use traversal::{
    prepare_ports, HolePunchingPreparer, ManualPreparer, PortPreparer, PortsRelease,
    PreparedPorts, StartPorts, TraversalMethod, UpnpPreparer, PING_MAX_PORTS,
    REQUIRED_CONN_COUNT,
};
