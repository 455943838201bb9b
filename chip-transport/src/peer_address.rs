//! Peer addressing across transports.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// The transport an address belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// No transport selected yet.
    #[default]
    Undefined,
    /// Datagram over UDP.
    Udp,
    /// Stream over TCP.
    Tcp,
    /// Bluetooth LE; the link itself identifies the peer.
    Ble,
}

/// Where a peer can be reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    transport: TransportType,
    ip:        IpAddr,
    port:      u16,
}

impl PeerAddress {
    /// An address with no transport; what a session holds before it has
    /// heard from its peer.
    pub fn uninitialized() -> Self {
        Self { transport: TransportType::Undefined, ip: IpAddr::V6(Ipv6Addr::UNSPECIFIED), port: 0 }
    }

    /// A UDP peer.
    pub fn udp(addr: SocketAddr) -> Self {
        Self { transport: TransportType::Udp, ip: addr.ip(), port: addr.port() }
    }

    /// A TCP peer.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self { transport: TransportType::Tcp, ip: addr.ip(), port: addr.port() }
    }

    /// A BLE peer.
    pub fn ble() -> Self {
        Self { transport: TransportType::Ble, ..Self::uninitialized() }
    }

    /// The transport type.
    pub fn transport_type(&self) -> TransportType { self.transport }

    /// The IP address; unspecified for non-IP transports.
    pub fn ip(&self) -> IpAddr { self.ip }

    /// The port; 0 for non-IP transports.
    pub fn port(&self) -> u16 { self.port }

    /// True if the IP part is the unspecified ("any") address.
    pub fn is_any_ip(&self) -> bool { self.ip.is_unspecified() }

    /// The socket address for IP transports.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.transport {
            TransportType::Udp | TransportType::Tcp => Some(SocketAddr::new(self.ip, self.port)),
            _                                         => None,
        }
    }
}

impl Default for PeerAddress {
    fn default() -> Self { Self::uninitialized() }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport {
            TransportType::Udp       => write!(f, "UDP:{}", SocketAddr::new(self.ip, self.port)),
            TransportType::Tcp       => write!(f, "TCP:{}", SocketAddr::new(self.ip, self.port)),
            TransportType::Ble       => write!(f, "BLE"),
            TransportType::Undefined => write!(f, "UNDEFINED"),
        }
    }
}
