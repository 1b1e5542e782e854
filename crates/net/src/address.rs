use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// An IPv4 endpoint packed into a 32-bit address and a 16-bit port.
///
/// The derived ordering is lexicographic on `(addr, port)`, which makes the
/// type usable as a map key with a stable total order. The all-zero value is
/// the "no address" sentinel used by the mesh membership wire format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    addr: u32,
    port: u16,
}

impl Address {
    pub const ZERO: Address = Address { addr: 0, port: 0 };

    pub fn new(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self {
            addr: u32::from_be_bytes([a, b, c, d]),
            port,
        }
    }

    pub fn from_parts(addr: u32, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn octets(&self) -> [u8; 4] {
        self.addr.to_be_bytes()
    }

    pub fn is_zero(&self) -> bool {
        self.addr == 0 && self.port == 0
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self {
            addr: self.addr,
            port,
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.addr), self.port)
    }

    /// Converts from a `SocketAddr`; IPv6 senders have no representation here.
    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(Self {
                addr: u32::from(*v4.ip()),
                port: v4.port(),
            }),
            SocketAddr::V6(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{}.{}.{}.{}:{}", a, b, c, d, self.port)
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Self {
            addr: u32::from(*addr.ip()),
            port: addr.port(),
        }
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        SocketAddr::V4(addr.to_socket_addr())
    }
}

/// Parses `a.b.c.d:port` or a bare `a.b.c.d` (port 0).
impl FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((ip, port)) = s.rsplit_once(':') {
            let ip = ip.parse::<Ipv4Addr>()?;
            // Reuse AddrParseError for a bad port by re-parsing the whole thing.
            match port.parse::<u16>() {
                Ok(port) => Ok(Self::new_from_ip(ip, port)),
                Err(_) => s.parse::<SocketAddrV4>().map(Address::from),
            }
        } else {
            let ip = s.parse::<Ipv4Addr>()?;
            Ok(Self::new_from_ip(ip, 0))
        }
    }
}

impl Address {
    fn new_from_ip(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            addr: u32::from(ip),
            port,
        }
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Option<Self> {
        match ip {
            IpAddr::V4(v4) => Some(Self::new_from_ip(v4, port)),
            IpAddr::V6(_) => None,
        }
    }
}
