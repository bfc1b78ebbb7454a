use core::net::{Ipv4Addr, SocketAddrV4};
use core::str::FromStr;

/// A minimal IPv4 CIDR implementation (e.g. `10.0.0.0/8`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpCidr {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl IpCidr {
    pub const fn new(network: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            network,
            prefix_len,
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let prefix_len = self.prefix_len.min(32);
        let mask = if prefix_len == 0 {
            0u32
        } else {
            u32::MAX << (32 - prefix_len)
        };
        let net = u32::from(self.network) & mask;
        let ip = u32::from(ip) & mask;
        net == ip
    }
}

impl FromStr for IpCidr {
    type Err = String;

    /// Accepts `a.b.c.d/len` or a bare address (treated as `/32`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix_len) = match s.split_once('/') {
            Some((addr, len)) => {
                let len: u8 = len
                    .parse()
                    .map_err(|_| format!("invalid prefix length {len:?}"))?;
                if len > 32 {
                    return Err(format!("prefix length {len} exceeds 32"));
                }
                (addr, len)
            }
            None => (s, 32),
        };
        let network: Ipv4Addr = addr
            .parse()
            .map_err(|_| format!("invalid IPv4 address {addr:?}"))?;
        Ok(Self::new(network, prefix_len))
    }
}

/// Admission rules for new flows, applied to the destination the local sender is reaching for.
///
/// Deny lists win over allow lists. An empty allow list allows everything. A denied TCP SYN is
/// answered with RST; a denied UDP datagram is dropped silently.
#[derive(Debug, Clone, Default)]
pub struct FlowPolicy {
    /// If non-empty, only destinations matching at least one CIDR are admitted.
    pub allow_ips: Vec<IpCidr>,
    pub deny_ips: Vec<IpCidr>,
    /// If non-empty, only these destination ports are admitted.
    pub allow_ports: Vec<u16>,
    pub deny_ports: Vec<u16>,
}

impl FlowPolicy {
    pub fn allows_ip(&self, ip: Ipv4Addr) -> bool {
        if self.deny_ips.iter().any(|cidr| cidr.contains(ip)) {
            return false;
        }
        if !self.allow_ips.is_empty() {
            return self.allow_ips.iter().any(|cidr| cidr.contains(ip));
        }
        true
    }

    pub fn allows_port(&self, port: u16) -> bool {
        if self.deny_ports.contains(&port) {
            return false;
        }
        self.allow_ports.is_empty() || self.allow_ports.contains(&port)
    }

    pub fn allows(&self, dst: SocketAddrV4) -> bool {
        self.allows_ip(*dst.ip()) && self.allows_port(dst.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_parses_and_matches() {
        let cidr: IpCidr = "10.0.0.0/8".parse().unwrap();
        assert!(cidr.contains(Ipv4Addr::new(10, 200, 1, 1)));
        assert!(!cidr.contains(Ipv4Addr::new(11, 0, 0, 1)));

        let host: IpCidr = "192.0.2.7".parse().unwrap();
        assert!(host.contains(Ipv4Addr::new(192, 0, 2, 7)));
        assert!(!host.contains(Ipv4Addr::new(192, 0, 2, 8)));

        let any: IpCidr = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains(Ipv4Addr::new(203, 0, 113, 9)));

        assert!("10.0.0.0/33".parse::<IpCidr>().is_err());
        assert!("10.0.0/8".parse::<IpCidr>().is_err());
        assert!("10.0.0.0/x".parse::<IpCidr>().is_err());
    }

    #[test]
    fn deny_wins_over_allow() {
        let policy = FlowPolicy {
            allow_ips: vec!["10.0.0.0/8".parse().unwrap()],
            deny_ips: vec!["10.9.0.0/16".parse().unwrap()],
            allow_ports: Vec::new(),
            deny_ports: vec![25],
        };
        assert!(policy.allows(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 443)));
        assert!(!policy.allows(SocketAddrV4::new(Ipv4Addr::new(10, 9, 2, 3), 443)));
        assert!(!policy.allows(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 25)));
        assert!(!policy.allows(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 443)));
    }

    #[test]
    fn empty_policy_allows_everything() {
        let policy = FlowPolicy::default();
        assert!(policy.allows(SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 53)));
    }

    #[test]
    fn port_allow_list_restricts() {
        let policy = FlowPolicy {
            allow_ports: vec![80, 443],
            ..FlowPolicy::default()
        };
        assert!(policy.allows_port(443));
        assert!(!policy.allows_port(22));
    }
}
