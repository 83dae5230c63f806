use std::fmt;
use std::net::Ipv4Addr;

/// An inclusive IPv4 address range a tunnel is authorised to carry, as
/// agreed in the traffic-selector payload of the IKE exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrafficSelector {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl TrafficSelector {
    pub const fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self { start, end }
    }

    /// The range covered by `network/prefix_len` (e.g. `10.0.0.0/24`).
    pub fn from_cidr(network: Ipv4Addr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(32);
        let mask = if prefix_len == 0 {
            0u32
        } else {
            u32::MAX << (32 - prefix_len)
        };
        let start = u32::from(network) & mask;
        Self {
            start: Ipv4Addr::from(start),
            end: Ipv4Addr::from(start | !mask),
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        u32::from(self.start) <= ip && ip <= u32::from(self.end)
    }
}

impl fmt::Display for TrafficSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_bounds() {
        let sel = TrafficSelector::from_cidr(Ipv4Addr::new(10, 0, 0, 77), 24);
        assert_eq!(sel.start, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(sel.end, Ipv4Addr::new(10, 0, 0, 255));

        let all = TrafficSelector::from_cidr(Ipv4Addr::UNSPECIFIED, 0);
        assert!(all.contains(Ipv4Addr::new(255, 255, 255, 255)));

        let host = TrafficSelector::from_cidr(Ipv4Addr::new(1, 2, 3, 4), 32);
        assert!(host.contains(Ipv4Addr::new(1, 2, 3, 4)));
        assert!(!host.contains(Ipv4Addr::new(1, 2, 3, 5)));
    }

    #[test]
    fn range_membership_is_inclusive() {
        let sel = TrafficSelector::new(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 9));
        assert!(sel.contains(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(sel.contains(Ipv4Addr::new(10, 0, 0, 9)));
        assert!(!sel.contains(Ipv4Addr::new(10, 0, 0, 10)));
        assert_eq!(sel.to_string(), "10.0.0.5 - 10.0.0.9");
    }
}
