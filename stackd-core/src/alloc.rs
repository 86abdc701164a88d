//! Pure allocation helpers for host ports and static IPv4 addresses.
//!
//! Both functions always pick the smallest free value so that repeated
//! reconciles over the same workspace produce identical layouts. They are
//! only consulted when a duplicate is detected; values that are already
//! unique are never reassigned.

use std::collections::HashSet;
use std::net::Ipv4Addr;

/// First host port the allocator will hand out.
pub const PORT_FLOOR: u16 = 10000;

/// Smallest port `>= PORT_FLOOR` not present in `used`.
#[must_use]
pub fn next_host_port(used: &HashSet<u16>) -> u16 {
    (PORT_FLOOR..=u16::MAX)
        .find(|p| !used.contains(p))
        .unwrap_or(u16::MAX)
}

/// Smallest host in the `.2 ..= .254` range of `base`'s /24 not present in
/// `used`. Returns `None` when the subnet is exhausted.
#[must_use]
pub fn next_ipv4(base: Ipv4Addr, used: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    let [a, b, c, _] = base.octets();
    (2..=254u8)
        .map(|d| Ipv4Addr::new(a, b, c, d))
        .find(|ip| !used.contains(ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_host_port_skips_used() {
        let used: HashSet<u16> = [10000, 10001, 10003].into_iter().collect();
        assert_eq!(next_host_port(&used), 10002);
    }

    #[test]
    fn test_next_host_port_empty() {
        assert_eq!(next_host_port(&HashSet::new()), 10000);
    }

    #[test]
    fn test_next_host_port_ignores_low_ports() {
        let used: HashSet<u16> = [80, 443, 8080].into_iter().collect();
        assert_eq!(next_host_port(&used), 10000);
    }

    #[test]
    fn test_next_ipv4_starts_at_two() {
        let base: Ipv4Addr = "172.28.0.0".parse().unwrap();
        assert_eq!(next_ipv4(base, &HashSet::new()), Some("172.28.0.2".parse().unwrap()));
    }

    #[test]
    fn test_next_ipv4_skips_used() {
        let base: Ipv4Addr = "172.28.0.5".parse().unwrap();
        let used: HashSet<Ipv4Addr> = ["172.28.0.2", "172.28.0.3"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(next_ipv4(base, &used), Some("172.28.0.4".parse().unwrap()));
    }

    #[test]
    fn test_next_ipv4_exhausted() {
        let base: Ipv4Addr = "10.0.0.0".parse().unwrap();
        let used: HashSet<Ipv4Addr> = (2..=254u8)
            .map(|d| Ipv4Addr::new(10, 0, 0, d))
            .collect();
        assert_eq!(next_ipv4(base, &used), None);
    }
}
