use ipnet::Ipv4Net;
use std::net::IpAddr;
use std::sync::LazyLock;

/// Address ranges a relay target is allowed to live in: loopback, the three
/// RFC 1918 private blocks, and link-local.
static ALLOWED_RANGES: LazyLock<Vec<Ipv4Net>> = LazyLock::new(|| {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
    ]
    .iter()
    .map(|cidr| cidr.parse().expect("static CIDR"))
    .collect()
});

/// Whether `host` is a literal IP address inside one of the allowed private
/// ranges. Hostnames are rejected outright: no DNS resolution happens here,
/// so a public name cannot be laundered into a private address or the other
/// way around. Pure function, safe to call concurrently.
pub fn is_allowed_target(host: &str) -> bool {
    let addr: IpAddr = match host.parse() {
        Ok(addr) => addr,
        Err(_) => return false,
    };

    match addr {
        IpAddr::V4(v4) => ALLOWED_RANGES.iter().any(|range| range.contains(&v4)),
        // The allow-list is IPv4-only; v6 literals never match.
        IpAddr::V6(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_allowed() {
        assert!(is_allowed_target("127.0.0.1"));
        assert!(is_allowed_target("127.255.255.254"));
    }

    #[test]
    fn test_private_ranges_allowed() {
        assert!(is_allowed_target("10.0.0.5"));
        assert!(is_allowed_target("10.255.255.255"));
        assert!(is_allowed_target("172.16.0.1"));
        assert!(is_allowed_target("172.31.255.255"));
        assert!(is_allowed_target("192.168.1.10"));
        assert!(is_allowed_target("169.254.0.1"));
    }

    #[test]
    fn test_public_rejected() {
        assert!(!is_allowed_target("8.8.8.8"));
        assert!(!is_allowed_target("1.1.1.1"));
        assert!(!is_allowed_target("172.32.0.1")); // one past 172.16.0.0/12
        assert!(!is_allowed_target("172.15.255.255")); // one before
        assert!(!is_allowed_target("192.169.0.1"));
    }

    #[test]
    fn test_hostnames_rejected_without_resolution() {
        assert!(!is_allowed_target("localhost"));
        assert!(!is_allowed_target("internal.example.com"));
        assert!(!is_allowed_target(""));
    }

    #[test]
    fn test_ipv6_rejected() {
        assert!(!is_allowed_target("::1"));
        assert!(!is_allowed_target("fe80::1"));
    }
}
