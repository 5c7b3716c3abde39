//! Webhook URL validation and SSRF protection

use super::WebhookError;
use reqwest::Url;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Private, loopback, link-local, multicast, reserved, CGNAT, test-net and
/// benchmark ranges
const BLOCKED_V4: [(Ipv4Addr, u8); 14] = [
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 0, 0, 0), 24),
    (Ipv4Addr::new(192, 0, 2, 0), 24),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
    (Ipv4Addr::new(198, 51, 100, 0), 24),
    (Ipv4Addr::new(203, 0, 113, 0), 24),
    (Ipv4Addr::new(224, 0, 0, 0), 4),
    (Ipv4Addr::new(240, 0, 0, 0), 4),
];

/// IPv6 loopback, unspecified, IPv4-mapped, unique-local, link-local,
/// multicast and documentation ranges
const BLOCKED_V6: [(Ipv6Addr, u8); 7] = [
    (Ipv6Addr::UNSPECIFIED, 128),
    (Ipv6Addr::LOCALHOST, 128),
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0, 0), 96),
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
    (Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8),
    (Ipv6Addr::new(0x2001, 0x0db8, 0, 0, 0, 0, 0, 0), 32),
];

fn in_v4_net(ip: Ipv4Addr, net: Ipv4Addr, prefix: u8) -> bool {
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    u32::from(ip) & mask == u32::from(net) & mask
}

fn in_v6_net(ip: Ipv6Addr, net: Ipv6Addr, prefix: u8) -> bool {
    let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
    u128::from(ip) & mask == u128::from(net) & mask
}

/// Whether an address must never be the target of a webhook
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => BLOCKED_V4
            .iter()
            .any(|(net, prefix)| in_v4_net(v4, *net, *prefix)),
        IpAddr::V6(v6) => BLOCKED_V6
            .iter()
            .any(|(net, prefix)| in_v6_net(v6, *net, *prefix)),
    }
}

/// Parse and vet a webhook URL.
///
/// With `block_private` set the host is resolved and every address it
/// resolves to must be public.
pub async fn validate_webhook_url(raw: &str, block_private: bool) -> Result<Url, WebhookError> {
    let url = Url::parse(raw).map_err(|e| WebhookError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(WebhookError::UnsupportedScheme(other.to_string())),
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| WebhookError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        })?
        .to_string();

    if !block_private {
        return Ok(url);
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return check_addr(&host, ip).map(|_| url);
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((bare, port))
        .await
        .map_err(|source| WebhookError::Resolve {
            host: host.clone(),
            source,
        })?
        .map(|addr| addr.ip())
        .collect();

    if addrs.is_empty() {
        return Err(WebhookError::Unresolvable(host));
    }
    for ip in addrs {
        check_addr(&host, ip)?;
    }
    Ok(url)
}

fn check_addr(host: &str, ip: IpAddr) -> Result<(), WebhookError> {
    if is_blocked_ip(ip) {
        return Err(WebhookError::BlockedAddress {
            host: host.to_string(),
            addr: ip,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_blocked_v4_ranges() {
        for addr in [
            "10.1.2.3",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.169.254",
            "100.64.0.1",
            "198.18.0.1",
            "198.19.255.255",
            "203.0.113.9",
            "224.0.0.1",
            "255.255.255.255",
            "0.0.0.0",
        ] {
            assert!(is_blocked_ip(ip(addr)), "{addr} should be blocked");
        }
    }

    #[test]
    fn test_public_v4_allowed() {
        for addr in ["8.8.8.8", "1.1.1.1", "172.32.0.1", "100.128.0.1", "93.184.216.34"] {
            assert!(!is_blocked_ip(ip(addr)), "{addr} should be allowed");
        }
    }

    #[test]
    fn test_v6_ranges() {
        assert!(is_blocked_ip(ip("::1")));
        assert!(is_blocked_ip(ip("fe80::1")));
        assert!(is_blocked_ip(ip("fd12:3456::1")));
        assert!(is_blocked_ip(ip("ff02::1")));
        // IPv4-mapped addresses are refused outright
        assert!(is_blocked_ip(ip("::ffff:10.0.0.1")));
        assert!(is_blocked_ip(ip("::ffff:8.8.8.8")));
        assert!(!is_blocked_ip(ip("2606:4700:4700::1111")));
    }

    #[tokio::test]
    async fn test_metadata_endpoint_depends_on_protection() {
        let err = validate_webhook_url("http://169.254.169.254/", true)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::BlockedAddress { .. }));

        assert!(validate_webhook_url("http://169.254.169.254/", false).await.is_ok());
    }

    #[tokio::test]
    async fn test_ipv6_literal_checked() {
        let err = validate_webhook_url("http://[::1]:8080/hook", true)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::BlockedAddress { .. }));
    }

    #[tokio::test]
    async fn test_localhost_name_resolves_to_blocked() {
        let err = validate_webhook_url("http://localhost:9000/hook", true)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::BlockedAddress { .. }));
    }

    #[tokio::test]
    async fn test_scheme_and_host_required() {
        assert!(matches!(
            validate_webhook_url("ftp://example.com/", false).await,
            Err(WebhookError::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(matches!(
            validate_webhook_url("not a url", false).await,
            Err(WebhookError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_public_literal_allowed() {
        let url = validate_webhook_url("https://93.184.216.34/hook", true)
            .await
            .unwrap();
        assert_eq!(url.scheme(), "https");
    }
}
