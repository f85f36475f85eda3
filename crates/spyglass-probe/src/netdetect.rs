//! Public IP auto-detection.
//!
//! When the config leaves `ipv4`/`ipv6` empty, the probe asks a few
//! plain-text IP echo services and falls back to the address of an
//! outbound UDP socket (useful behind NAT for the local side at
//! least). Detection failure is never fatal — addresses are optional,
//! informational fields.

use std::net::{IpAddr, UdpSocket};
use std::time::Duration;

use tracing::debug;

const IPV4_SERVICES: &[&str] = &[
    "https://api.ipify.org",
    "https://ifconfig.me/ip",
    "https://icanhazip.com",
    "https://ident.me",
];

const IPV6_SERVICES: &[&str] = &["https://api6.ipify.org", "https://ifconfig.co/ip"];

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Detect the public IPv4 address, if any.
pub async fn public_ipv4() -> Option<String> {
    for service in IPV4_SERVICES {
        if let Some(ip) = fetch_ip(service).await {
            if matches!(ip, IpAddr::V4(_)) {
                return Some(ip.to_string());
            }
        }
    }
    outbound_ip("8.8.8.8:80").filter(|ip| matches!(ip, IpAddr::V4(_))).map(|ip| ip.to_string())
}

/// Detect the public IPv6 address, if any. Absence is normal on
/// v4-only hosts.
pub async fn public_ipv6() -> Option<String> {
    for service in IPV6_SERVICES {
        if let Some(ip) = fetch_ip(service).await {
            if matches!(ip, IpAddr::V6(_)) {
                return Some(ip.to_string());
            }
        }
    }
    outbound_ip("[2001:4860:4860::8888]:80")
        .filter(|ip| matches!(ip, IpAddr::V6(_)))
        .map(|ip| ip.to_string())
}

async fn fetch_ip(url: &str) -> Option<IpAddr> {
    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .ok()?;
    let body = client.get(url).send().await.ok()?.text().await.ok()?;
    match body.trim().parse::<IpAddr>() {
        Ok(ip) => Some(ip),
        Err(_) => {
            debug!(url, "IP echo service returned an unparsable body");
            None
        }
    }
}

/// Address of an outbound UDP socket toward a public resolver; no
/// packet is actually sent.
fn outbound_ip(target: &str) -> Option<IpAddr> {
    let bind_addr = if target.starts_with('[') {
        "[::]:0"
    } else {
        "0.0.0.0:0"
    };
    let socket = UdpSocket::bind(bind_addr).ok()?;
    socket.connect(target).ok()?;
    let local = socket.local_addr().ok()?;
    let ip = local.ip();
    if ip.is_unspecified() || ip.is_loopback() {
        None
    } else {
        Some(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_ip_never_returns_unspecified() {
        // May be None in a sandboxed environment; must never be 0.0.0.0.
        if let Some(ip) = outbound_ip("8.8.8.8:80") {
            assert!(!ip.is_unspecified());
            assert!(!ip.is_loopback());
        }
    }
}
