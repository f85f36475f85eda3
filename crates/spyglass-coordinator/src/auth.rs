//! Probe stream authentication.
//!
//! Probes present a shared secret at stream open; in `ip_allowlist`
//! mode the peer address must additionally fall inside one of the
//! configured IPs or CIDR blocks. Rejection happens at setup — an
//! unauthenticated peer never reaches the message loop.

use std::net::IpAddr;

use tracing::warn;

use crate::config::{AuthConfig, AuthMode};

/// Authentication failures, surfaced before any envelope is accepted.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    /// Missing or wrong shared secret.
    #[error("invalid API key")]
    Unauthenticated,

    /// Valid secret, but the peer address is not allow-listed.
    #[error("address {0} not in allow-list")]
    PermissionDenied(IpAddr),
}

/// An allow-list entry: a network prefix of either family.
#[derive(Debug, Clone, Copy)]
struct IpNet {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNet {
    fn parse(entry: &str) -> Option<Self> {
        match entry.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().ok()?;
                let prefix_len: u8 = prefix.parse().ok()?;
                let max = match addr {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                (prefix_len <= max).then_some(Self { addr, prefix_len })
            }
            None => {
                let addr: IpAddr = entry.parse().ok()?;
                let prefix_len = match addr {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                Some(Self { addr, prefix_len })
            }
        }
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = u32::from(self.prefix_len);
                if bits == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - bits);
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = u32::from(self.prefix_len);
                if bits == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - bits);
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

/// Validates probe credentials against the configured auth policy.
#[derive(Debug)]
pub struct Authenticator {
    mode: AuthMode,
    api_key: String,
    allow_list: Vec<IpNet>,
}

impl Authenticator {
    /// Build an authenticator from config.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first malformed allow-list entry.
    pub fn new(config: &AuthConfig) -> Result<Self, String> {
        let mut allow_list = Vec::with_capacity(config.ip_allowlist.len());
        for entry in &config.ip_allowlist {
            let net = IpNet::parse(entry)
                .ok_or_else(|| format!("invalid allow-list entry: {entry}"))?;
            allow_list.push(net);
        }
        Ok(Self {
            mode: config.mode,
            api_key: config.api_key.clone(),
            allow_list,
        })
    }

    /// Validate a connection attempt.
    ///
    /// # Errors
    ///
    /// [`AuthError::Unauthenticated`] for a bad secret,
    /// [`AuthError::PermissionDenied`] for a peer outside the
    /// allow-list in `ip_allowlist` mode.
    pub fn authenticate(&self, api_key: &str, peer: IpAddr) -> Result<(), AuthError> {
        if api_key != self.api_key {
            warn!(%peer, "rejected connection with invalid API key");
            return Err(AuthError::Unauthenticated);
        }

        if self.mode == AuthMode::IpAllowlist
            && !self.allow_list.iter().any(|net| net.contains(peer))
        {
            warn!(%peer, "rejected connection outside allow-list");
            return Err(AuthError::PermissionDenied(peer));
        }

        Ok(())
    }
}
