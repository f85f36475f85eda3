//! IP address masking for probe privacy.
//!
//! Probes that register with `hide_ip` set have their addresses masked
//! before any disclosure to clients: the last two IPv4 octets and the
//! middle six IPv6 groups are replaced.
//!
//! ```text
//! 203.0.113.45                            -> 203.0.*.*
//! 2001:0db8:85a3:0000:0000:8a2e:0370:7334 -> 2001:****:****:****:****:****:****:7334
//! 2001:db8::1                             -> 2001:****:****:****:****:****:****:1
//! ```
//!
//! Strings that do not parse as addresses are returned unchanged —
//! masking must never invent data.

/// Mask an IP address (either family) when `should_mask` is set.
#[must_use]
pub fn mask_ip(ip: &str, should_mask: bool) -> String {
    if !should_mask || ip.is_empty() {
        return ip.to_string();
    }

    if ip.contains(':') {
        return mask_ipv6(ip);
    }

    let parts: Vec<&str> = ip.split('.').collect();
    if parts.len() != 4 {
        return ip.to_string();
    }
    format!("{}.{}.*.*", parts[0], parts[1])
}

/// Mask an IPv6 address, keeping the first and last groups.
#[must_use]
pub fn mask_ipv6(ip: &str) -> String {
    let Some(expanded) = expand_ipv6(ip) else {
        return ip.to_string();
    };

    let mut parts: Vec<String> = expanded.split(':').map(str::to_string).collect();
    if parts.len() != 8 {
        return ip.to_string();
    }

    for part in parts.iter_mut().take(7).skip(1) {
        *part = "****".to_string();
    }

    // The last group keeps its original (unpadded) spelling.
    let last = ip.rsplit(':').next().unwrap_or("");
    if !last.is_empty() {
        parts[7] = last.to_string();
    }

    parts.join(":")
}

/// Expand an IPv6 address with `::` compression to the full 8-group
/// form; returns `None` for strings that are not valid IPv6.
#[must_use]
pub fn expand_ipv6(ip: &str) -> Option<String> {
    if ip.is_empty() {
        return None;
    }

    let mut ip = ip.to_string();
    if ip.starts_with("::") {
        ip = format!("0{ip}");
    }
    if ip.ends_with("::") {
        ip = format!("{ip}0");
    }

    if !ip.contains("::") {
        let parts: Vec<&str> = ip.split(':').collect();
        if parts.len() != 8 {
            return None;
        }
        let padded: Option<Vec<String>> = parts.iter().map(|p| pad_group(p)).collect();
        return padded.map(|p| p.join(":"));
    }

    let halves: Vec<&str> = ip.splitn(3, "::").collect();
    if halves.len() != 2 || halves[1].contains("::") {
        return None;
    }

    let left: Vec<&str> = if halves[0].is_empty() {
        Vec::new()
    } else {
        halves[0].split(':').collect()
    };
    let right: Vec<&str> = if halves[1].is_empty() {
        Vec::new()
    } else {
        halves[1].split(':').collect()
    };

    if left.len() + right.len() >= 8 {
        return None;
    }

    let mut groups: Vec<String> = Vec::with_capacity(8);
    for part in &left {
        groups.push(pad_group(part)?);
    }
    for _ in 0..(8 - left.len() - right.len()) {
        groups.push("0000".to_string());
    }
    for part in &right {
        groups.push(pad_group(part)?);
    }

    Some(groups.join(":"))
}

fn pad_group(group: &str) -> Option<String> {
    if group.is_empty() || group.len() > 4 || !group.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("{group:0>4}"))
}
