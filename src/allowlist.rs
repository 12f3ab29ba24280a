//! Listener-side target admission policy.
//!
//! Allowlist entries come in five shapes:
//!   - `host:port` - exact string match, no DNS resolution
//!   - `host:*` - exact host, any port
//!   - `CIDR:port` - CIDR match with exact port
//!   - `CIDR:*` - CIDR match with any port
//!   - `*` - allow everything
//!
//! Hostname entries are matched literally so a DNS answer at connect time
//! cannot widen the policy; CIDR entries are the tool for IP restrictions.

use std::net::IpAddr;

/// Decides whether `target` (a `host:port` string) is admitted by the
/// allowlist. An empty allowlist admits everything; a malformed target is
/// denied; a malformed entry is skipped. Entry order never changes the
/// outcome.
pub fn is_allowed(target: &str, allow_list: &[String]) -> bool {
    if allow_list.is_empty() {
        return true;
    }

    let Some((host, port)) = split_host_port(target) else {
        return false;
    };
    let target_ip: Option<IpAddr> = host.parse().ok();

    for entry in allow_list {
        if entry == "*" {
            return true;
        }

        let Some((entry_host, entry_port)) = split_last_colon(entry) else {
            continue;
        };

        if entry_port != "*" && entry_port != port {
            continue;
        }

        if let Some((net, prefix)) = parse_cidr(entry_host) {
            if let Some(ip) = target_ip {
                if cidr_contains(net, prefix, ip) {
                    return true;
                }
            }
        } else if host == entry_host {
            return true;
        }
    }
    false
}

/// Splits a target on the last colon and strips IPv6 brackets from the
/// host side.
fn split_host_port(target: &str) -> Option<(&str, &str)> {
    let (host, port) = split_last_colon(target)?;
    if host.is_empty() || port.is_empty() {
        return None;
    }
    let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Some(inner) => inner,
        None => host,
    };
    Some((host, port))
}

/// Splits on the last colon. CIDR and IPv6 entries contain colons in the
/// host part, so only the final one separates the port.
fn split_last_colon(s: &str) -> Option<(&str, &str)> {
    let idx = s.rfind(':')?;
    Some((&s[..idx], &s[idx + 1..]))
}

fn parse_cidr(s: &str) -> Option<(IpAddr, u8)> {
    let (ip_str, len_str) = s.rsplit_once('/')?;
    let ip: IpAddr = ip_str.parse().ok()?;
    let prefix: u8 = len_str.parse().ok()?;
    let max = match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    (prefix <= max).then_some((ip, prefix))
}

fn cidr_contains(net: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            if prefix == 0 {
                return true;
            }
            let net = u32::from(net);
            let ip = u32::from(ip);
            (net ^ ip) >> (32 - prefix) == 0
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            if prefix == 0 {
                return true;
            }
            let net = u128::from(net);
            let ip = u128::from(ip);
            (net ^ ip) >> (128 - prefix) == 0
        }
        _ => false,
    }
}
