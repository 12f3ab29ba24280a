//! Relay endpoint normalization and URL escaping.
//!
//! Inputs may name the relay namespace as a bare name, an FQDN, or a full
//! URI; everything is normalized to a bare FQDN before any URL is built.
//! The escaping helpers match the query/path-segment escaping rules the
//! relay service expects, so signed resource URIs are reproducible
//! byte-for-byte.

use url::Url;

/// Relay namespace suffix for the public cloud.
pub const DEFAULT_RELAY_SUFFIX: &str = ".servicebus.windows.net";

/// Normalizes a relay input to a bare FQDN.
///
/// Accepted input formats:
///   - Bare namespace name: `my-relay` → `my-relay` + default suffix
///   - FQDN: `my-relay.servicebus.windows.net` → used as-is
///   - URI with scheme: `sb://my-relay.servicebus.windows.net` → host extracted
///   - URI with port: `https://my-relay.servicebus.windows.net:443/` → host extracted
///
/// Empty input is returned as-is; callers validate before use.
pub fn parse_relay_endpoint(input: &str, default_suffix: &str) -> String {
    let input = input.trim();
    if input.is_empty() {
        return String::new();
    }

    if input.contains("://") {
        if let Ok(u) = Url::parse(input) {
            if let Some(host) = u.host_str() {
                if !host.is_empty() {
                    if host.contains('.') {
                        return host.to_string();
                    }
                    return format!("{host}{default_suffix}");
                }
            }
        }
    }

    if input.contains('.') {
        return input.to_string();
    }

    format!("{input}{default_suffix}")
}

/// Converts an endpoint to a wss:// base URL. An endpoint that already
/// carries a scheme is passed through unchanged, which lets tests point at
/// a plaintext ws:// relay.
pub fn endpoint_to_wss(endpoint: &str) -> String {
    if endpoint.contains("://") {
        return endpoint.to_string();
    }
    format!("wss://{endpoint}")
}

/// Converts an endpoint to an https:// base URL.
pub fn endpoint_to_https(endpoint: &str) -> String {
    if endpoint.contains("://") {
        return endpoint.to_string();
    }
    format!("https://{endpoint}")
}

/// Returns the HTTPS resource URI used for token generation.
pub fn resource_uri(fqdn: &str, entity_path: &str) -> String {
    let base = endpoint_to_https(fqdn);
    if entity_path.is_empty() {
        return base;
    }
    format!("{base}/{entity_path}")
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~')
}

fn push_pct(out: &mut String, b: u8) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    out.push('%');
    out.push(HEX[(b >> 4) as usize] as char);
    out.push(HEX[(b & 0x0F) as usize] as char);
}

/// Escapes a string for use inside a URL query component. Spaces become
/// `+` and everything outside the unreserved set is percent-encoded.
pub fn query_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else if b == b' ' {
            out.push('+');
        } else {
            push_pct(&mut out, b);
        }
    }
    out
}

/// Escapes a string for use as a single URL path segment. Sub-delimiters
/// that are legal inside a segment (`$ & + : = @`) are left alone; `/` and
/// everything else outside the unreserved set is percent-encoded.
pub fn path_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_unreserved(b) || matches!(b, b'$' | b'&' | b'+' | b':' | b'=' | b'@') {
            out.push(b as char);
        } else {
            push_pct(&mut out, b);
        }
    }
    out
}
