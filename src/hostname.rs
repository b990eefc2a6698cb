//! Hostname normalization shared by every caller of the store

/// Lowercase a host, dropping any port suffix and a trailing root dot.
///
/// Bracketed IPv6 literals keep their brackets. Returns `None` for an empty
/// host.
pub fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();

    let host = if raw.starts_with('[') {
        match raw.find(']') {
            Some(end) => &raw[..=end],
            None => raw,
        }
    } else {
        match raw.rsplit_once(':') {
            // A single colon separates host and port; more means a bare IPv6
            Some((host, port))
                if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) =>
            {
                host
            }
            _ => raw,
        }
    };

    let host = host.strip_suffix('.').unwrap_or(host);

    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}
