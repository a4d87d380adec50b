//! Identifier validators for the provisioning protocol
//!
//! Path segments and headers are validated against these token formats
//! before any tenant code runs.

/// Endpoint names: alphanumeric plus `-` and `_`, case-insensitive.
pub fn is_endpoint_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Service IDs: ASCII letters only, case-insensitive.
pub fn is_service_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphabetic())
}

/// Resource (and instance) IDs: `8-4-4-4-12` groups of lowercase
/// alphanumerics.
pub fn is_resource_id(s: &str) -> bool {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
    let mut parts = s.split('-');
    for len in GROUPS {
        match parts.next() {
            Some(part)
                if part.len() == len
                    && part
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) => {}
            _ => return false,
        }
    }
    parts.next().is_none()
}

/// Legal HTTP header-name tokens per RFC 7230.
pub fn is_http_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || "_!#$%&'*+.^`|~-".contains(c)
        })
}

/// Hostnames: dot-separated labels of letters, digits, and dashes.
pub fn is_hostname(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
