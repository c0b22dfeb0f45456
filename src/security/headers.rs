//! Inbound headers that never reach handler code.
//!
//! The hosted runtime sits behind proxies and load balancers whose
//! bookkeeping headers are stripped before a function sees the request. The
//! local runtime strips the same set so handlers cannot come to depend on
//! them.

/// Header name prefixes that are dropped (compared lowercase).
pub const RESTRICTED_HEADER_PREFIXES: &[&str] = &["x-amz", "x-envoy-", "x-forwarded-", "x-home-region"];

/// Header names that are dropped (compared lowercase).
pub const RESTRICTED_HEADER_EXACT_MATCHES: &[&str] = &[
    "connection",
    "forwarded",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "via",
    "x-real-ip",
];

/// Returns `true` if a header with this (already lowercased) name must be
/// hidden from handlers.
pub fn is_restricted_header(lowercase_name: &str) -> bool {
    RESTRICTED_HEADER_EXACT_MATCHES.contains(&lowercase_name)
        || RESTRICTED_HEADER_PREFIXES
            .iter()
            .any(|prefix| lowercase_name.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_and_exact_matches() {
        assert!(is_restricted_header("x-amz-foo"));
        assert!(is_restricted_header("x-amzn-trace-id"));
        assert!(is_restricted_header("x-forwarded-for"));
        assert!(is_restricted_header("via"));
        assert!(is_restricted_header("transfer-encoding"));
    }

    #[test]
    fn ordinary_headers_pass() {
        assert!(!is_restricted_header("content-type"));
        assert!(!is_restricted_header("x-twilio-signature"));
        assert!(!is_restricted_header("viable"));
        assert!(!is_restricted_header("user-agent"));
    }
}
