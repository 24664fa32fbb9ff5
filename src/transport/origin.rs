//! Origin validation for the listening stream transport.
//!
//! The SSE listener is reachable from browsers, which makes it a DNS
//! rebinding target: a hostile page can resolve its own hostname to
//! 127.0.0.1 and drive the bridge (and the child process behind it) with
//! the victim's cookies for company. Checking the `Origin` header against
//! an allowlist shuts that down while leaving non-browser clients, which
//! send no `Origin` at all, unaffected.

use axum::http::{HeaderMap, StatusCode, header};

/// Origins accepted out of the box: local loopback over http and https.
pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost",
    "http://127.0.0.1",
    "http://[::1]",
    "https://localhost",
    "https://127.0.0.1",
    "https://[::1]",
];

/// The default allowlist plus operator-supplied extras.
pub fn allowed_origins(extra: &[String]) -> Vec<String> {
    let mut origins: Vec<String> = DEFAULT_ALLOWED_ORIGINS
        .iter()
        .map(|s| s.to_string())
        .collect();
    origins.extend(extra.iter().cloned());
    origins
}

/// Validate the `Origin` header against the allowlist.
///
/// An absent header passes. A present header must match an allowed origin
/// exactly, or differ from one only by an explicit `:port` suffix, so
/// `http://localhost:3000` is accepted while `http://localhost.evil.com`
/// is not.
pub fn validate_origin(headers: &HeaderMap, allowed: &[String]) -> Result<(), StatusCode> {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return Ok(());
    };
    let origin = origin.to_str().map_err(|_| StatusCode::FORBIDDEN)?;

    for candidate in allowed {
        if origin == candidate {
            return Ok(());
        }
        // Allow "<candidate>:<digits>" and nothing else
        if let Some(rest) = origin.strip_prefix(candidate.as_str()) {
            if let Some(port) = rest.strip_prefix(':') {
                if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
                    return Ok(());
                }
            }
        }
    }

    Err(StatusCode::FORBIDDEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_origin(origin: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_str(origin).unwrap());
        headers
    }

    fn defaults() -> Vec<String> {
        allowed_origins(&[])
    }

    #[test]
    fn test_absent_origin_allowed() {
        let headers = HeaderMap::new();
        assert!(validate_origin(&headers, &defaults()).is_ok());
    }

    #[test]
    fn test_exact_loopback_origins_allowed() {
        for origin in DEFAULT_ALLOWED_ORIGINS {
            let headers = headers_with_origin(origin);
            assert!(
                validate_origin(&headers, &defaults()).is_ok(),
                "origin {} should pass",
                origin
            );
        }
    }

    #[test]
    fn test_loopback_with_port_allowed() {
        let headers = headers_with_origin("http://localhost:3000");
        assert!(validate_origin(&headers, &defaults()).is_ok());

        let headers = headers_with_origin("http://127.0.0.1:8766");
        assert!(validate_origin(&headers, &defaults()).is_ok());
    }

    #[test]
    fn test_foreign_origin_rejected() {
        let headers = headers_with_origin("http://evil.com");
        assert_eq!(
            validate_origin(&headers, &defaults()),
            Err(StatusCode::FORBIDDEN)
        );
    }

    #[test]
    fn test_hostname_prefix_trick_rejected() {
        // Shares the allowed value as a string prefix but is another host
        let headers = headers_with_origin("http://localhost.evil.com");
        assert_eq!(
            validate_origin(&headers, &defaults()),
            Err(StatusCode::FORBIDDEN)
        );
    }

    #[test]
    fn test_non_numeric_port_rejected() {
        let headers = headers_with_origin("http://localhost:30x0");
        assert_eq!(
            validate_origin(&headers, &defaults()),
            Err(StatusCode::FORBIDDEN)
        );

        let headers = headers_with_origin("http://localhost:");
        assert_eq!(
            validate_origin(&headers, &defaults()),
            Err(StatusCode::FORBIDDEN)
        );
    }

    #[test]
    fn test_operator_extras_honored() {
        let allowed = allowed_origins(&["https://ide.internal".to_string()]);

        let headers = headers_with_origin("https://ide.internal");
        assert!(validate_origin(&headers, &allowed).is_ok());

        let headers = headers_with_origin("https://ide.internal:8443");
        assert!(validate_origin(&headers, &allowed).is_ok());

        // Extras extend the list, they do not replace it
        let headers = headers_with_origin("http://localhost");
        assert!(validate_origin(&headers, &allowed).is_ok());
    }
}
