use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::AppError;
use crate::state::AppState;

pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let trusted = &state.config.trusted_hosts;
    if trusted.is_empty() || trusted.iter().any(|host| host == "*") {
        return Ok(next.run(request).await);
    }

    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(strip_port)
        .unwrap_or_default();

    if trusted.iter().any(|allowed| host_matches(allowed, host)) {
        return Ok(next.run(request).await);
    }

    Err(AppError::BadRequest("Untrusted host header.".to_string()))
}

fn strip_port(host: &str) -> &str {
    // IPv6 literals keep their brackets; everything else drops :port.
    if host.starts_with('[') {
        host.split(']').next().map(|h| &host[..h.len() + 1]).unwrap_or(host)
    } else {
        host.split(':').next().unwrap_or(host)
    }
}

fn host_matches(allowed: &str, host: &str) -> bool {
    if let Some(suffix) = allowed.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    allowed.eq_ignore_ascii_case(host)
}

#[cfg(test)]
mod tests {
    use super::{host_matches, strip_port};

    #[test]
    fn strips_ports_but_keeps_ipv6_brackets() {
        assert_eq!(strip_port("api.voltora.in:443"), "api.voltora.in");
        assert_eq!(strip_port("localhost"), "localhost");
        assert_eq!(strip_port("[::1]:5000"), "[::1]");
    }

    #[test]
    fn wildcard_subdomains_match() {
        assert!(host_matches("*.voltora.in", "api.voltora.in"));
        assert!(host_matches("*.voltora.in", "voltora.in"));
        assert!(!host_matches("*.voltora.in", "evil.example.com"));
        assert!(host_matches("localhost", "LOCALHOST"));
    }
}
