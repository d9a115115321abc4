use axum::http::header::{HeaderName, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use tower_http::cors::{Any, CorsLayer};

use crate::config::AppConfig;

/// Browser clients send credentialed requests, so origins are echoed back
/// explicitly unless the config opts into a credential-less wildcard.
pub fn build_cors_layer(config: &AppConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(allowed_headers(config));

    if allows_any_origin(&config.cors_origins) {
        layer.allow_origin(Any).allow_credentials(false)
    } else {
        let origins = config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse::<HeaderValue>().ok())
            .collect::<Vec<_>>();
        layer.allow_origin(origins).allow_credentials(true)
    }
}

fn allowed_headers(config: &AppConfig) -> Vec<HeaderName> {
    let mut headers = vec![ACCEPT, AUTHORIZATION, CONTENT_TYPE];
    if config.auth_dev_overrides_enabled() {
        // Dev identity headers, read by auth::dev_override_user.
        headers.push(HeaderName::from_static("x-user-id"));
        headers.push(HeaderName::from_static("x-user-role"));
    }
    headers
}

fn allows_any_origin(origins: &[String]) -> bool {
    origins.iter().any(|origin| origin.trim() == "*")
}

#[cfg(test)]
mod tests {
    use super::allows_any_origin;

    #[test]
    fn wildcard_origin_detection() {
        assert!(allows_any_origin(&["*".to_string()]));
        assert!(allows_any_origin(&[" * ".to_string(), "x".to_string()]));
        assert!(!allows_any_origin(&["http://localhost:3000".to_string()]));
    }
}
