use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub environment: String,
    pub api_prefix: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub trusted_hosts: Vec<String>,
    pub dev_auth_overrides_enabled: bool,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst_size: u32,
    pub request_timeout_seconds: u64,
    pub max_body_bytes: usize,
    pub database_url: Option<String>,
    pub db_pool_max_connections: u32,
    pub db_pool_min_connections: u32,
    pub db_pool_acquire_timeout_seconds: u64,
    pub db_pool_idle_timeout_seconds: u64,
    pub auth_jwt_secret: Option<String>,
    pub report_ttl_days: i64,
    pub report_sweep_interval_seconds: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            app_name: env_string("APP_NAME", "Voltora API"),
            environment: env_string("ENVIRONMENT", "development"),
            api_prefix: normalize_prefix(&env_string("API_PREFIX", "")),
            host: env_string("HOST", "0.0.0.0"),
            port: env_number("PORT", 5000),
            cors_origins: split_csv(&env_string("CORS_ORIGINS", "http://localhost:3000")),
            trusted_hosts: split_csv(&env_string("TRUSTED_HOSTS", "localhost,127.0.0.1")),
            dev_auth_overrides_enabled: env_flag("DEV_AUTH_OVERRIDES_ENABLED", false),
            rate_limit_enabled: env_flag("RATE_LIMIT_ENABLED", true),
            rate_limit_per_second: env_number("RATE_LIMIT_PER_SECOND", 10),
            rate_limit_burst_size: env_number("RATE_LIMIT_BURST_SIZE", 100),
            request_timeout_seconds: env_number("REQUEST_TIMEOUT_SECONDS", 30),
            max_body_bytes: env_number("MAX_BODY_BYTES", 1_048_576),
            database_url: read_env("DATABASE_URL"),
            db_pool_max_connections: env_number("DB_POOL_MAX_CONNECTIONS", 5),
            db_pool_min_connections: env_number("DB_POOL_MIN_CONNECTIONS", 1),
            db_pool_acquire_timeout_seconds: env_number("DB_POOL_ACQUIRE_TIMEOUT_SECONDS", 5),
            db_pool_idle_timeout_seconds: env_number("DB_POOL_IDLE_TIMEOUT_SECONDS", 600),
            auth_jwt_secret: read_env("AUTH_JWT_SECRET"),
            report_ttl_days: env_number("REPORT_TTL_DAYS", 30),
            report_sweep_interval_seconds: env_number("REPORT_SWEEP_INTERVAL_SECONDS", 86_400),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    // Production never honors the identity override headers, whatever the
    // environment says.
    pub fn auth_dev_overrides_enabled(&self) -> bool {
        !self.is_production() && self.dev_auth_overrides_enabled
    }
}

fn read_env(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_string(key: &str, default: &str) -> String {
    read_env(key).unwrap_or_else(|| default.to_string())
}

fn env_number<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match read_env(key) {
        Some(raw) => raw.parse().unwrap_or(default),
        None => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    let Some(raw) = read_env(key) else {
        return default;
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|item| {
            let trimmed = item.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

// An empty prefix mounts the API at the root.
fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_prefix, split_csv};

    #[test]
    fn normalizes_prefix() {
        assert_eq!(normalize_prefix("api"), "/api");
        assert_eq!(normalize_prefix("/api/"), "/api");
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
    }

    #[test]
    fn splits_and_trims_csv() {
        assert_eq!(
            split_csv("localhost, 127.0.0.1 ,,api.voltora.in"),
            vec!["localhost", "127.0.0.1", "api.voltora.in"]
        );
        assert!(split_csv("  ").is_empty());
    }
}
