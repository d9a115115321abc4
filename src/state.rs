use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
}

impl AppState {
    // The pool connects lazily; a missing DATABASE_URL leaves the app
    // serving 503s from data endpoints instead of failing startup.
    pub fn build(config: AppConfig) -> Result<Self, sqlx::Error> {
        let db_pool = match &config.database_url {
            Some(url) => Some(
                PgPoolOptions::new()
                    .max_connections(config.db_pool_max_connections)
                    .min_connections(config.db_pool_min_connections)
                    .acquire_timeout(Duration::from_secs(config.db_pool_acquire_timeout_seconds))
                    .idle_timeout(Duration::from_secs(config.db_pool_idle_timeout_seconds))
                    .connect_lazy(url)?,
            ),
            None => None,
        };

        Ok(Self {
            config: Arc::new(config),
            db_pool,
        })
    }
}
