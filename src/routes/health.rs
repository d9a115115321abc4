use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;

use crate::state::AppState;

const DB_PING_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let db_ok = match &state.db_pool {
        Some(pool) => database_reachable(pool).await,
        // No DB configured; report healthy so the process can still serve.
        None => true,
    };

    Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "app": state.config.app_name,
        "environment": state.config.environment,
        "version": env!("CARGO_PKG_VERSION"),
        "now": Utc::now().to_rfc3339(),
        "db": db_ok
    }))
}

pub async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "success": true,
        "message": format!("{} is running", state.config.app_name),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// Bounded ping so the healthcheck answers quickly even when the first
// connection hangs on DNS or TLS.
async fn database_reachable(pool: &sqlx::PgPool) -> bool {
    match tokio::time::timeout(DB_PING_TIMEOUT, sqlx::query("SELECT 1").fetch_one(pool)).await {
        Ok(Ok(_)) => true,
        Ok(Err(error)) => {
            tracing::error!(error = %error, "Health check DB query failed");
            false
        }
        Err(_) => {
            tracing::error!("Health check DB query timed out");
            false
        }
    }
}
