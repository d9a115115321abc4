use axum::{
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

pub mod health;
pub mod messages;
pub mod orders;
pub mod products;
pub mod reports;
pub mod users;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .merge(products::router())
        .merge(orders::router())
        .merge(users::router())
        .merge(messages::router())
        .merge(reports::router())
        .fallback(not_found)
}

async fn not_found() -> (axum::http::StatusCode, Json<Value>) {
    (
        axum::http::StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "message": "Route not found.",
            "error": "Route not found.",
        })),
    )
}
