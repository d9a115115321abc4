use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::{require_admin, require_user},
    error::{AppError, AppResult},
    repository::table_service::{count_rows, create_row, get_row, list_rows, update_row},
    schemas::{clamp_limit, validate_input, AppQuery, MessagesQuery, SendMessageInput},
    services::audit::write_audit_log,
    state::AppState,
};

const MESSAGE_CATEGORIES: &[&str] = &["Info", "Warning", "Issue", "Summary"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/admin/messages", axum::routing::post(send_message))
        .route("/messages", axum::routing::get(my_messages))
        .route(
            "/messages/{message_id}/read",
            axum::routing::patch(mark_message_read),
        )
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<SendMessageInput>,
) -> AppResult<impl IntoResponse> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;
    validate_input(&input)?;

    let Some(category) = normalize_category(&input.category) else {
        return Err(AppError::BadRequest(format!(
            "category must be one of {}.",
            MESSAGE_CATEGORIES.join(", ")
        )));
    };

    // 404s when the recipient does not exist.
    get_row(pool, "users", &input.user_id, "id").await?;

    let mut record = Map::new();
    record.insert("user_id".to_string(), json!(input.user_id));
    record.insert("sent_by".to_string(), json!(admin.id));
    record.insert("title".to_string(), json!(input.title.trim()));
    record.insert("message".to_string(), json!(input.message.trim()));
    record.insert("category".to_string(), json!(category));
    if let Some(order_id) = input.order_id.as_deref().filter(|id| !id.trim().is_empty()) {
        record.insert("order_id".to_string(), json!(order_id));
    }
    record.insert("is_read".to_string(), json!(false));

    let created = create_row(pool, "report_messages", &record).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&admin.id),
        "message.send",
        "report_messages",
        created.get("id").and_then(Value::as_str),
        Some(json!({"user_id": input.user_id, "category": category})),
    )
    .await;

    Ok((StatusCode::CREATED, Json(json!({"success": true, "data": created}))))
}

async fn my_messages(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<MessagesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers)?;
    let pool = db_pool(&state)?;

    let filters = json_map(&[("user_id", json!(user.id))]);
    let messages = list_rows(
        pool,
        "report_messages",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "created_at",
        false,
    )
    .await?;

    let unread_filters = json_map(&[("user_id", json!(user.id)), ("is_read", json!(false))]);
    let unread = count_rows(pool, "report_messages", Some(&unread_filters)).await?;

    Ok(Json(json!({
        "success": true,
        "messages": messages,
        "unreadCount": unread,
    })))
}

async fn mark_message_read(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers)?;
    let pool = db_pool(&state)?;

    let message = get_row(pool, "report_messages", &message_id, "id").await?;
    // Owned messages only. Everyone else sees the same 404 as a missing row.
    if message.get("user_id").and_then(Value::as_str) != Some(user.id.as_str()) {
        return Err(AppError::NotFound("Message not found.".to_string()));
    }

    let patch = json_map(&[("is_read", json!(true))]);
    let updated = update_row(pool, "report_messages", &message_id, &patch, "id").await?;

    Ok(Json(json!({"success": true, "data": updated})))
}

fn normalize_category(raw: &str) -> Option<&'static str> {
    MESSAGE_CATEGORIES
        .iter()
        .find(|known| known.eq_ignore_ascii_case(raw.trim()))
        .copied()
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state
        .db_pool
        .as_ref()
        .ok_or_else(|| AppError::Dependency("DATABASE_URL is not configured.".to_string()))
}

fn json_map(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::normalize_category;

    #[test]
    fn categories_match_case_insensitively() {
        assert_eq!(normalize_category("Info"), Some("Info"));
        assert_eq!(normalize_category("warning"), Some("Warning"));
        assert_eq!(normalize_category("  ISSUE "), Some("Issue"));
        assert_eq!(normalize_category("summary"), Some("Summary"));
    }

    #[test]
    fn unknown_categories_are_rejected() {
        assert_eq!(normalize_category("Urgent"), None);
        assert_eq!(normalize_category(""), None);
    }
}
