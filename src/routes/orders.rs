use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    auth::{require_admin, require_user},
    error::{AppError, AppResult},
    repository::table_service::{count_rows, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, AdminOrdersQuery, AppQuery, OwnOrdersQuery, UpdateOrderStatusInput,
    },
    services::{audit::write_audit_log, report_filters::resolve_window},
    state::AppState,
};

/// Fulfilment pipeline in order. A status may only advance to the next
/// stage; delivered and cancelled are terminal.
const ORDER_FLOW: &[&str] = &["pending", "confirmed", "processing", "shipped", "delivered"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/orders", axum::routing::get(my_orders))
        .route("/admin/orders", axum::routing::get(list_orders))
        .route("/admin/orders/{order_id}", axum::routing::get(get_order))
        .route(
            "/admin/orders/{order_id}/status",
            axum::routing::patch(update_order_status),
        )
}

async fn my_orders(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<OwnOrdersQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers)?;
    let pool = db_pool(&state)?;

    let filters = json_map(&[("user_id", Value::String(user.id.clone()))]);
    let orders = list_rows(
        pool,
        "orders",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({"success": true, "orders": orders})))
}

async fn list_orders(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<AdminOrdersQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let window = resolve_window(query.date_from.as_deref(), query.date_to.as_deref())?;
    let mut filters = Map::new();
    window.apply(&mut filters, "created_at");
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("order_status".to_string(), Value::String(status.to_string()));
    }
    if let Some(method) = non_empty_opt(query.payment_method.as_deref()) {
        filters.insert(
            "payment_method".to_string(),
            Value::String(method.to_string()),
        );
    }

    let limit = clamp_limit_in_range(query.limit, 1, 100);
    let page = query.page.max(1);
    let offset = (page - 1) * limit;

    let total = count_rows(pool, "orders", Some(&filters)).await?;
    let orders = list_rows(
        pool,
        "orders",
        Some(&filters),
        limit,
        offset,
        "created_at",
        false,
    )
    .await?;

    let total_pages = if total == 0 { 0 } else { (total + limit - 1) / limit };
    Ok(Json(json!({
        "success": true,
        "orders": orders,
        "total": total,
        "currentPage": page,
        "totalPages": total_pages,
    })))
}

async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let mut order = get_row(pool, "orders", &order_id, "id").await?;

    // The customer row may be gone; the order still renders without it.
    let user_id = value_str(&order, "user_id");
    let customer = if user_id.is_empty() {
        Value::Null
    } else {
        match get_row(pool, "users", &user_id, "id").await {
            Ok(user) => json!({
                "id": user_id,
                "name": value_str(&user, "name"),
                "email": value_str(&user, "email"),
                "phone": value_str(&user, "phone"),
            }),
            Err(AppError::NotFound(_)) => Value::Null,
            Err(error) => return Err(error),
        }
    };
    if let Some(map) = order.as_object_mut() {
        map.insert("customer".to_string(), customer);
    }

    Ok(Json(json!({"success": true, "order": order})))
}

async fn update_order_status(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    headers: HeaderMap,
    Json(input): Json<UpdateOrderStatusInput>,
) -> AppResult<Json<Value>> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let existing = get_row(pool, "orders", &order_id, "id").await?;
    let current = value_str(&existing, "order_status");
    let next = input.status.trim().to_lowercase();

    if !transition_allowed(&current, &next) {
        return Err(AppError::BadRequest(format!(
            "Cannot change order status from '{current}' to '{next}'."
        )));
    }

    let mut patch = Map::new();
    patch.insert("order_status".to_string(), Value::String(next.clone()));
    if next == "delivered" {
        patch.insert(
            "delivered_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
    }

    let updated = update_row(pool, "orders", &order_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&admin.id),
        "order.status",
        "orders",
        Some(&order_id),
        Some(json!({"from": current, "to": next})),
    )
    .await;

    Ok(Json(json!({"success": true, "order": updated})))
}

fn transition_allowed(current: &str, next: &str) -> bool {
    if next == "cancelled" {
        return !matches!(current, "delivered" | "cancelled") && stage_index(current).is_some();
    }
    let (Some(current_stage), Some(next_stage)) = (stage_index(current), stage_index(next)) else {
        return false;
    };
    next_stage == current_stage + 1
}

fn stage_index(status: &str) -> Option<usize> {
    ORDER_FLOW.iter().position(|stage| *stage == status)
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state
        .db_pool
        .as_ref()
        .ok_or_else(|| AppError::Dependency("DATABASE_URL is not configured.".to_string()))
}

fn value_str(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn non_empty_opt(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|item| !item.is_empty())
}

fn json_map(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}
