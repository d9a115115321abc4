use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_admin,
    auth::require_user,
    error::{AppError, AppResult},
    repository::{
        table_service::{get_row, list_rows, update_row},
        user_rollup::SPEND_STATUSES_USERS,
    },
    schemas::{clamp_limit_in_range, AdminUsersQuery, AppQuery, UpdateUserStatusInput},
    services::{
        account_status::{present_user, AccountStatus},
        audit::write_audit_log,
    },
    state::AppState,
};

const FETCH_LIMIT: i64 = 20000;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/me", axum::routing::get(me))
        .route("/admin/users", axum::routing::get(list_users))
        .route("/admin/users/{user_id}", axum::routing::get(get_user))
        .route(
            "/admin/users/{user_id}/status",
            axum::routing::patch(update_user_status),
        )
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers)?;
    let pool = db_pool(&state)?;

    let row = get_row(pool, "users", &user.id, "id").await?;
    Ok(Json(json!({
        "success": true,
        "user": present_user(row, Utc::now()),
    })))
}

async fn list_users(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<AdminUsersQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(role) = non_empty_opt(query.role.as_deref()) {
        filters.insert("role".to_string(), Value::String(role.to_string()));
    }

    let rows = list_rows(
        pool,
        "users",
        Some(&filters),
        FETCH_LIMIT,
        0,
        "created_at",
        false,
    )
    .await?;

    let now = Utc::now();
    let mut users: Vec<Value> = rows.into_iter().map(|row| present_user(row, now)).collect();

    if let Some(search) = non_empty_opt(query.search.as_deref()) {
        let needle = search.to_lowercase();
        users.retain(|user| {
            value_str(user, "name").to_lowercase().contains(&needle)
                || value_str(user, "email").to_lowercase().contains(&needle)
        });
    }
    if let Some(status) = non_empty_opt(query.account_status.as_deref()) {
        let Some(wanted) = AccountStatus::parse(status) else {
            return Err(AppError::BadRequest(format!(
                "Unknown account status '{status}'."
            )));
        };
        users.retain(|user| value_str(user, "actual_status") == wanted.as_str());
    }

    let limit = clamp_limit_in_range(query.limit, 1, 100);
    let page = query.page.max(1);
    let total = users.len() as i64;
    let total_pages = if total == 0 { 0 } else { (total + limit - 1) / limit };
    let start = ((page - 1) * limit) as usize;
    let page_users: Vec<Value> = if start >= users.len() {
        Vec::new()
    } else {
        users.into_iter().skip(start).take(limit as usize).collect()
    };

    Ok(Json(json!({
        "success": true,
        "users": page_users,
        "total": total,
        "currentPage": page,
        "totalPages": total_pages,
    })))
}

async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let row = get_row(pool, "users", &user_id, "id").await?;
    let mut user = present_user(row, Utc::now());

    let filters = json_map(&[("user_id", Value::String(user_id.clone()))]);
    let orders = list_rows(
        pool,
        "orders",
        Some(&filters),
        FETCH_LIMIT,
        0,
        "created_at",
        false,
    )
    .await?;

    let mut total_spent = 0.0;
    for order in &orders {
        let status = value_str(order, "order_status");
        if SPEND_STATUSES_USERS.contains(&status.as_str()) {
            total_spent += number_from_value(order.get("total_amount"));
        }
    }
    let last_order = orders
        .first()
        .map(|order| value_str(order, "created_at"))
        .filter(|stamp| !stamp.is_empty());

    if let Some(map) = user.as_object_mut() {
        map.insert("total_orders".to_string(), json!(orders.len()));
        map.insert("total_amount_spent".to_string(), json!(round2(total_spent)));
        map.insert(
            "last_order".to_string(),
            last_order.map(Value::String).unwrap_or(Value::Null),
        );
    }

    Ok(Json(json!({"success": true, "user": user})))
}

async fn update_user_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    Json(input): Json<UpdateUserStatusInput>,
) -> AppResult<Json<Value>> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let existing = get_row(pool, "users", &user_id, "id").await?;
    let patch = build_status_patch(&input, &admin.id, Utc::now())?;
    let updated = update_row(pool, "users", &user_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&admin.id),
        "user.status",
        "users",
        Some(&user_id),
        Some(json!({
            "from": value_str(&existing, "status"),
            "to": value_str(&updated, "status"),
            "reason": input.reason,
        })),
    )
    .await;

    Ok(Json(json!({
        "success": true,
        "user": present_user(updated, Utc::now()),
    })))
}

/// ACTIVE wipes the suspension bookkeeping; SUSPENDED demands a future
/// expiry; INACTIVE is derived, never stored.
fn build_status_patch(
    input: &UpdateUserStatusInput,
    admin_id: &str,
    now: DateTime<Utc>,
) -> AppResult<Map<String, Value>> {
    let Some(status) = AccountStatus::parse(&input.status) else {
        return Err(AppError::BadRequest(format!(
            "Unknown account status '{}'.",
            input.status
        )));
    };
    if status == AccountStatus::Inactive {
        return Err(AppError::BadRequest(
            "INACTIVE is derived from login activity and cannot be set.".to_string(),
        ));
    }

    let mut patch = Map::new();
    patch.insert(
        "status".to_string(),
        Value::String(status.as_str().to_string()),
    );
    patch.insert(
        "status_changed_by".to_string(),
        Value::String(admin_id.to_string()),
    );
    patch.insert(
        "status_changed_at".to_string(),
        Value::String(now.to_rfc3339()),
    );

    let reason = input
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match status {
        AccountStatus::Active => {
            patch.insert("suspension_until".to_string(), Value::Null);
            patch.insert("status_reason".to_string(), Value::Null);
        }
        AccountStatus::Suspended => {
            let Some(raw) = input
                .suspension_until
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
            else {
                return Err(AppError::BadRequest(
                    "suspensionUntil is required when suspending.".to_string(),
                ));
            };
            let until = DateTime::parse_from_rfc3339(raw)
                .map_err(|_| {
                    AppError::BadRequest(
                        "suspensionUntil must be an RFC 3339 timestamp.".to_string(),
                    )
                })?
                .with_timezone(&Utc);
            if until <= now {
                return Err(AppError::BadRequest(
                    "suspensionUntil must be in the future.".to_string(),
                ));
            }
            patch.insert(
                "suspension_until".to_string(),
                Value::String(until.to_rfc3339()),
            );
            if let Some(reason) = reason {
                patch.insert(
                    "status_reason".to_string(),
                    Value::String(reason.to_string()),
                );
            }
        }
        AccountStatus::Blocked => {
            if let Some(reason) = reason {
                patch.insert(
                    "status_reason".to_string(),
                    Value::String(reason.to_string()),
                );
            }
        }
        AccountStatus::Inactive => unreachable!("rejected above"),
    }

    Ok(patch)
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

fn number_from_value(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
        Some(Value::String(raw)) => raw.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn json_map(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
