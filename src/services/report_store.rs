use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use sqlx::{Postgres, QueryBuilder};

use crate::error::AppError;
use crate::repository::table_service;
use crate::schemas::remove_nulls;
use crate::state::AppState;

pub const REPORT_TYPES: &[&str] = &["sales", "orders", "payments", "stock", "customers", "users"];

pub fn validate_report_type(report_type: &str) -> Result<&str, AppError> {
    let normalized = report_type.trim();
    if REPORT_TYPES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::BadRequest(format!(
        "Unknown report type '{normalized}'."
    )))
}

/// Stores one report snapshot and returns the inserted row.
pub async fn save_report(
    pool: &sqlx::PgPool,
    report_type: &str,
    summary: Value,
    data: Value,
    filters: Map<String, Value>,
    record_count: i64,
    generated_by: Option<&str>,
    ttl_days: i64,
) -> Result<Value, AppError> {
    let report_type = validate_report_type(report_type)?;
    let payload = snapshot_payload(
        report_type,
        summary,
        data,
        filters,
        record_count,
        generated_by,
        ttl_days,
        Utc::now(),
    );
    table_service::create_row(pool, "generated_reports", &payload).await
}

/// Fire-and-forget snapshot save. The task owns its error handling; the
/// calling handler has usually responded before it finishes.
pub fn save_report_detached(
    state: &AppState,
    report_type: &str,
    summary: Value,
    data: Value,
    filters: Map<String, Value>,
    record_count: i64,
    generated_by: Option<String>,
) {
    let Some(pool) = state.db_pool.clone() else {
        return;
    };
    let ttl_days = state.config.report_ttl_days;
    let report_type = report_type.to_string();
    tokio::spawn(async move {
        if let Err(error) = save_report(
            &pool,
            &report_type,
            summary,
            data,
            filters,
            record_count,
            generated_by.as_deref(),
            ttl_days,
        )
        .await
        {
            tracing::error!(
                report_type = %report_type,
                error = %error,
                "Detached report snapshot save failed"
            );
        }
    });
}

/// Recent snapshots for one type, newest first, without the (often large)
/// data payload.
pub async fn get_history(
    pool: &sqlx::PgPool,
    report_type: &str,
    limit: i64,
) -> Result<Vec<Value>, AppError> {
    let report_type = validate_report_type(report_type)?;
    let mut query = build_history_query(report_type, limit.clamp(1, 50));
    let rows = query
        .build()
        .fetch_all(pool)
        .await
        .map_err(table_service::map_db_error)?;
    Ok(table_service::read_rows(rows))
}

/// Newest snapshot whose stored filters equal the given ones exactly
/// (after null stripping). jsonb equality ignores key order.
#[allow(dead_code)]
pub async fn get_latest(
    pool: &sqlx::PgPool,
    report_type: &str,
    filters: Map<String, Value>,
) -> Result<Option<Value>, AppError> {
    let report_type = validate_report_type(report_type)?;
    let mut query = build_latest_query(report_type, remove_nulls(filters));
    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(table_service::map_db_error)?;
    Ok(row.and_then(|value| {
        sqlx::Row::try_get::<Option<Value>, _>(&value, "row")
            .ok()
            .flatten()
    }))
}

/// Manual maintenance: drop snapshots generated before the cutoff.
pub async fn cleanup_old_reports(pool: &sqlx::PgPool, days_old: i64) -> Result<u64, AppError> {
    let cutoff = Utc::now() - Duration::days(days_old.max(1));
    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM generated_reports WHERE generated_at < ");
    query.push_bind(cutoff);
    let result = query
        .build()
        .execute(pool)
        .await
        .map_err(table_service::map_db_error)?;
    Ok(result.rows_affected())
}

/// TTL sweep, run daily by the scheduler.
pub async fn purge_expired(pool: &sqlx::PgPool) -> Result<u64, AppError> {
    let result = sqlx::query(
        "DELETE FROM generated_reports WHERE expires_at IS NOT NULL AND expires_at <= now()",
    )
    .execute(pool)
    .await
    .map_err(table_service::map_db_error)?;
    Ok(result.rows_affected())
}

#[allow(clippy::too_many_arguments)]
fn snapshot_payload(
    report_type: &str,
    summary: Value,
    data: Value,
    filters: Map<String, Value>,
    record_count: i64,
    generated_by: Option<&str>,
    ttl_days: i64,
    generated_at: DateTime<Utc>,
) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("report_type".to_string(), json!(report_type));
    payload.insert("summary".to_string(), summary);
    payload.insert("data".to_string(), data);
    payload.insert(
        "filters".to_string(),
        Value::Object(remove_nulls(filters)),
    );
    payload.insert("record_count".to_string(), json!(record_count));
    if let Some(user_id) = generated_by {
        payload.insert("generated_by".to_string(), json!(user_id));
    }
    payload.insert("generated_at".to_string(), json!(generated_at.to_rfc3339()));
    payload.insert(
        "expires_at".to_string(),
        json!((generated_at + Duration::days(ttl_days.max(1))).to_rfc3339()),
    );
    payload
}

fn build_history_query(report_type: &str, limit: i64) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::<Postgres>::new(
        "SELECT row_to_json(t) AS row FROM (\
         SELECT id, report_type, summary, filters, record_count, generated_by, \
         generated_at, expires_at \
         FROM generated_reports WHERE report_type = ",
    );
    query.push_bind(report_type.to_string());
    query.push(" ORDER BY generated_at DESC LIMIT ");
    query.push_bind(limit);
    query.push(") t");
    query
}

fn build_latest_query(
    report_type: &str,
    filters: Map<String, Value>,
) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::<Postgres>::new(
        "SELECT row_to_json(t) AS row FROM generated_reports t WHERE t.report_type = ",
    );
    query.push_bind(report_type.to_string());
    query.push(" AND t.filters = ");
    query.push_bind(Value::Object(filters));
    query.push(" ORDER BY t.generated_at DESC LIMIT 1");
    query
}

#[cfg(test)]
mod tests {
    use super::{
        build_history_query, build_latest_query, save_report_detached, snapshot_payload,
        validate_report_type,
    };
    use crate::config::AppConfig;
    use crate::state::AppState;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Map, Value};

    #[test]
    fn rejects_unknown_report_types() {
        assert!(validate_report_type("sales").is_ok());
        assert!(validate_report_type(" users ").is_ok());
        assert!(validate_report_type("inventory").is_err());
        assert!(validate_report_type("").is_err());
    }

    #[test]
    fn snapshot_strips_null_filters_and_sets_expiry() {
        let mut filters = Map::new();
        filters.insert("status".to_string(), json!("delivered"));
        filters.insert("min_amount".to_string(), Value::Null);

        let generated_at = Utc
            .with_ymd_and_hms(2025, 5, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp");
        let payload = snapshot_payload(
            "sales",
            json!({"totalSales": 2}),
            json!([]),
            filters,
            2,
            Some("3f3d13a8-6d67-4a43-a9a0-222222222222"),
            30,
            generated_at,
        );

        let stored_filters = payload["filters"].as_object().expect("filters object");
        assert!(stored_filters.contains_key("status"));
        assert!(!stored_filters.contains_key("min_amount"));
        assert_eq!(
            payload["expires_at"],
            json!("2025-05-31T09:00:00+00:00")
        );
        assert_eq!(payload["record_count"], json!(2));
    }

    #[test]
    fn history_query_skips_data_column() {
        let query = build_history_query("sales", 10);
        let sql = query.sql();
        assert!(
            sql.contains("SELECT id, report_type, summary, filters, record_count"),
            "got: {sql}"
        );
        assert!(!sql.contains(", data"), "data must stay out of history: {sql}");
        assert!(sql.contains("ORDER BY generated_at DESC"), "got: {sql}");
    }

    #[test]
    fn detached_save_never_touches_the_caller() {
        let mut config = AppConfig::from_env();
        config.database_url = None;
        let state = AppState::build(config).expect("state without a pool");

        // Without a pool there is nothing to save; the call must return
        // immediately rather than error or panic, because report handlers
        // have already committed to a success response by this point.
        save_report_detached(
            &state,
            "sales",
            json!({"totalSales": 0}),
            json!([]),
            Map::new(),
            0,
            None,
        );
    }

    #[test]
    fn latest_query_matches_filters_exactly() {
        let mut filters = Map::new();
        filters.insert("status".to_string(), json!("delivered"));
        let query = build_latest_query("sales", filters);
        let sql = query.sql();
        assert!(sql.contains("t.filters = "), "got: {sql}");
        assert!(sql.contains("LIMIT 1"), "got: {sql}");
    }
}
