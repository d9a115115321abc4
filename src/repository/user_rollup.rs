use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};

use crate::error::AppError;
use crate::repository::table_service;

/// Order statuses that count toward a user's lifetime spend. The customer
/// report applies a wider rule (everything but cancelled); the two are
/// intentionally separate.
pub const SPEND_STATUSES_USERS: &[&str] = &["delivered"];

#[derive(Debug, Clone, Default)]
pub struct UserRollupFilters {
    pub roles: Vec<String>,
    pub search: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub min_orders: Option<i64>,
    pub max_orders: Option<i64>,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
}

/// Users joined to their per-user order aggregate: order count, delivered
/// spend, last order timestamp. The select list never includes
/// password_hash, and account-status filtering is left to the caller so the
/// derivation lives in exactly one place.
pub fn build_rollup_query(filters: &UserRollupFilters) -> QueryBuilder<'static, Postgres> {
    let spend_statuses = SPEND_STATUSES_USERS
        .iter()
        .map(|status| status.to_string())
        .collect::<Vec<_>>();

    let mut query = QueryBuilder::<Postgres>::new(
        "SELECT row_to_json(t) AS row FROM (\
         SELECT u.id, u.name, u.email, u.phone, u.address, u.role, u.status, \
         u.status_reason, u.status_changed_at, u.suspension_until, u.last_login_at, \
         u.created_at, \
         COALESCE(o.total_orders, 0) AS total_orders, \
         COALESCE(o.total_amount_spent, 0) AS total_amount_spent, \
         o.last_order \
         FROM users u \
         LEFT JOIN (\
         SELECT user_id, COUNT(*) AS total_orders, \
         COALESCE(SUM(total_amount) FILTER (WHERE order_status = ANY(",
    );
    query.push_bind(spend_statuses);
    query.push(
        ")), 0) AS total_amount_spent, \
         MAX(created_at) AS last_order \
         FROM orders GROUP BY user_id\
         ) o ON o.user_id = u.id \
         WHERE u.role = ANY(",
    );
    query.push_bind(filters.roles.clone());
    query.push(")");

    if let Some(search) = filters
        .search
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
    {
        let pattern = format!("%{search}%");
        query
            .push(" AND (u.name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR u.email ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(date_from) = filters.date_from {
        query.push(" AND u.created_at >= ").push_bind(date_from);
    }
    if let Some(date_to) = filters.date_to {
        query.push(" AND u.created_at <= ").push_bind(date_to);
    }
    if let Some(min_orders) = filters.min_orders {
        query
            .push(" AND COALESCE(o.total_orders, 0) >= ")
            .push_bind(min_orders);
    }
    if let Some(max_orders) = filters.max_orders {
        query
            .push(" AND COALESCE(o.total_orders, 0) <= ")
            .push_bind(max_orders);
    }
    if let Some(min_amount) = filters.min_amount {
        query
            .push(" AND COALESCE(o.total_amount_spent, 0) >= ")
            .push_bind(min_amount);
    }
    if let Some(max_amount) = filters.max_amount {
        query
            .push(" AND COALESCE(o.total_amount_spent, 0) <= ")
            .push_bind(max_amount);
    }

    query.push(" ORDER BY u.created_at DESC) t");
    query
}

pub async fn fetch_user_rollup(
    pool: &sqlx::PgPool,
    filters: &UserRollupFilters,
) -> Result<Vec<Value>, AppError> {
    let mut query = build_rollup_query(filters);
    let rows = query
        .build()
        .fetch_all(pool)
        .await
        .map_err(table_service::map_db_error)?;
    Ok(table_service::read_rows(rows))
}

#[cfg(test)]
mod tests {
    use super::{build_rollup_query, UserRollupFilters};
    use chrono::{TimeZone, Utc};

    fn customer_filters() -> UserRollupFilters {
        UserRollupFilters {
            roles: vec!["customer".to_string(), "user".to_string()],
            ..UserRollupFilters::default()
        }
    }

    #[test]
    fn spend_total_is_delivered_only() {
        let query = build_rollup_query(&customer_filters());
        let sql = query.sql();
        assert!(
            sql.contains("SUM(total_amount) FILTER (WHERE order_status = ANY("),
            "got: {sql}"
        );
        assert!(sql.contains("COUNT(*) AS total_orders"), "got: {sql}");
        assert!(sql.contains("MAX(created_at) AS last_order"), "got: {sql}");
    }

    #[test]
    fn password_hash_is_never_selected() {
        let query = build_rollup_query(&customer_filters());
        assert!(!query.sql().contains("password"));
    }

    #[test]
    fn orders_newest_users_first() {
        let query = build_rollup_query(&customer_filters());
        assert!(query.sql().contains("ORDER BY u.created_at DESC"));
    }

    #[test]
    fn aggregate_thresholds_are_bound() {
        let filters = UserRollupFilters {
            roles: vec!["customer".to_string()],
            date_from: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().expect("valid")),
            date_to: Some(Utc.with_ymd_and_hms(2025, 6, 30, 23, 59, 59).single().expect("valid")),
            min_orders: Some(2),
            max_orders: Some(50),
            min_amount: Some(1000.0),
            max_amount: Some(90000.0),
            ..UserRollupFilters::default()
        };
        let query = build_rollup_query(&filters);
        let sql = query.sql();
        assert!(sql.contains("u.created_at >= "), "got: {sql}");
        assert!(sql.contains("u.created_at <= "), "got: {sql}");
        assert!(sql.contains("COALESCE(o.total_orders, 0) >= "), "got: {sql}");
        assert!(sql.contains("COALESCE(o.total_orders, 0) <= "), "got: {sql}");
        assert!(
            sql.contains("COALESCE(o.total_amount_spent, 0) >= "),
            "got: {sql}"
        );
        assert!(
            sql.contains("COALESCE(o.total_amount_spent, 0) <= "),
            "got: {sql}"
        );
    }

    #[test]
    fn search_matches_name_or_email() {
        let filters = UserRollupFilters {
            search: Some("asha".to_string()),
            ..customer_filters()
        };
        let query = build_rollup_query(&filters);
        let sql = query.sql();
        assert!(
            sql.contains("(u.name ILIKE ") && sql.contains(" OR u.email ILIKE "),
            "got: {sql}"
        );

        let blank = UserRollupFilters {
            search: Some("   ".to_string()),
            ..customer_filters()
        };
        assert!(!build_rollup_query(&blank).sql().contains("ILIKE"));
    }

    #[test]
    fn unfiltered_query_keeps_role_clause_only() {
        let query = build_rollup_query(&customer_filters());
        let sql = query.sql();
        assert!(sql.contains("WHERE u.role = ANY("), "got: {sql}");
        assert!(!sql.contains("total_orders, 0) >="), "got: {sql}");
    }
}
