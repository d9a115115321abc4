use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, Postgres, QueryBuilder, Row};

use crate::error::AppError;

/// Tables the dynamic query layer may touch. Anything else is refused
/// before SQL is built.
const ALLOWED_TABLES: &[&str] = &[
    "audit_logs",
    "generated_reports",
    "orders",
    "products",
    "report_messages",
    "users",
];

const MAX_FETCH: i64 = 20000;

pub async fn list_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError> {
    let table_name = validate_table(table)?;
    let order_name = if order_by.trim().is_empty() {
        "created_at"
    } else {
        validate_identifier(order_by)?
    };

    let mut query = select_query(table_name, filters)?;
    query
        .push(" ORDER BY t.")
        .push(order_name)
        .push(if ascending { " ASC" } else { " DESC" })
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, MAX_FETCH))
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(read_rows(rows))
}

pub async fn get_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE ");
    push_id_predicate(&mut query, id_name, row_id);
    query.push(" LIMIT 1");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    json_column(row).ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn create_row(
    pool: &sqlx::PgPool,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} record."
        )));
    }
    let columns = sorted_columns(payload)?;

    let mut query = insert_query(table_name, &columns, Value::Object(payload.clone()));
    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    json_column(row)
        .ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

pub async fn update_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }
    let columns = sorted_columns(payload)?;

    let mut query = update_query(table_name, &columns, Value::Object(payload.clone()));
    query.push(" WHERE ");
    push_id_predicate(&mut query, id_name, row_id);
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    json_column(row).ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn delete_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let existing = get_row(pool, table, row_id, id_field).await?;
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(table_name).push(" t WHERE ");
    push_id_predicate(&mut query, id_name, row_id);
    query.build().execute(pool).await.map_err(map_db_error)?;

    Ok(existing)
}

pub async fn count_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
) -> Result<i64, AppError> {
    let table_name = validate_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            apply_filter(&mut query, key, value)?;
        }
    }

    let row = query.build().fetch_one(pool).await.map_err(map_db_error)?;
    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

pub(crate) fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

pub(crate) fn map_db_error(error: sqlx::Error) -> AppError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    if message.contains("23505")
        || message
            .to_ascii_lowercase()
            .contains("duplicate key value violates unique constraint")
    {
        return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
    }
    // The driver message is kept in the error body. Admin tooling reads it.
    AppError::Internal(format!("Database operation failed: {message}"))
}

fn json_column(row: Option<PgRow>) -> Option<Value> {
    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
}

fn select_query(
    table_name: &str,
    filters: Option<&Map<String, Value>>,
) -> Result<QueryBuilder<'static, Postgres>, AppError> {
    let mut query = QueryBuilder::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            apply_filter(&mut query, key, value)?;
        }
    }
    Ok(query)
}

// jsonb_populate_record lets PostgreSQL resolve column types (uuid,
// boolean, numeric, jsonb) from the table definition, so callers hand
// over plain JSON without knowing the schema.
fn insert_query(
    table_name: &str,
    columns: &[String],
    record: Value,
) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new("INSERT INTO ");
    query.push(table_name).push(" (");
    {
        let mut list = query.separated(", ");
        for column in columns {
            list.push(column.as_str());
        }
    }
    query.push(") SELECT ");
    {
        let mut list = query.separated(", ");
        for column in columns {
            list.push("r.");
            list.push_unseparated(column.as_str());
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(record);
    query
        .push(") r RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");
    query
}

fn update_query(
    table_name: &str,
    columns: &[String],
    record: Value,
) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    {
        let mut list = query.separated(", ");
        for column in columns {
            list.push(column.as_str());
            list.push_unseparated(" = r.");
            list.push_unseparated(column.as_str());
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(record);
    query.push(") r");
    query
}

fn sorted_columns(payload: &Map<String, Value>) -> Result<Vec<String>, AppError> {
    let mut columns = Vec::with_capacity(payload.len());
    for key in payload.keys() {
        columns.push(validate_identifier(key)?.to_string());
    }
    columns.sort_unstable();
    Ok(columns)
}

fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::Forbidden(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(
            "Identifier cannot be empty.".to_string(),
        ));
    }
    let mut chars = trimmed.chars();
    let head_ok = chars
        .next()
        .is_some_and(|first| first.is_ascii_lowercase() || first == '_');
    let tail_ok = chars.all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    });
    if head_ok && tail_ok {
        Ok(trimmed)
    } else {
        Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )))
    }
}

/// Comparison selected by the `column__op` filter-key suffix. A bare key
/// compares for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    ILike,
    IsNull,
    AnyOf,
}

impl Cmp {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "like" => Some(Self::Like),
            "ilike" => Some(Self::ILike),
            "is_null" => Some(Self::IsNull),
            "in" => Some(Self::AnyOf),
            _ => None,
        }
    }

    fn sql(self) -> &'static str {
        match self {
            Self::Eq | Self::AnyOf => " = ",
            Self::Gt => " > ",
            Self::Gte => " >= ",
            Self::Lt => " < ",
            Self::Lte => " <= ",
            Self::Like => " LIKE ",
            Self::ILike => " ILIKE ",
            Self::IsNull => " IS NULL",
        }
    }
}

// An unknown suffix is not an error; the whole key is taken as a column
// name, so tables may legitimately carry double underscores.
fn split_filter_key(filter_key: &str) -> Result<(&str, Cmp), AppError> {
    if let Some((column, suffix)) = filter_key.rsplit_once("__") {
        if let Some(cmp) = Cmp::from_suffix(suffix) {
            return Ok((validate_identifier(column)?, cmp));
        }
    }
    Ok((validate_identifier(filter_key)?, Cmp::Eq))
}

/// Typed value bound into the query. Guessing the wrong type is safe:
/// text comparisons go through a `::text` cast, so a value that fails the
/// uuid or date parse still produces a valid query that matches nothing.
#[derive(Debug, Clone)]
enum Bind {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    Int(i64),
    Float(f64),
    Day(NaiveDate),
    Stamp(DateTime<FixedOffset>),
}

impl Bind {
    fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Uuid(id) => id.to_string(),
            Self::Bool(flag) => flag.to_string(),
            Self::Int(number) => number.to_string(),
            Self::Float(number) => number.to_string(),
            Self::Day(day) => day.to_string(),
            Self::Stamp(stamp) => stamp.to_rfc3339(),
        }
    }
}

fn typed_bind(column: &str, value: &Value) -> Bind {
    match value {
        Value::Bool(flag) => Bind::Bool(*flag),
        Value::Number(number) => match (number.as_i64(), number.as_f64()) {
            (Some(int), _) => Bind::Int(int),
            (None, Some(float)) => Bind::Float(float),
            _ => Bind::Text(number.to_string()),
        },
        Value::String(text) => {
            let trimmed = text.trim();
            if uuid_typed_column(column) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    return Bind::Uuid(parsed);
                }
            }
            if timestamp_typed_column(column) {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                    return Bind::Stamp(parsed);
                }
            }
            if date_typed_column(column) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return Bind::Day(parsed);
                }
            }
            Bind::Text(text.clone())
        }
        _ => Bind::Text(loose_text(value)),
    }
}

fn loose_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn apply_filter(
    query: &mut QueryBuilder<Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, cmp) = split_filter_key(filter_key)?;

    if cmp == Cmp::IsNull {
        query
            .push(" AND t.")
            .push(column)
            .push(if truthy(value) { " IS NULL" } else { " IS NOT NULL" });
        return Ok(());
    }

    match value {
        // Null filter values are skipped, so optional query params can be
        // inserted unconditionally.
        Value::Null => Ok(()),
        Value::Array(items) => {
            if !matches!(cmp, Cmp::Eq | Cmp::AnyOf) {
                return Err(AppError::BadRequest(format!(
                    "Filter '{filter_key}' does not support array values."
                )));
            }
            if items.is_empty() {
                return Ok(());
            }
            query.push(" AND ");
            push_any_clause(query, column, items);
            Ok(())
        }
        _ => {
            query.push(" AND ");
            push_comparison(query, column, cmp, &typed_bind(column, value));
            Ok(())
        }
    }
}

fn push_comparison(query: &mut QueryBuilder<Postgres>, column: &str, cmp: Cmp, bind: &Bind) {
    query.push("t.").push(column);
    if matches!(cmp, Cmp::Like | Cmp::ILike) {
        query.push("::text").push(cmp.sql()).push_bind(bind.as_text());
        return;
    }
    if matches!(bind, Bind::Text(_)) {
        query.push("::text");
    }
    query.push(cmp.sql());
    match bind {
        Bind::Text(text) => query.push_bind(text.clone()),
        Bind::Uuid(id) => query.push_bind(*id),
        Bind::Bool(flag) => query.push_bind(*flag),
        Bind::Int(number) => query.push_bind(*number),
        Bind::Float(number) => query.push_bind(*number),
        Bind::Day(day) => query.push_bind(*day),
        Bind::Stamp(stamp) => query.push_bind(stamp.to_owned()),
    };
}

fn push_id_predicate(query: &mut QueryBuilder<Postgres>, column: &str, row_id: &str) {
    let bind = typed_bind(column, &Value::String(row_id.to_string()));
    push_comparison(query, column, Cmp::Eq, &bind);
}

// Homogeneous arrays bind as their native type; anything mixed falls back
// to a text comparison against the casted column.
fn push_any_clause(query: &mut QueryBuilder<Postgres>, column: &str, items: &[Value]) {
    if uuid_typed_column(column) {
        let ids = items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|text| uuid::Uuid::parse_str(text.trim()).ok())
            .collect::<Vec<_>>();
        if ids.len() == items.len() {
            query
                .push("t.")
                .push(column)
                .push(" = ANY(")
                .push_bind(ids)
                .push(")");
            return;
        }
    }

    if items.iter().all(|item| matches!(item, Value::Bool(_))) {
        let flags = items.iter().filter_map(Value::as_bool).collect::<Vec<_>>();
        query
            .push("t.")
            .push(column)
            .push(" = ANY(")
            .push_bind(flags)
            .push(")");
        return;
    }
    if items.iter().all(|item| item.as_i64().is_some()) {
        let numbers = items.iter().filter_map(Value::as_i64).collect::<Vec<_>>();
        query
            .push("t.")
            .push(column)
            .push(" = ANY(")
            .push_bind(numbers)
            .push(")");
        return;
    }
    if items.iter().all(|item| item.as_f64().is_some()) {
        let numbers = items.iter().filter_map(Value::as_f64).collect::<Vec<_>>();
        query
            .push("t.")
            .push(column)
            .push(" = ANY(")
            .push_bind(numbers)
            .push(")");
        return;
    }

    let texts = items.iter().map(loose_text).collect::<Vec<_>>();
    query
        .push("t.")
        .push(column)
        .push("::text = ANY(")
        .push_bind(texts)
        .push(")");
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|parsed| parsed != 0.0),
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "t" | "1" | "yes" | "y"
        ),
        _ => false,
    }
}

fn uuid_typed_column(column: &str) -> bool {
    column == "id" || column.ends_with("_id") || column.ends_with("_by")
}

fn date_typed_column(column: &str) -> bool {
    column.ends_with("_date") || column.ends_with("_on")
}

fn timestamp_typed_column(column: &str) -> bool {
    column.ends_with("_at") || column.ends_with("_until")
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};
    use sqlx::{Postgres, QueryBuilder};

    use super::{apply_filter, insert_query, split_filter_key, update_query, Cmp};

    fn builder() -> QueryBuilder<'static, Postgres> {
        QueryBuilder::new("SELECT row_to_json(t) AS row FROM orders t WHERE 1=1")
    }

    #[test]
    fn filter_suffixes_map_to_operators() {
        assert_eq!(
            split_filter_key("created_at__gte").expect("valid key"),
            ("created_at", Cmp::Gte)
        );
        assert_eq!(
            split_filter_key("order_number__ilike").expect("valid key"),
            ("order_number", Cmp::ILike)
        );
        assert_eq!(
            split_filter_key("status").expect("valid key"),
            ("status", Cmp::Eq)
        );
        assert_eq!(
            split_filter_key("weird__column").expect("unknown suffix is part of the name"),
            ("weird__column", Cmp::Eq)
        );
        assert!(split_filter_key("status; DROP TABLE users").is_err());
    }

    #[test]
    fn filter_clauses_render_expected_sql() {
        let mut query = builder();
        apply_filter(&mut query, "order_status", &json!("delivered")).expect("clause");
        apply_filter(&mut query, "created_at__gte", &json!("2025-01-01T00:00:00+00:00"))
            .expect("clause");
        apply_filter(&mut query, "total_amount__gte", &json!(250.0)).expect("clause");
        apply_filter(&mut query, "payment_method", &Value::Null).expect("null skipped");

        let sql = query.sql();
        assert!(sql.contains("t.order_status::text = "), "got: {sql}");
        assert!(sql.contains("t.created_at >= "), "got: {sql}");
        assert!(sql.contains("t.total_amount >= "), "got: {sql}");
        assert!(
            !sql.contains("payment_method"),
            "null filter must be skipped: {sql}"
        );
    }

    #[test]
    fn malformed_uuid_compares_as_text() {
        let mut query = builder();
        apply_filter(&mut query, "user_id", &json!("not-a-uuid")).expect("clause");
        let sql = query.sql();
        assert!(sql.contains("t.user_id::text = "), "got: {sql}");

        let mut query = builder();
        apply_filter(
            &mut query,
            "user_id",
            &json!("7b6a3a1c-8f4a-4ff3-9a14-111111111111"),
        )
        .expect("clause");
        let sql = query.sql();
        assert!(sql.contains("t.user_id = "), "uuid binds natively: {sql}");
    }

    #[test]
    fn array_filters_render_any_clause() {
        let mut query = builder();
        apply_filter(
            &mut query,
            "order_status__in",
            &json!(["pending", "confirmed"]),
        )
        .expect("clause");
        assert!(
            query.sql().contains("t.order_status::text = ANY("),
            "got: {}",
            query.sql()
        );

        let mut query = builder();
        apply_filter(&mut query, "order_status__in", &json!([])).expect("empty skipped");
        assert!(!query.sql().contains("ANY("), "empty arrays are skipped");

        let mut query = builder();
        assert!(apply_filter(&mut query, "total_amount__gte", &json!([1, 2])).is_err());
    }

    #[test]
    fn insert_sql_uses_jsonb_populate_record() {
        let mut payload = Map::new();
        payload.insert("name".to_string(), json!("LED Bulb 9W"));
        payload.insert("category".to_string(), json!("lighting"));
        payload.insert("stock".to_string(), json!(40));
        let columns = vec![
            "category".to_string(),
            "name".to_string(),
            "stock".to_string(),
        ];

        let query = insert_query("products", &columns, Value::Object(payload));
        let sql = query.sql();
        assert!(
            sql.contains("jsonb_populate_record(NULL::products"),
            "got: {sql}"
        );
        assert!(sql.contains("SELECT r.category, r.name, r.stock"), "got: {sql}");
        assert!(sql.contains("RETURNING row_to_json(products.*)"), "got: {sql}");
    }

    #[test]
    fn update_sql_sets_columns_from_populated_record() {
        let mut payload = Map::new();
        payload.insert("stock".to_string(), json!(0));
        payload.insert("status".to_string(), json!("out-of-stock"));
        let columns = vec!["status".to_string(), "stock".to_string()];

        let query = update_query("products", &columns, Value::Object(payload));
        let sql = query.sql();
        assert!(
            sql.contains("jsonb_populate_record(NULL::products"),
            "got: {sql}"
        );
        assert!(sql.contains("status = r.status, stock = r.stock"), "got: {sql}");
    }
}
