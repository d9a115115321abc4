use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::{
    auth::require_admin,
    error::{AppError, AppResult},
    repository::{
        table_service::{delete_row, get_row, list_rows},
        user_rollup::{fetch_user_rollup, UserRollupFilters},
    },
    schemas::{
        clamp_limit_in_range, serialize_to_map, AppQuery, CleanupReportsInput,
        CustomersReportQuery, GenerateReportInput, OrdersReportQuery, PaymentsReportQuery,
        ReportHistoryQuery, SalesReportQuery, StockReportQuery, UsersReportQuery,
    },
    services::{
        account_status::{present_user, AccountStatus, CUSTOMER_ROLES},
        audit::write_audit_log,
        exports,
        report_filters::resolve_window,
        report_store,
    },
    state::AppState,
};

const NON_CANCELLED_STATUSES: &[&str] =
    &["pending", "confirmed", "processing", "shipped", "delivered"];

/// Spend rule for the customers report: every non-cancelled order counts.
/// The users report counts delivered orders only
/// (`user_rollup::SPEND_STATUSES_USERS`). The two rules stay separate.
const SPEND_STATUSES_CUSTOMERS: &[&str] = NON_CANCELLED_STATUSES;

/// The dashboard cards fold everything in flight into one "processing"
/// figure. The raw confirmed and shipped counts are still reported
/// alongside it.
const PROCESSING_BUCKET_STATUSES: &[&str] = &["processing", "shipped", "confirmed"];

const LOW_STOCK_THRESHOLD: i64 = 10;
const NEW_CUSTOMER_WINDOW_DAYS: i64 = 30;
const TOP_PRODUCT_LIMIT: usize = 10;
const TOP_CUSTOMER_LIMIT: usize = 10;
const REPORT_FETCH_LIMIT: i64 = 20000;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/admin/reports/sales", axum::routing::get(sales_report))
        .route("/admin/reports/orders", axum::routing::get(orders_report))
        .route(
            "/admin/reports/payments",
            axum::routing::get(payments_report),
        )
        .route("/admin/reports/stock", axum::routing::get(stock_report))
        .route(
            "/admin/reports/customers",
            axum::routing::get(customers_report),
        )
        .route("/admin/reports/users", axum::routing::get(users_report))
        .route(
            "/admin/reports/export/csv",
            axum::routing::get(export_users_csv),
        )
        .route(
            "/admin/reports/export/excel",
            axum::routing::get(export_users_excel),
        )
        .route(
            "/admin/reports/generate",
            axum::routing::post(generate_report),
        )
        .route(
            "/admin/reports/history/{report_type}",
            axum::routing::get(report_history),
        )
        .route(
            "/admin/reports/generated/{report_id}",
            axum::routing::get(get_generated_report).delete(delete_generated_report),
        )
        .route(
            "/admin/reports/cleanup",
            axum::routing::post(cleanup_reports),
        )
}

async fn sales_report(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<SalesReportQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let (summary, orders) = run_sales_report(pool, &query).await?;
    let record_count = orders.len() as i64;
    // The snapshot keeps the combined summary object.
    report_store::save_report_detached(
        &state,
        "sales",
        summary.clone(),
        Value::Array(orders.clone()),
        serialize_to_map(&query),
        record_count,
        Some(admin.id),
    );

    let mut summary = summary;
    let monthly_sales = take_section(&mut summary, "monthlySales");
    let top_products = take_section(&mut summary, "topProducts");
    Ok(Json(json!({
        "success": true,
        "summary": summary,
        "monthlySales": monthly_sales,
        "topProducts": top_products,
        "data": orders,
    })))
}

async fn orders_report(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<OrdersReportQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let (summary, orders) = run_orders_report(pool, &query).await?;
    let record_count = orders.len() as i64;
    report_store::save_report_detached(
        &state,
        "orders",
        summary.clone(),
        Value::Array(orders.clone()),
        serialize_to_map(&query),
        record_count,
        Some(admin.id),
    );

    Ok(Json(json!({
        "success": true,
        "summary": summary,
        "data": orders,
    })))
}

async fn payments_report(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<PaymentsReportQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let (summary, orders) = run_payments_report(pool, &query).await?;
    let record_count = orders.len() as i64;
    report_store::save_report_detached(
        &state,
        "payments",
        summary.clone(),
        Value::Array(orders.clone()),
        serialize_to_map(&query),
        record_count,
        Some(admin.id),
    );

    Ok(Json(json!({
        "success": true,
        "summary": summary,
        "data": orders,
    })))
}

async fn stock_report(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<StockReportQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let (summary, products) = run_stock_report(pool, &query).await?;
    let record_count = products.len() as i64;
    report_store::save_report_detached(
        &state,
        "stock",
        summary.clone(),
        Value::Array(products.clone()),
        serialize_to_map(&query),
        record_count,
        Some(admin.id),
    );

    let mut summary = summary;
    let category_breakdown = take_section(&mut summary, "categoryBreakdown");
    Ok(Json(json!({
        "success": true,
        "summary": summary,
        "categoryBreakdown": category_breakdown,
        "data": products,
    })))
}

async fn customers_report(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<CustomersReportQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let (summary, customers) = run_customers_report(pool, &query).await?;
    let record_count = customers.len() as i64;
    report_store::save_report_detached(
        &state,
        "customers",
        summary.clone(),
        Value::Array(customers.clone()),
        serialize_to_map(&query),
        record_count,
        Some(admin.id),
    );

    let mut summary = summary;
    let top_customers = take_section(&mut summary, "topCustomers");
    Ok(Json(json!({
        "success": true,
        "summary": summary,
        "topCustomers": top_customers,
        "data": customers,
    })))
}

async fn users_report(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<UsersReportQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let page = run_users_report(pool, &query).await?;
    let summary = json!({
        "currentPage": page.current_page,
        "totalPages": page.total_pages,
        "totalUsers": page.total_users,
    });
    report_store::save_report_detached(
        &state,
        "users",
        summary,
        Value::Array(page.users.clone()),
        serialize_to_map(&query),
        page.total_users,
        Some(admin.id),
    );

    Ok(Json(json!({
        "success": true,
        "users": page.users,
        "currentPage": page.current_page,
        "totalPages": page.total_pages,
        "totalUsers": page.total_users,
    })))
}

async fn export_users_csv(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<UsersReportQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let rows = filtered_user_rows(pool, &query).await?;
    let body = exports::users_csv(&rows);
    let filename = format!("users-report-{}.csv", Utc::now().format("%Y-%m-%d"));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}

async fn export_users_excel(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<UsersReportQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let rows = filtered_user_rows(pool, &query).await?;
    let body = exports::users_workbook(&rows)?;
    let filename = format!("users-report-{}.xlsx", Utc::now().format("%Y-%m-%d"));

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}

/// Runs the matching assembler and stores the snapshot before responding,
/// so the returned id always refers to a persisted row.
async fn generate_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<GenerateReportInput>,
) -> AppResult<Json<Value>> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;
    let report_type = report_store::validate_report_type(&input.report_type)?;

    let (summary, data, record_count) = match report_type {
        "sales" => {
            let query: SalesReportQuery = parse_report_filters(&input.filters)?;
            let (summary, rows) = run_sales_report(pool, &query).await?;
            let count = rows.len() as i64;
            (summary, Value::Array(rows), count)
        }
        "orders" => {
            let query: OrdersReportQuery = parse_report_filters(&input.filters)?;
            let (summary, rows) = run_orders_report(pool, &query).await?;
            let count = rows.len() as i64;
            (summary, Value::Array(rows), count)
        }
        "payments" => {
            let query: PaymentsReportQuery = parse_report_filters(&input.filters)?;
            let (summary, rows) = run_payments_report(pool, &query).await?;
            let count = rows.len() as i64;
            (summary, Value::Array(rows), count)
        }
        "stock" => {
            let query: StockReportQuery = parse_report_filters(&input.filters)?;
            let (summary, rows) = run_stock_report(pool, &query).await?;
            let count = rows.len() as i64;
            (summary, Value::Array(rows), count)
        }
        "customers" => {
            let query: CustomersReportQuery = parse_report_filters(&input.filters)?;
            let (summary, rows) = run_customers_report(pool, &query).await?;
            let count = rows.len() as i64;
            (summary, Value::Array(rows), count)
        }
        "users" => {
            let query: UsersReportQuery = parse_report_filters(&input.filters)?;
            let page = run_users_report(pool, &query).await?;
            let summary = json!({
                "currentPage": page.current_page,
                "totalPages": page.total_pages,
                "totalUsers": page.total_users,
            });
            (summary, Value::Array(page.users), page.total_users)
        }
        other => {
            return Err(AppError::BadRequest(format!(
                "Unknown report type '{other}'."
            )));
        }
    };

    let saved = report_store::save_report(
        pool,
        report_type,
        summary.clone(),
        data,
        input.filters.clone(),
        record_count,
        Some(admin.id.as_str()),
        state.config.report_ttl_days,
    )
    .await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&admin.id),
        "report.generate",
        "generated_reports",
        Some(&value_str(&saved, "id")),
        Some(json!({"type": report_type})),
    )
    .await;

    Ok(Json(json!({
        "success": true,
        "reportId": saved.get("id").cloned().unwrap_or(Value::Null),
        "summary": summary,
        "recordCount": record_count,
    })))
}

async fn report_history(
    State(state): State<AppState>,
    Path(report_type): Path<String>,
    AppQuery(query): AppQuery<ReportHistoryQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let history = report_store::get_history(pool, &report_type, query.limit).await?;
    Ok(Json(json!({"success": true, "history": history})))
}

async fn get_generated_report(
    State(state): State<AppState>,
    Path(report_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let report_id = parse_report_id(&report_id)?;
    let report = get_row(pool, "generated_reports", &report_id, "id").await?;
    Ok(Json(json!({"success": true, "report": report})))
}

async fn delete_generated_report(
    State(state): State<AppState>,
    Path(report_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let report_id = parse_report_id(&report_id)?;
    let deleted = delete_row(pool, "generated_reports", &report_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&admin.id),
        "report.delete",
        "generated_reports",
        Some(&report_id),
        None,
    )
    .await;

    Ok(Json(json!({"success": true, "report": deleted})))
}

async fn cleanup_reports(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CleanupReportsInput>,
) -> AppResult<Json<Value>> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let days_old = input.days_old.max(1);
    let deleted = report_store::cleanup_old_reports(pool, days_old).await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&admin.id),
        "report.cleanup",
        "generated_reports",
        None,
        Some(json!({"daysOld": days_old, "deleted": deleted})),
    )
    .await;

    Ok(Json(json!({"success": true, "deleted": deleted})))
}

async fn run_sales_report(
    pool: &sqlx::PgPool,
    query: &SalesReportQuery,
) -> AppResult<(Value, Vec<Value>)> {
    let window = resolve_window(query.date_from.as_deref(), query.date_to.as_deref())?;
    let mut filters = Map::new();
    window.apply(&mut filters, "created_at");
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("order_status".to_string(), Value::String(status.to_string()));
    }
    if let Some(min_amount) = query.min_amount {
        filters.insert("total_amount__gte".to_string(), json!(min_amount));
    }
    if let Some(max_amount) = query.max_amount {
        filters.insert("total_amount__lte".to_string(), json!(max_amount));
    }

    let orders = list_rows(
        pool,
        "orders",
        Some(&filters),
        REPORT_FETCH_LIMIT,
        0,
        "created_at",
        false,
    )
    .await?;

    let summary = fold_sales_summary(&orders);
    Ok((summary, orders))
}

fn fold_sales_summary(orders: &[Value]) -> Value {
    let mut total_revenue = 0.0;
    let mut completed = 0_i64;
    let mut pending = 0_i64;
    let mut cancelled = 0_i64;
    let mut monthly: HashMap<String, (f64, i64)> = HashMap::new();
    let mut product_totals: HashMap<String, (f64, i64)> = HashMap::new();

    for order in orders {
        let status = value_str(order, "order_status");
        let amount = number_from_value(order.get("total_amount"));
        let delivered = status == "delivered";

        match status.as_str() {
            "delivered" => {
                completed += 1;
                total_revenue += amount;
            }
            "pending" => pending += 1,
            "cancelled" => cancelled += 1,
            _ => {}
        }

        if let Some(created_at) = datetime_or_none(order.get("created_at")) {
            let entry = monthly
                .entry(created_at.format("%B %Y").to_string())
                .or_insert((0.0, 0));
            if delivered {
                entry.0 += amount;
            }
            entry.1 += 1;
        }

        if !delivered {
            continue;
        }
        let Some(items) = order.get("items").and_then(Value::as_array) else {
            continue;
        };
        for item in items {
            let name = value_str(item, "name");
            if name.is_empty() {
                continue;
            }
            let quantity = item.get("quantity").and_then(Value::as_i64).unwrap_or(1);
            let entry = product_totals.entry(name).or_insert((0.0, 0));
            entry.0 += number_from_value(item.get("price")) * quantity as f64;
            entry.1 += quantity;
        }
    }

    let monthly_sales: Map<String, Value> = monthly
        .into_iter()
        .map(|(month, (revenue, count))| {
            (month, json!({"revenue": round2(revenue), "orders": count}))
        })
        .collect();

    let mut ranked: Vec<(String, (f64, i64))> = product_totals.into_iter().collect();
    ranked.sort_by(|(_, (revenue_a, _)), (_, (revenue_b, _))| revenue_b.total_cmp(revenue_a));
    let top_products: Vec<Value> = ranked
        .into_iter()
        .take(TOP_PRODUCT_LIMIT)
        .map(|(name, (revenue, quantity))| {
            json!({"name": name, "revenue": round2(revenue), "quantity": quantity})
        })
        .collect();

    let average_order_value = if completed > 0 {
        round2(total_revenue / completed as f64)
    } else {
        0.0
    };

    json!({
        "totalSales": orders.len(),
        "totalRevenue": round2(total_revenue),
        "averageOrderValue": average_order_value,
        "completedOrders": completed,
        "pendingOrders": pending,
        "cancelledOrders": cancelled,
        "monthlySales": monthly_sales,
        "topProducts": top_products,
    })
}

async fn run_orders_report(
    pool: &sqlx::PgPool,
    query: &OrdersReportQuery,
) -> AppResult<(Value, Vec<Value>)> {
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

    let mut orders = list_rows(
        pool,
        "orders",
        Some(&filters),
        REPORT_FETCH_LIMIT,
        0,
        "created_at",
        false,
    )
    .await?;

    if let Some(search) = non_empty_opt(query.search.as_deref()) {
        let matching_users = search_customer_ids(pool, search).await?;
        let needle = search.to_lowercase();
        orders.retain(|order| {
            value_str(order, "order_number")
                .to_lowercase()
                .contains(&needle)
                || matching_users.contains(&value_str(order, "user_id"))
        });
    }

    let summary = fold_orders_summary(&orders);
    Ok((summary, orders))
}

/// Users whose name or email matches the search term, for joining the
/// order list against customer details in-process.
async fn search_customer_ids(pool: &sqlx::PgPool, search: &str) -> AppResult<HashSet<String>> {
    let pattern = format!("%{search}%");
    let mut ids = HashSet::new();
    for column in ["name", "email"] {
        let key = format!("{column}__ilike");
        let filters = json_map(&[(key.as_str(), Value::String(pattern.clone()))]);
        let rows = list_rows(
            pool,
            "users",
            Some(&filters),
            REPORT_FETCH_LIMIT,
            0,
            "created_at",
            false,
        )
        .await?;
        for row in rows {
            let id = value_str(&row, "id");
            if !id.is_empty() {
                ids.insert(id);
            }
        }
    }
    Ok(ids)
}

fn fold_orders_summary(orders: &[Value]) -> Value {
    let mut counts: HashMap<String, i64> = HashMap::new();
    for order in orders {
        *counts.entry(value_str(order, "order_status")).or_insert(0) += 1;
    }
    let count = |status: &str| counts.get(status).copied().unwrap_or(0);
    let processing_bucket: i64 = PROCESSING_BUCKET_STATUSES
        .iter()
        .map(|status| count(status))
        .sum();

    json!({
        "totalOrders": orders.len(),
        "pending": count("pending"),
        "processing": processing_bucket,
        "confirmed": count("confirmed"),
        "shipped": count("shipped"),
        "delivered": count("delivered"),
        "cancelled": count("cancelled"),
    })
}

async fn run_payments_report(
    pool: &sqlx::PgPool,
    query: &PaymentsReportQuery,
) -> AppResult<(Value, Vec<Value>)> {
    let window = resolve_window(query.date_from.as_deref(), query.date_to.as_deref())?;
    let mut filters = Map::new();
    window.apply(&mut filters, "created_at");
    if let Some(method) = non_empty_opt(query.payment_method.as_deref()) {
        filters.insert(
            "payment_method".to_string(),
            Value::String(method.to_string()),
        );
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert(
            "payment_status".to_string(),
            Value::String(status.to_string()),
        );
    }
    if let Some(min_amount) = query.min_amount {
        filters.insert("total_amount__gte".to_string(), json!(min_amount));
    }
    if let Some(max_amount) = query.max_amount {
        filters.insert("total_amount__lte".to_string(), json!(max_amount));
    }
    // Cancelled orders never reach the payment ledger.
    filters.insert(
        "order_status__in".to_string(),
        json!(NON_CANCELLED_STATUSES),
    );

    let orders = list_rows(
        pool,
        "orders",
        Some(&filters),
        REPORT_FETCH_LIMIT,
        0,
        "created_at",
        false,
    )
    .await?;

    let summary = fold_payments_summary(&orders);
    Ok((summary, orders))
}

fn fold_payments_summary(orders: &[Value]) -> Value {
    let mut total_amount = 0.0;
    let mut cod_payments = 0_i64;
    let mut cod_amount = 0.0;
    let mut online_payments = 0_i64;
    let mut online_amount = 0.0;
    let mut pending = 0_i64;
    let mut completed = 0_i64;
    let mut failed = 0_i64;

    for order in orders {
        let amount = number_from_value(order.get("total_amount"));
        total_amount += amount;

        if value_str(order, "payment_method").eq_ignore_ascii_case("cod") {
            cod_payments += 1;
            cod_amount += amount;
        } else {
            online_payments += 1;
            online_amount += amount;
        }

        match value_str(order, "payment_status").as_str() {
            "pending" => pending += 1,
            "completed" => completed += 1,
            "failed" => failed += 1,
            _ => {}
        }
    }

    json!({
        "totalTransactions": orders.len(),
        "totalAmount": round2(total_amount),
        "codPayments": cod_payments,
        "codAmount": round2(cod_amount),
        "onlinePayments": online_payments,
        "onlineAmount": round2(online_amount),
        "pending": pending,
        "completed": completed,
        "failed": failed,
    })
}

async fn run_stock_report(
    pool: &sqlx::PgPool,
    query: &StockReportQuery,
) -> AppResult<(Value, Vec<Value>)> {
    let mut filters = Map::new();
    if let Some(category) = non_empty_opt(query.category.as_deref()) {
        filters.insert("category".to_string(), Value::String(category.to_string()));
    }
    if let Some(search) = non_empty_opt(query.search.as_deref()) {
        filters.insert("name__ilike".to_string(), json!(format!("%{search}%")));
    }
    if let Some(min_stock) = query.min_stock {
        filters.insert("stock__gte".to_string(), json!(min_stock));
    }
    if let Some(max_stock) = query.max_stock {
        filters.insert("stock__lte".to_string(), json!(max_stock));
    }

    let mut products = list_rows(
        pool,
        "products",
        Some(&filters),
        REPORT_FETCH_LIMIT,
        0,
        "created_at",
        false,
    )
    .await?;

    if let Some(stock_status) = non_empty_opt(query.stock_status.as_deref()) {
        let wanted = stock_status.to_lowercase();
        if !["in", "low", "out"].contains(&wanted.as_str()) {
            return Err(AppError::BadRequest(
                "stockStatus must be one of in, low, out.".to_string(),
            ));
        }
        products.retain(|product| stock_bucket(stock_units(product)) == wanted);
    }

    let summary = fold_stock_summary(&products);
    Ok((summary, products))
}

fn stock_bucket(stock: i64) -> &'static str {
    if stock == 0 {
        "out"
    } else if stock <= LOW_STOCK_THRESHOLD {
        "low"
    } else {
        "in"
    }
}

fn stock_units(product: &Value) -> i64 {
    product.get("stock").and_then(Value::as_i64).unwrap_or(0)
}

fn fold_stock_summary(products: &[Value]) -> Value {
    let mut in_stock = 0_i64;
    let mut low_stock = 0_i64;
    let mut out_of_stock = 0_i64;
    let mut total_quantity = 0_i64;
    let mut total_value = 0.0;
    let mut breakdown: HashMap<String, (i64, i64, f64)> = HashMap::new();

    for product in products {
        let stock = stock_units(product);
        match stock_bucket(stock) {
            "out" => out_of_stock += 1,
            "low" => low_stock += 1,
            _ => in_stock += 1,
        }
        total_quantity += stock;
        let value = number_from_value(product.get("price")) * stock as f64;
        total_value += value;

        let mut category = value_str(product, "category");
        if category.is_empty() {
            category = "Uncategorized".to_string();
        }
        let entry = breakdown.entry(category).or_insert((0, 0, 0.0));
        entry.0 += 1;
        entry.1 += stock;
        entry.2 += value;
    }

    let category_breakdown: Map<String, Value> = breakdown
        .into_iter()
        .map(|(category, (count, stock, value))| {
            (
                category,
                json!({"count": count, "totalStock": stock, "totalValue": round2(value)}),
            )
        })
        .collect();

    json!({
        "totalProducts": products.len(),
        "inStock": in_stock,
        "lowStock": low_stock,
        "outOfStock": out_of_stock,
        "totalQuantity": total_quantity,
        "totalStockValue": round2(total_value),
        "categoryBreakdown": category_breakdown,
    })
}

async fn run_customers_report(
    pool: &sqlx::PgPool,
    query: &CustomersReportQuery,
) -> AppResult<(Value, Vec<Value>)> {
    let window = resolve_window(query.date_from.as_deref(), query.date_to.as_deref())?;
    let mut filters = Map::new();
    window.apply(&mut filters, "created_at");
    filters.insert("role__in".to_string(), json!(CUSTOMER_ROLES));

    let rows = list_rows(
        pool,
        "users",
        Some(&filters),
        REPORT_FETCH_LIMIT,
        0,
        "created_at",
        false,
    )
    .await?;

    let now = Utc::now();
    let mut customers: Vec<Value> = rows.into_iter().map(|row| present_user(row, now)).collect();
    if let Some(search) = non_empty_opt(query.search.as_deref()) {
        let needle = search.to_lowercase();
        customers.retain(|customer| {
            value_str(customer, "name").to_lowercase().contains(&needle)
                || value_str(customer, "email").to_lowercase().contains(&needle)
        });
    }
    if let Some(status) = non_empty_opt(query.account_status.as_deref()) {
        retain_account_status(&mut customers, status)?;
    }

    // The date window bounds registration. Spend is folded over the full
    // order history of the customers that survived the filter.
    let order_filters = json_map(&[("order_status__in", json!(SPEND_STATUSES_CUSTOMERS))]);
    let orders = list_rows(
        pool,
        "orders",
        Some(&order_filters),
        REPORT_FETCH_LIMIT,
        0,
        "created_at",
        false,
    )
    .await?;

    // Order-count and spend thresholds apply after aggregation, on the
    // same non-cancelled totals the summary reports.
    let totals = customer_spend_totals(&orders);
    customers.retain(|customer| {
        let (spent, count) = totals
            .get(&value_str(customer, "id"))
            .copied()
            .unwrap_or((0.0, 0));
        within_customer_thresholds(spent, count, query)
    });

    let summary = fold_customers_summary(&customers, &orders, now);
    Ok((summary, customers))
}

/// Per-user (spend, order count) over the customers report's qualifying
/// order set.
fn customer_spend_totals(orders: &[Value]) -> HashMap<String, (f64, i64)> {
    let mut spend: HashMap<String, (f64, i64)> = HashMap::new();
    for order in orders {
        let user_id = value_str(order, "user_id");
        if user_id.is_empty() {
            continue;
        }
        let entry = spend.entry(user_id).or_insert((0.0, 0));
        entry.0 += number_from_value(order.get("total_amount"));
        entry.1 += 1;
    }
    spend
}

fn within_customer_thresholds(spent: f64, count: i64, query: &CustomersReportQuery) -> bool {
    query.min_orders.map_or(true, |min| count >= min)
        && query.max_orders.map_or(true, |max| count <= max)
        && query.min_amount.map_or(true, |min| spent >= min)
        && query.max_amount.map_or(true, |max| spent <= max)
}

fn fold_customers_summary(customers: &[Value], orders: &[Value], now: DateTime<Utc>) -> Value {
    let spend = customer_spend_totals(orders);

    let new_cutoff = now - Duration::days(NEW_CUSTOMER_WINDOW_DAYS);
    let mut active = 0_i64;
    let mut new_customers = 0_i64;
    let mut total_revenue = 0.0;
    let mut total_orders = 0_i64;
    let mut ranked: Vec<Value> = Vec::new();

    for customer in customers {
        if value_str(customer, "actual_status") == "ACTIVE" {
            active += 1;
        }
        if let Some(created_at) = datetime_or_none(customer.get("created_at")) {
            if created_at >= new_cutoff {
                new_customers += 1;
            }
        }

        let id = value_str(customer, "id");
        let (spent, order_count) = spend.get(&id).copied().unwrap_or((0.0, 0));
        total_revenue += spent;
        total_orders += order_count;
        ranked.push(json!({
            "id": id,
            "name": value_str(customer, "name"),
            "email": value_str(customer, "email"),
            "totalSpent": round2(spent),
            "orderCount": order_count,
        }));
    }

    ranked.sort_by(|a, b| {
        number_from_value(b.get("totalSpent")).total_cmp(&number_from_value(a.get("totalSpent")))
    });
    ranked.truncate(TOP_CUSTOMER_LIMIT);

    let average_orders = if customers.is_empty() {
        0.0
    } else {
        round2(total_orders as f64 / customers.len() as f64)
    };

    json!({
        "totalCustomers": customers.len(),
        "activeCustomers": active,
        "newCustomers": new_customers,
        "totalRevenue": round2(total_revenue),
        "averageOrdersPerCustomer": average_orders,
        "topCustomers": ranked,
    })
}

struct UsersReportPage {
    users: Vec<Value>,
    current_page: i64,
    total_pages: i64,
    total_users: i64,
}

async fn run_users_report(
    pool: &sqlx::PgPool,
    query: &UsersReportQuery,
) -> AppResult<UsersReportPage> {
    let users = filtered_user_rows(pool, query).await?;
    Ok(paginate_users(users, query.page, query.limit))
}

/// Full filtered rollup, derived status attached, before any pagination.
/// The exports reuse this so CSV, XLSX and JSON agree for equal filters.
async fn filtered_user_rows(
    pool: &sqlx::PgPool,
    query: &UsersReportQuery,
) -> AppResult<Vec<Value>> {
    let window = resolve_window(query.date_from.as_deref(), query.date_to.as_deref())?;
    let roles = match non_empty_opt(query.role.as_deref()) {
        Some(role) => vec![role.to_string()],
        None => CUSTOMER_ROLES.iter().map(|role| role.to_string()).collect(),
    };
    let rollup_filters = UserRollupFilters {
        roles,
        search: non_empty_opt(query.search.as_deref()).map(ToOwned::to_owned),
        date_from: window.from,
        date_to: window.to,
        min_orders: query.min_orders,
        max_orders: query.max_orders,
        min_amount: query.min_amount,
        max_amount: query.max_amount,
    };

    let rows = fetch_user_rollup(pool, &rollup_filters).await?;
    let now = Utc::now();
    let mut users: Vec<Value> = rows.into_iter().map(|row| present_user(row, now)).collect();
    if let Some(status) = non_empty_opt(query.account_status.as_deref()) {
        retain_account_status(&mut users, status)?;
    }
    Ok(users)
}

/// Status filtering happens after derivation, so the page is cut from the
/// already-filtered set and the totals describe what the caller can page
/// through.
fn paginate_users(users: Vec<Value>, page: i64, limit: i64) -> UsersReportPage {
    let limit = clamp_limit_in_range(limit, 1, 100);
    let page = page.max(1);
    let total_users = users.len() as i64;
    let total_pages = if total_users == 0 {
        0
    } else {
        (total_users + limit - 1) / limit
    };
    let start = ((page - 1) * limit) as usize;
    let users = if start >= users.len() {
        Vec::new()
    } else {
        users.into_iter().skip(start).take(limit as usize).collect()
    };

    UsersReportPage {
        users,
        current_page: page,
        total_pages,
        total_users,
    }
}

fn retain_account_status(rows: &mut Vec<Value>, raw: &str) -> AppResult<()> {
    let Some(wanted) = AccountStatus::parse(raw) else {
        return Err(AppError::BadRequest(format!(
            "Unknown account status '{raw}'."
        )));
    };
    rows.retain(|row| value_str(row, "actual_status") == wanted.as_str());
    Ok(())
}

fn parse_report_filters<T: serde::de::DeserializeOwned>(
    filters: &Map<String, Value>,
) -> AppResult<T> {
    serde_json::from_value(Value::Object(filters.clone()))
        .map_err(|error| AppError::BadRequest(format!("Invalid report filters: {error}")))
}

fn parse_report_id(raw: &str) -> AppResult<String> {
    Uuid::parse_str(raw)
        .map(|id| id.to_string())
        .map_err(|_| AppError::BadRequest("Invalid report id.".to_string()))
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

fn datetime_or_none(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
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

/// Moves a breakdown section out of a folded summary so the response can
/// expose it beside the summary instead of inside it.
fn take_section(summary: &mut Value, key: &str) -> Value {
    summary
        .as_object_mut()
        .and_then(|map| map.remove(key))
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::{
        fold_customers_summary, fold_orders_summary, fold_payments_summary, fold_sales_summary,
        fold_stock_summary, paginate_users, parse_report_id, retain_account_status, stock_bucket,
        take_section, within_customer_thresholds,
    };
    use crate::schemas::CustomersReportQuery;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    fn order(status: &str, amount: f64) -> Value {
        json!({
            "order_status": status,
            "total_amount": amount,
            "created_at": "2025-01-15T10:00:00Z",
        })
    }

    #[test]
    fn sales_revenue_counts_delivered_only() {
        let orders = vec![order("delivered", 1000.0), order("pending", 500.0)];
        let summary = fold_sales_summary(&orders);

        assert_eq!(summary.get("totalSales").and_then(Value::as_i64), Some(2));
        assert_eq!(
            summary.get("totalRevenue").and_then(Value::as_f64),
            Some(1000.0)
        );
        assert_eq!(
            summary.get("completedOrders").and_then(Value::as_i64),
            Some(1)
        );
        assert_eq!(
            summary.get("pendingOrders").and_then(Value::as_i64),
            Some(1)
        );
        assert_eq!(
            summary.get("averageOrderValue").and_then(Value::as_f64),
            Some(1000.0)
        );
    }

    #[test]
    fn sales_average_is_zero_without_delivered_orders() {
        let orders = vec![order("pending", 80.0), order("cancelled", 20.0)];
        let summary = fold_sales_summary(&orders);

        assert_eq!(
            summary.get("averageOrderValue").and_then(Value::as_f64),
            Some(0.0)
        );
        assert_eq!(
            summary.get("cancelledOrders").and_then(Value::as_i64),
            Some(1)
        );
    }

    #[test]
    fn sales_monthly_buckets_use_month_year_keys() {
        let orders = vec![order("delivered", 100.0), order("pending", 50.0)];
        let summary = fold_sales_summary(&orders);

        let monthly = summary
            .get("monthlySales")
            .and_then(Value::as_object)
            .expect("monthlySales object");
        let january = monthly
            .get("January 2025")
            .and_then(Value::as_object)
            .expect("January bucket");
        assert_eq!(january.get("revenue").and_then(Value::as_f64), Some(100.0));
        assert_eq!(january.get("orders").and_then(Value::as_i64), Some(2));
    }

    #[test]
    fn sales_top_products_rank_delivered_line_items_by_revenue() {
        let orders = vec![
            json!({
                "order_status": "delivered",
                "total_amount": 500.0,
                "created_at": "2025-02-01T08:00:00Z",
                "items": [
                    {"name": "Copper Wire 10m", "price": 50.0, "quantity": 4},
                    {"name": "LED Panel 24W", "price": 150.0, "quantity": 1}
                ]
            }),
            json!({
                "order_status": "delivered",
                "total_amount": 150.0,
                "created_at": "2025-02-02T08:00:00Z",
                "items": [{"name": "LED Panel 24W", "price": 150.0, "quantity": 1}]
            }),
            json!({
                "order_status": "pending",
                "total_amount": 999.0,
                "created_at": "2025-02-03T08:00:00Z",
                "items": [{"name": "Distribution Board", "price": 999.0, "quantity": 1}]
            }),
        ];
        let summary = fold_sales_summary(&orders);

        let top = summary
            .get("topProducts")
            .and_then(Value::as_array)
            .expect("topProducts array");
        assert_eq!(top.len(), 2);
        assert_eq!(
            top[0].get("name").and_then(Value::as_str),
            Some("LED Panel 24W")
        );
        assert_eq!(top[0].get("revenue").and_then(Value::as_f64), Some(300.0));
        assert_eq!(top[1].get("quantity").and_then(Value::as_i64), Some(4));
    }

    #[test]
    fn orders_processing_bucket_spans_in_flight_statuses() {
        let orders = vec![
            order("processing", 10.0),
            order("shipped", 10.0),
            order("shipped", 10.0),
            order("confirmed", 10.0),
            order("confirmed", 10.0),
            order("confirmed", 10.0),
            order("pending", 10.0),
            order("delivered", 10.0),
            order("cancelled", 10.0),
        ];
        let summary = fold_orders_summary(&orders);

        assert_eq!(summary.get("totalOrders").and_then(Value::as_i64), Some(9));
        assert_eq!(summary.get("processing").and_then(Value::as_i64), Some(6));
        assert_eq!(summary.get("confirmed").and_then(Value::as_i64), Some(3));
        assert_eq!(summary.get("shipped").and_then(Value::as_i64), Some(2));
        assert_eq!(summary.get("pending").and_then(Value::as_i64), Some(1));
        assert_eq!(summary.get("delivered").and_then(Value::as_i64), Some(1));
        assert_eq!(summary.get("cancelled").and_then(Value::as_i64), Some(1));
    }

    #[test]
    fn payments_split_cod_case_insensitively() {
        let orders = vec![
            json!({"payment_method": "COD", "payment_status": "pending", "total_amount": 100.0}),
            json!({"payment_method": "cod", "payment_status": "completed", "total_amount": 50.0}),
            json!({"payment_method": "razorpay", "payment_status": "completed", "total_amount": 200.0}),
            json!({"payment_method": "card", "payment_status": "failed", "total_amount": 75.0}),
        ];
        let summary = fold_payments_summary(&orders);

        assert_eq!(
            summary.get("totalTransactions").and_then(Value::as_i64),
            Some(4)
        );
        assert_eq!(
            summary.get("totalAmount").and_then(Value::as_f64),
            Some(425.0)
        );
        assert_eq!(summary.get("codPayments").and_then(Value::as_i64), Some(2));
        assert_eq!(
            summary.get("codAmount").and_then(Value::as_f64),
            Some(150.0)
        );
        assert_eq!(
            summary.get("onlinePayments").and_then(Value::as_i64),
            Some(2)
        );
        assert_eq!(
            summary.get("onlineAmount").and_then(Value::as_f64),
            Some(275.0)
        );
        assert_eq!(summary.get("pending").and_then(Value::as_i64), Some(1));
        assert_eq!(summary.get("completed").and_then(Value::as_i64), Some(2));
        assert_eq!(summary.get("failed").and_then(Value::as_i64), Some(1));
    }

    #[test]
    fn stock_boundaries_are_exact() {
        assert_eq!(stock_bucket(0), "out");
        assert_eq!(stock_bucket(1), "low");
        assert_eq!(stock_bucket(10), "low");
        assert_eq!(stock_bucket(11), "in");
    }

    #[test]
    fn stock_summary_partitions_products_and_sums_value() {
        let products = vec![
            json!({"name": "Breaker 32A", "category": "Switchgear", "price": 20.0, "stock": 0}),
            json!({"name": "Cable 2.5mm", "category": "Wiring", "price": 5.0, "stock": 10}),
            json!({"name": "Panel Light", "category": "Lighting", "price": 12.5, "stock": 40}),
        ];
        let summary = fold_stock_summary(&products);

        assert_eq!(
            summary.get("totalProducts").and_then(Value::as_i64),
            Some(3)
        );
        assert_eq!(summary.get("outOfStock").and_then(Value::as_i64), Some(1));
        assert_eq!(summary.get("lowStock").and_then(Value::as_i64), Some(1));
        assert_eq!(summary.get("inStock").and_then(Value::as_i64), Some(1));
        assert_eq!(
            summary.get("totalQuantity").and_then(Value::as_i64),
            Some(50)
        );
        assert_eq!(
            summary.get("totalStockValue").and_then(Value::as_f64),
            Some(550.0)
        );

        let breakdown = summary
            .get("categoryBreakdown")
            .and_then(Value::as_object)
            .expect("categoryBreakdown object");
        let lighting = breakdown
            .get("Lighting")
            .and_then(Value::as_object)
            .expect("Lighting bucket");
        assert_eq!(lighting.get("count").and_then(Value::as_i64), Some(1));
        assert_eq!(lighting.get("totalStock").and_then(Value::as_i64), Some(40));
        assert_eq!(
            lighting.get("totalValue").and_then(Value::as_f64),
            Some(500.0)
        );
    }

    #[test]
    fn customers_summary_folds_spend_and_trailing_window() {
        let now = Utc.with_ymd_and_hms(2025, 6, 30, 12, 0, 0).unwrap();
        let customers = vec![
            json!({
                "id": "u1",
                "name": "Asha",
                "email": "asha@example.com",
                "actual_status": "ACTIVE",
                "created_at": "2025-06-20T00:00:00Z",
            }),
            json!({
                "id": "u2",
                "name": "Omar",
                "email": "omar@example.com",
                "actual_status": "INACTIVE",
                "created_at": "2024-01-01T00:00:00Z",
            }),
        ];
        let orders = vec![
            json!({"user_id": "u1", "total_amount": 100.0}),
            json!({"user_id": "u1", "total_amount": 150.0}),
            json!({"user_id": "u2", "total_amount": 400.0}),
        ];
        let summary = fold_customers_summary(&customers, &orders, now);

        assert_eq!(
            summary.get("totalCustomers").and_then(Value::as_i64),
            Some(2)
        );
        assert_eq!(
            summary.get("activeCustomers").and_then(Value::as_i64),
            Some(1)
        );
        assert_eq!(summary.get("newCustomers").and_then(Value::as_i64), Some(1));
        assert_eq!(
            summary.get("totalRevenue").and_then(Value::as_f64),
            Some(650.0)
        );
        assert_eq!(
            summary
                .get("averageOrdersPerCustomer")
                .and_then(Value::as_f64),
            Some(1.5)
        );

        let top = summary
            .get("topCustomers")
            .and_then(Value::as_array)
            .expect("topCustomers array");
        assert_eq!(top[0].get("id").and_then(Value::as_str), Some("u2"));
        assert_eq!(
            top[0].get("totalSpent").and_then(Value::as_f64),
            Some(400.0)
        );
        assert_eq!(top[1].get("orderCount").and_then(Value::as_i64), Some(2));
    }

    #[test]
    fn users_pagination_math() {
        let users: Vec<Value> = (0..45)
            .map(|index| json!({"id": index.to_string()}))
            .collect();
        let page = paginate_users(users, 3, 20);

        assert_eq!(page.total_users, 45);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.current_page, 3);
        assert_eq!(page.users.len(), 5);
    }

    #[test]
    fn pagination_clamps_page_and_limit() {
        let users: Vec<Value> = (0..5)
            .map(|index| json!({"id": index.to_string()}))
            .collect();

        let clamped = paginate_users(users.clone(), 0, 500);
        assert_eq!(clamped.current_page, 1);
        assert_eq!(clamped.total_pages, 1);
        assert_eq!(clamped.users.len(), 5);

        let past_end = paginate_users(users, 9, 2);
        assert_eq!(past_end.users.len(), 0);
        assert_eq!(past_end.total_pages, 3);

        let empty = paginate_users(Vec::new(), 1, 20);
        assert_eq!(empty.total_pages, 0);
        assert_eq!(empty.total_users, 0);
    }

    #[test]
    fn account_status_filter_is_case_insensitive_and_strict() {
        let mut rows = vec![
            json!({"actual_status": "ACTIVE"}),
            json!({"actual_status": "SUSPENDED"}),
        ];
        retain_account_status(&mut rows, "suspended").expect("known status");
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].get("actual_status").and_then(Value::as_str),
            Some("SUSPENDED")
        );

        assert!(retain_account_status(&mut rows, "parked").is_err());
    }

    #[test]
    fn customer_thresholds_gate_spend_and_order_count() {
        let query: CustomersReportQuery = serde_json::from_value(json!({
            "minOrders": 2,
            "maxOrders": 5,
            "minAmount": 100.0,
            "maxAmount": 500.0,
        }))
        .expect("query");

        assert!(within_customer_thresholds(250.0, 3, &query));
        assert!(!within_customer_thresholds(250.0, 1, &query));
        assert!(!within_customer_thresholds(250.0, 6, &query));
        assert!(!within_customer_thresholds(50.0, 3, &query));
        assert!(!within_customer_thresholds(600.0, 3, &query));

        let open: CustomersReportQuery = serde_json::from_value(json!({})).expect("query");
        assert!(within_customer_thresholds(0.0, 0, &open));
    }

    #[test]
    fn breakdowns_lift_out_of_the_summary() {
        let mut summary = json!({
            "totalSales": 2,
            "monthlySales": {"January 2025": {"orders": 2, "revenue": 100.0}},
        });

        let monthly = take_section(&mut summary, "monthlySales");
        assert!(monthly.get("January 2025").is_some());
        assert!(summary.get("monthlySales").is_none());
        assert_eq!(summary.get("totalSales").and_then(Value::as_i64), Some(2));
        assert_eq!(take_section(&mut summary, "topProducts"), Value::Null);
    }

    #[test]
    fn report_ids_must_be_uuids() {
        assert!(parse_report_id("not-a-uuid").is_err());
        assert!(parse_report_id("6e4f1e2c-8c1d-4f2e-9f2a-1b9dbb6d6f10").is_ok());
    }
}
