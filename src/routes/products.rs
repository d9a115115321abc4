use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_admin,
    error::{AppError, AppResult},
    repository::table_service::{count_rows, create_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, AppQuery,
        CreateProductInput, PublicProductsQuery, UpdateProductInput,
    },
    services::audit::write_audit_log,
    state::AppState,
};

const PRODUCT_STATUSES: &[&str] = &["active", "inactive", "out-of-stock"];

/// Statuses visible on the storefront. Soft-deleted products stay in the
/// table as `inactive` and never appear here.
const PUBLIC_STATUSES: &[&str] = &["active", "out-of-stock"];

const LOW_STOCK_THRESHOLD: i64 = 10;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/products", axum::routing::get(list_products))
        .route("/products/{product_id}", axum::routing::get(get_product))
        .route("/admin/products", axum::routing::post(create_product))
        .route(
            "/admin/products/{product_id}",
            axum::routing::patch(update_product).delete(delete_product),
        )
}

async fn list_products(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<PublicProductsQuery>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("status__in".to_string(), json!(PUBLIC_STATUSES));
    if let Some(category) = non_empty_opt(query.category.as_deref()) {
        filters.insert("category".to_string(), Value::String(category.to_string()));
    }
    if let Some(search) = non_empty_opt(query.search.as_deref()) {
        filters.insert("name__ilike".to_string(), json!(format!("%{search}%")));
    }
    if let Some(min_price) = query.min_price {
        filters.insert("price__gte".to_string(), json!(min_price));
    }
    if let Some(max_price) = query.max_price {
        filters.insert("price__lte".to_string(), json!(max_price));
    }
    if let Some(featured) = query.featured {
        filters.insert("featured".to_string(), Value::Bool(featured));
    }

    let limit = clamp_limit_in_range(query.limit, 1, 100);
    let page = query.page.max(1);
    let offset = (page - 1) * limit;

    let total = count_rows(pool, "products", Some(&filters)).await?;
    let rows = list_rows(
        pool,
        "products",
        Some(&filters),
        limit,
        offset,
        "created_at",
        false,
    )
    .await?;
    let products: Vec<Value> = rows.into_iter().map(present_product).collect();

    let total_pages = if total == 0 { 0 } else { (total + limit - 1) / limit };
    Ok(Json(json!({
        "success": true,
        "products": products,
        "total": total,
        "currentPage": page,
        "totalPages": total_pages,
    })))
}

async fn get_product(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let product = get_row(pool, "products", &product_id, "id").await?;
    if value_str(&product, "status") == "inactive" {
        return Err(AppError::NotFound("Product not found.".to_string()));
    }

    Ok(Json(json!({
        "success": true,
        "product": present_product(product),
    })))
}

async fn create_product(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateProductInput>,
) -> AppResult<impl IntoResponse> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;
    validate_input(&payload)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    let status = resolve_product_status(payload.status.as_deref(), payload.stock)?;
    record.insert("status".to_string(), Value::String(status));

    let created = create_row(pool, "products", &record).await?;
    let entity_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&admin.id),
        "product.create",
        "products",
        Some(&entity_id),
        Some(created.clone()),
    )
    .await;

    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "product": present_product(created)})),
    ))
}

async fn update_product(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<UpdateProductInput>,
) -> AppResult<Json<Value>> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    let existing = get_row(pool, "products", &product_id, "id").await?;

    if let Some(name) = payload.name.as_deref() {
        if name.trim().is_empty() {
            return Err(AppError::BadRequest("name cannot be empty.".to_string()));
        }
    }
    if let Some(price) = payload.price {
        if price <= 0.0 {
            return Err(AppError::BadRequest("price must be positive.".to_string()));
        }
    }
    if let Some(stock) = payload.stock {
        if stock < 0 {
            return Err(AppError::BadRequest("stock cannot be negative.".to_string()));
        }
    }
    if let Some(status) = payload.status.as_deref() {
        if !PRODUCT_STATUSES.contains(&status) {
            return Err(AppError::BadRequest(format!(
                "Unknown product status '{status}'."
            )));
        }
    }

    let mut patch = remove_nulls(serialize_to_map(&payload));
    if let Some(stock) = payload.stock {
        let next = status_after_stock_change(
            payload.status.as_deref(),
            &value_str(&existing, "status"),
            stock,
        );
        patch.insert("status".to_string(), Value::String(next));
    }

    let updated = update_row(pool, "products", &product_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&admin.id),
        "product.update",
        "products",
        Some(&product_id),
        Some(json!({"before": existing, "after": updated})),
    )
    .await;

    Ok(Json(json!({
        "success": true,
        "product": present_product(updated),
    })))
}

async fn delete_product(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let admin = require_admin(&state, &headers)?;
    let pool = db_pool(&state)?;

    get_row(pool, "products", &product_id, "id").await?;

    // Soft delete. The row stays for order history; the storefront and
    // detail endpoint stop serving it.
    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("inactive".to_string()));
    let updated = update_row(pool, "products", &product_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&admin.id),
        "product.delete",
        "products",
        Some(&product_id),
        None,
    )
    .await;

    Ok(Json(json!({
        "success": true,
        "product": updated,
    })))
}

/// Stock wins unless the caller explicitly parks the product as inactive.
fn resolve_product_status(requested: Option<&str>, stock: i64) -> AppResult<String> {
    if let Some(requested) = requested.map(str::trim).filter(|value| !value.is_empty()) {
        if !PRODUCT_STATUSES.contains(&requested) {
            return Err(AppError::BadRequest(format!(
                "Unknown product status '{requested}'."
            )));
        }
        if requested == "inactive" {
            return Ok("inactive".to_string());
        }
    }
    Ok(derived_stock_status(stock).to_string())
}

fn status_after_stock_change(explicit: Option<&str>, current: &str, stock: i64) -> String {
    let keep_inactive = match explicit.map(str::trim).filter(|value| !value.is_empty()) {
        Some(status) => status == "inactive",
        None => current == "inactive",
    };
    if keep_inactive {
        "inactive".to_string()
    } else {
        derived_stock_status(stock).to_string()
    }
}

fn derived_stock_status(stock: i64) -> &'static str {
    if stock == 0 {
        "out-of-stock"
    } else {
        "active"
    }
}

fn present_product(mut product: Value) -> Value {
    let stock = product.get("stock").and_then(Value::as_i64).unwrap_or(0);
    let class = if stock == 0 {
        "out"
    } else if stock <= LOW_STOCK_THRESHOLD {
        "low"
    } else {
        "in"
    };
    if let Some(map) = product.as_object_mut() {
        map.insert("stock_status".to_string(), Value::String(class.to_string()));
    }
    product
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

#[cfg(test)]
mod tests {
    use super::{present_product, resolve_product_status, status_after_stock_change};
    use serde_json::{json, Value};

    #[test]
    fn new_products_derive_status_from_stock() {
        assert_eq!(resolve_product_status(None, 0).unwrap(), "out-of-stock");
        assert_eq!(resolve_product_status(None, 1).unwrap(), "active");
        assert_eq!(resolve_product_status(Some("active"), 0).unwrap(), "out-of-stock");
    }

    #[test]
    fn explicit_inactive_wins_over_stock() {
        assert_eq!(resolve_product_status(Some("inactive"), 25).unwrap(), "inactive");
        assert_eq!(
            status_after_stock_change(Some("inactive"), "active", 25),
            "inactive"
        );
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(resolve_product_status(Some("discontinued"), 5).is_err());
    }

    #[test]
    fn restock_reactivates_unless_soft_deleted() {
        assert_eq!(status_after_stock_change(None, "out-of-stock", 12), "active");
        assert_eq!(
            status_after_stock_change(None, "inactive", 12),
            "inactive"
        );
        assert_eq!(status_after_stock_change(None, "active", 0), "out-of-stock");
    }

    #[test]
    fn presented_products_carry_a_stock_class() {
        let product = present_product(json!({"name": "Fuse", "stock": 10}));
        assert_eq!(
            product.get("stock_status").and_then(Value::as_str),
            Some("low")
        );

        let empty = present_product(json!({"name": "Fuse", "stock": 0}));
        assert_eq!(
            empty.get("stock_status").and_then(Value::as_str),
            Some("out")
        );
    }
}
