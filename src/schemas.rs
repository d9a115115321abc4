use axum::extract::rejection::QueryRejection;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::Deserialize;
use serde_json::{Map, Value};
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::BadRequest(format!("Validation failed: {errors}")))
}

/// Query extractor that turns deserialization failures into the standard
/// error envelope instead of a bare 400. A malformed number or boolean in
/// the query string must fail the request, never be silently dropped.
pub struct AppQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for AppQuery<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(map_query_rejection(rejection)),
        }
    }
}

fn map_query_rejection(rejection: QueryRejection) -> AppError {
    AppError::BadRequest(format!("Invalid query string: {}", rejection.body_text()))
}

fn default_page_1() -> i64 {
    1
}
fn default_limit_20() -> i64 {
    20
}
fn default_limit_100() -> i64 {
    100
}
fn default_history_limit() -> i64 {
    10
}
fn default_days_old() -> i64 {
    90
}
fn default_false() -> bool {
    false
}
fn default_category_info() -> String {
    "Info".to_string()
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesReportQuery {
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub status: Option<String>,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrdersReportQuery {
    pub search: Option<String>,
    pub status: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentsReportQuery {
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub payment_method: Option<String>,
    pub status: Option<String>,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReportQuery {
    pub category: Option<String>,
    pub stock_status: Option<String>,
    pub search: Option<String>,
    pub min_stock: Option<i64>,
    pub max_stock: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomersReportQuery {
    pub search: Option<String>,
    pub account_status: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub min_orders: Option<i64>,
    pub max_orders: Option<i64>,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsersReportQuery {
    pub search: Option<String>,
    pub account_status: Option<String>,
    pub role: Option<String>,
    pub min_orders: Option<i64>,
    pub max_orders: Option<i64>,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    #[serde(default = "default_page_1")]
    pub page: i64,
    #[serde(default = "default_limit_20")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ReportHistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct GenerateReportInput {
    #[serde(rename = "type")]
    pub report_type: String,
    #[serde(default)]
    pub filters: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReportsInput {
    #[serde(default = "default_days_old")]
    pub days_old: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicProductsQuery {
    pub search: Option<String>,
    pub category: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub featured: Option<bool>,
    #[serde(default = "default_page_1")]
    pub page: i64,
    #[serde(default = "default_limit_20")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub description: Option<String>,
    #[validate(range(min = 0.01))]
    pub price: f64,
    #[validate(length(min = 1, max = 100))]
    pub category: String,
    pub brand: Option<String>,
    pub image: Option<String>,
    pub images: Option<Vec<String>>,
    #[validate(range(min = 0))]
    pub stock: i64,
    pub specifications: Option<Value>,
    #[serde(default = "default_false")]
    pub featured: bool,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProductInput {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub image: Option<String>,
    pub images: Option<Vec<String>>,
    pub stock: Option<i64>,
    pub specifications: Option<Value>,
    pub featured: Option<bool>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminOrdersQuery {
    pub status: Option<String>,
    pub payment_method: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    #[serde(default = "default_page_1")]
    pub page: i64,
    #[serde(default = "default_limit_20")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateOrderStatusInput {
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct OwnOrdersQuery {
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUsersQuery {
    pub search: Option<String>,
    pub role: Option<String>,
    pub account_status: Option<String>,
    #[serde(default = "default_page_1")]
    pub page: i64,
    #[serde(default = "default_limit_20")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserStatusInput {
    pub status: String,
    pub reason: Option<String>,
    pub suspension_until: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageInput {
    pub user_id: String,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(min = 1, max = 2000))]
    pub message: String,
    #[serde(default = "default_category_info")]
    pub category: String,
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct MessagesQuery {
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

pub fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, 500)
}

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

pub fn serialize_to_map<T>(value: &T) -> Map<String, Value>
where
    T: serde::Serialize,
{
    let json = serde_json::to_value(value).unwrap_or_else(|_| Value::Object(Map::new()));
    json.as_object().cloned().unwrap_or_default()
}

pub fn remove_nulls(mut map: Map<String, Value>) -> Map<String, Value> {
    map.retain(|_, value| !value.is_null());
    map
}
