use serde_json::{json, Map, Value};

use crate::repository::table_service::create_row;

/// Best-effort audit trail for admin mutations. Failures are logged and
/// swallowed; an audit miss must never fail the request that caused it.
pub async fn write_audit_log(
    pool: Option<&sqlx::PgPool>,
    actor_id: Option<&str>,
    action: &str,
    entity: &str,
    entity_id: Option<&str>,
    detail: Option<Value>,
) {
    let Some(pool) = pool else {
        return;
    };

    let mut record = Map::new();
    record.insert("action".to_string(), json!(action));
    record.insert("entity".to_string(), json!(entity));
    if let Some(actor_id) = actor_id {
        record.insert("actor_id".to_string(), json!(actor_id));
    }
    if let Some(entity_id) = entity_id {
        record.insert("entity_id".to_string(), json!(entity_id));
    }
    if let Some(detail) = detail {
        record.insert("detail".to_string(), detail);
    }

    if let Err(error) = create_row(pool, "audit_logs", &record).await {
        tracing::warn!(action, entity, error = %error, "Audit log write failed");
    }
}
