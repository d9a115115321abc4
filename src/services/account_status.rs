use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

/// Days without a login before an account reads as INACTIVE.
pub const INACTIVITY_WINDOW_DAYS: i64 = 60;

/// Role strings that mean "storefront customer". Legacy rows imported from
/// the first release carry `user`.
pub const CUSTOMER_ROLES: &[&str] = &["customer", "user"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Inactive,
    Suspended,
    Blocked,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Suspended => "SUSPENDED",
            Self::Blocked => "BLOCKED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Some(Self::Active),
            "INACTIVE" => Some(Self::Inactive),
            "SUSPENDED" => Some(Self::Suspended),
            "BLOCKED" => Some(Self::Blocked),
            _ => None,
        }
    }
}

/// Full derivation output: the effective status plus the companion fields
/// consumers render next to it (reason, who changed it, when, and the
/// suspension expiry that applied).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAccount {
    pub status: AccountStatus,
    pub reason: Option<String>,
    pub changed_at: Option<String>,
    pub changed_by: Option<String>,
    pub suspension_until: Option<String>,
}

/// The one place account status is derived. Every consumer (admin lists, the
/// users report, exports, filters) goes through here.
///
/// First matching rule wins: BLOCKED always reads BLOCKED; a stored
/// SUSPENDED reads ACTIVE once its expiry has passed ("Suspension period
/// ended") and SUSPENDED otherwise, expiry set or not; then a login older
/// than the 60-day window reads INACTIVE; everything else, including
/// accounts that never logged in, reads ACTIVE. A missing or unrecognized
/// stored status drops straight to the recency rules.
pub fn derive_account(user: &Value, now: DateTime<Utc>) -> DerivedAccount {
    let stored = user
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_ascii_uppercase();
    let stored_reason = str_field(user, "status_reason");
    let stored_changed_at = str_field(user, "status_changed_at");
    let stored_changed_by = str_field(user, "status_changed_by");
    let stored_until = str_field(user, "suspension_until");

    if stored == "BLOCKED" {
        return DerivedAccount {
            status: AccountStatus::Blocked,
            reason: stored_reason.or_else(|| Some("Account blocked by admin".to_string())),
            changed_at: stored_changed_at,
            changed_by: stored_changed_by,
            suspension_until: stored_until,
        };
    }

    if stored == "SUSPENDED" {
        // Nothing writes the recomputed status back, so an expired
        // suspension keeps answering ACTIVE on every later read.
        if matches!(datetime_field(user, "suspension_until"), Some(until) if until <= now) {
            return DerivedAccount {
                status: AccountStatus::Active,
                reason: Some("Suspension period ended".to_string()),
                changed_at: stored_changed_at,
                changed_by: Some("system".to_string()),
                suspension_until: stored_until,
            };
        }
        return DerivedAccount {
            status: AccountStatus::Suspended,
            reason: stored_reason.or_else(|| Some("Account temporarily suspended".to_string())),
            changed_at: stored_changed_at,
            changed_by: stored_changed_by,
            suspension_until: stored_until,
        };
    }

    if let Some(last_login) = datetime_field(user, "last_login_at") {
        if now - last_login > Duration::days(INACTIVITY_WINDOW_DAYS) {
            return DerivedAccount {
                status: AccountStatus::Inactive,
                reason: Some("No activity for 60+ days".to_string()),
                changed_at: str_field(user, "last_login_at"),
                changed_by: Some("system".to_string()),
                suspension_until: stored_until,
            };
        }
    }

    DerivedAccount {
        status: AccountStatus::Active,
        reason: stored_reason,
        changed_at: stored_changed_at,
        changed_by: stored_changed_by,
        suspension_until: stored_until,
    }
}

pub fn derive_status(user: &Value, now: DateTime<Utc>) -> AccountStatus {
    derive_account(user, now).status
}

/// Attaches the derived `actual_*` fields and drops credential fields before
/// a user row leaves the service.
pub fn present_user(mut user: Value, now: DateTime<Utc>) -> Value {
    let derived = derive_account(&user, now);
    if let Some(map) = user.as_object_mut() {
        map.insert(
            "actual_status".to_string(),
            Value::String(derived.status.as_str().to_string()),
        );
        map.insert(
            "actual_status_reason".to_string(),
            opt_string(derived.reason),
        );
        map.insert(
            "actual_status_changed_at".to_string(),
            opt_string(derived.changed_at),
        );
        map.insert(
            "actual_status_changed_by".to_string(),
            opt_string(derived.changed_by),
        );
        map.insert(
            "actual_suspension_until".to_string(),
            opt_string(derived.suspension_until),
        );
        map.remove("password_hash");
    }
    user
}

fn opt_string(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

fn str_field(row: &Value, field: &str) -> Option<String> {
    row.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(ToOwned::to_owned)
}

fn datetime_field(row: &Value, field: &str) -> Option<DateTime<Utc>> {
    row.get(field)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}
