use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::AppError;

pub fn parse_date(raw: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest("Invalid ISO date.".to_string()))
}

pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    Utc.from_utc_datetime(&naive)
}

/// Upper bounds are inclusive of the whole day, so a dateTo of 2025-01-31
/// still matches an order placed at 18:00 that evening.
pub fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_hms_milli_opt(23, 59, 59, 999).unwrap_or_default();
    Utc.from_utc_datetime(&naive)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DateWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

pub fn resolve_window(
    date_from: Option<&str>,
    date_to: Option<&str>,
) -> Result<DateWindow, AppError> {
    let from = date_from
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(parse_date)
        .transpose()?
        .map(start_of_day);
    let to = date_to
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(parse_date)
        .transpose()?
        .map(end_of_day);

    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(AppError::BadRequest(
                "dateFrom must be on or before dateTo.".to_string(),
            ));
        }
    }

    Ok(DateWindow { from, to })
}

impl DateWindow {
    pub fn apply(&self, filters: &mut Map<String, Value>, column: &str) {
        if let Some(from) = self.from {
            filters.insert(
                format!("{column}__gte"),
                Value::String(from.to_rfc3339()),
            );
        }
        if let Some(to) = self.to {
            filters.insert(format!("{column}__lte"), Value::String(to.to_rfc3339()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{end_of_day, parse_date, resolve_window};
    use crate::error::AppError;
    use serde_json::Map;

    #[test]
    fn rejects_malformed_dates_with_specific_message() {
        let error = parse_date("31-01-2025").expect_err("must fail");
        match error {
            AppError::BadRequest(message) => assert_eq!(message, "Invalid ISO date."),
            other => panic!("expected BadRequest, got {other:?}"),
        }
        assert!(parse_date("2025-13-40").is_err());
        assert!(parse_date("soon").is_err());
    }

    #[test]
    fn upper_bound_covers_the_whole_day() {
        let window = resolve_window(Some("2025-01-01"), Some("2025-01-31")).expect("valid");
        let to = window.to.expect("upper bound present");
        assert!(to.to_rfc3339().contains("23:59:59.999"));

        let evening_order = super::start_of_day(parse_date("2025-01-31").expect("valid"))
            + chrono::Duration::hours(18);
        assert!(evening_order <= to);
    }

    #[test]
    fn same_day_range_is_valid_and_reversed_is_not() {
        assert!(resolve_window(Some("2025-03-05"), Some("2025-03-05")).is_ok());
        assert!(matches!(
            resolve_window(Some("2025-03-06"), Some("2025-03-05")),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn blank_bounds_are_ignored() {
        let window = resolve_window(Some("  "), None).expect("valid");
        assert!(window.from.is_none());
        assert!(window.to.is_none());
    }

    #[test]
    fn apply_writes_range_filter_keys() {
        let window = resolve_window(Some("2025-01-01"), Some("2025-01-31")).expect("valid");
        let mut filters = Map::new();
        window.apply(&mut filters, "created_at");
        assert!(filters.contains_key("created_at__gte"));
        assert!(filters.contains_key("created_at__lte"));
    }

    #[test]
    fn boundary_milliseconds_survive_round_trip() {
        let to = end_of_day(parse_date("2025-02-28").expect("valid"));
        let parsed = chrono::DateTime::parse_from_rfc3339(&to.to_rfc3339()).expect("parses");
        assert_eq!(parsed.timestamp_millis(), to.timestamp_millis());
    }
}
