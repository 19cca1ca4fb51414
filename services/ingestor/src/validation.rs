//! Request body validation.
//!
//! The body is parsed into a generic JSON value first so that every problem in
//! the batch can be reported with its location, instead of stopping at the
//! first serde error. Only a batch with no violations produces items.

use crate::models::IngestItem;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// One rejected field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    /// Location, e.g. `items[0].name`
    pub loc: String,
    /// Human-readable message
    pub msg: String,
    /// Machine-readable error kind
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl FieldError {
    fn new(loc: impl Into<String>, kind: &'static str, msg: impl Into<String>) -> Self {
        Self {
            loc: loc.into(),
            msg: msg.into(),
            kind,
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.loc, self.msg)
    }
}

/// All violations found in a request body
#[derive(Debug, Clone, PartialEq, Error)]
#[error("request failed validation with {} error(s)", .0.len())]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }
}

/// Parse and validate a raw `{"items": [...]}` body.
pub fn parse_batch(body: &[u8]) -> Result<Vec<IngestItem>, ValidationErrors> {
    let root: Value = serde_json::from_slice(body).map_err(|e| {
        ValidationErrors(vec![FieldError::new(
            "body",
            "json_invalid",
            format!("invalid JSON: {e}"),
        )])
    })?;

    let Value::Object(mut root) = root else {
        return Err(single("body", "dict_type", "body must be a JSON object"));
    };

    let items = match root.remove("items") {
        None | Some(Value::Null) => return Err(single("items", "missing", "field required")),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(single("items", "list_type", "items must be a list")),
    };

    if items.is_empty() {
        return Err(single(
            "items",
            "too_short",
            "items must contain at least 1 element",
        ));
    }

    let mut errors = Vec::new();
    let mut parsed = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        if let Some(item) = parse_item(index, item, &mut errors) {
            parsed.push(item);
        }
    }

    if errors.is_empty() {
        Ok(parsed)
    } else {
        Err(ValidationErrors(errors))
    }
}

fn single(loc: &str, kind: &'static str, msg: &str) -> ValidationErrors {
    ValidationErrors(vec![FieldError::new(loc, kind, msg)])
}

/// Validate one item, pushing violations into `errors`. Returns the item only
/// when it has none.
fn parse_item(index: usize, item: Value, errors: &mut Vec<FieldError>) -> Option<IngestItem> {
    let base = format!("items[{index}]");

    let Value::Object(mut fields) = item else {
        errors.push(FieldError::new(base, "dict_type", "item must be a JSON object"));
        return None;
    };

    let before = errors.len();

    let id = required_string(&mut fields, &base, "id", errors);
    let name = required_string(&mut fields, &base, "name", errors);
    let value = required_number(&mut fields, &base, "value", errors);
    let timestamp = optional_timestamp(&mut fields, &base, "timestamp", errors);
    let metadata = optional_object(&mut fields, &base, "metadata", errors);

    if errors.len() > before {
        return None;
    }

    Some(IngestItem {
        id: id?,
        name: name?,
        value: value?,
        timestamp,
        metadata: metadata.unwrap_or_default(),
    })
}

fn required_string(
    fields: &mut Map<String, Value>,
    base: &str,
    key: &str,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    let loc = format!("{base}.{key}");
    match fields.remove(key) {
        None | Some(Value::Null) => {
            errors.push(FieldError::new(loc, "missing", "field required"));
            None
        }
        Some(Value::String(s)) if s.is_empty() => {
            errors.push(FieldError::new(
                loc,
                "string_too_short",
                "string must not be empty",
            ));
            None
        }
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            errors.push(FieldError::new(loc, "string_type", "value must be a string"));
            None
        }
    }
}

fn required_number(
    fields: &mut Map<String, Value>,
    base: &str,
    key: &str,
    errors: &mut Vec<FieldError>,
) -> Option<f64> {
    let loc = format!("{base}.{key}");
    match fields.remove(key) {
        None | Some(Value::Null) => {
            errors.push(FieldError::new(loc, "missing", "field required"));
            None
        }
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v.is_finite() => Some(v),
            _ => {
                errors.push(FieldError::new(loc, "finite_number", "value must be finite"));
                None
            }
        },
        Some(_) => {
            errors.push(FieldError::new(loc, "float_type", "value must be a number"));
            None
        }
    }
}

fn optional_timestamp(
    fields: &mut Map<String, Value>,
    base: &str,
    key: &str,
    errors: &mut Vec<FieldError>,
) -> Option<DateTime<Utc>> {
    let loc = format!("{base}.{key}");
    match fields.remove(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => match parse_timestamp(&raw) {
            Some(ts) => Some(ts),
            None => {
                errors.push(FieldError::new(
                    loc,
                    "datetime_parsing",
                    format!("invalid ISO-8601 date-time: {raw}"),
                ));
                None
            }
        },
        Some(_) => {
            errors.push(FieldError::new(
                loc,
                "datetime_type",
                "timestamp must be an ISO-8601 string",
            ));
            None
        }
    }
}

fn optional_object(
    fields: &mut Map<String, Value>,
    base: &str,
    key: &str,
    errors: &mut Vec<FieldError>,
) -> Option<Map<String, Value>> {
    let loc = format!("{base}.{key}");
    match fields.remove(key) {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            errors.push(FieldError::new(loc, "dict_type", "metadata must be an object"));
            None
        }
    }
}

/// Accepts ISO-8601 date-times, with or without an offset, and bare dates.
///
/// The date/time separator may be `T` or a space. Values without an offset
/// are taken as UTC; a bare date is midnight UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if raw.len() == 10 {
        return NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc());
    }

    let normalized: Cow<'_, str> = if raw.as_bytes().get(10) == Some(&b' ') {
        Cow::Owned(format!("{}T{}", &raw[..10], &raw[11..]))
    } else {
        Cow::Borrowed(raw)
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M"))
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn kinds(err: &ValidationErrors) -> Vec<(&str, &str)> {
        err.errors()
            .iter()
            .map(|e| (e.loc.as_str(), e.kind))
            .collect()
    }

    #[test]
    fn test_valid_batch() {
        let body = br#"{"items":[
            {"id":"test-1","name":"Test Item 1","value":10.5,"metadata":{"category":"test"}},
            {"id":"test-2","name":"Another Test Item!","value":25,"timestamp":"2024-01-01T12:00:00Z"}
        ]}"#;

        let items = parse_batch(body).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "test-1");
        assert_eq!(items[0].metadata["category"], "test");
        assert_eq!(items[0].timestamp, None);
        assert_eq!(items[1].value, 25.0);
        assert!(items[1].metadata.is_empty());
        assert_eq!(
            items[1].timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_missing_name() {
        let err = parse_batch(br#"{"items":[{"id":"test-1","value":10.0}]}"#).unwrap_err();
        assert_eq!(kinds(&err), vec![("items[0].name", "missing")]);
    }

    #[test]
    fn test_empty_items_list() {
        let err = parse_batch(br#"{"items":[]}"#).unwrap_err();
        assert_eq!(kinds(&err), vec![("items", "too_short")]);
    }

    #[test]
    fn test_missing_items_key() {
        let err = parse_batch(br#"{"records":[]}"#).unwrap_err();
        assert_eq!(kinds(&err), vec![("items", "missing")]);
    }

    #[test]
    fn test_invalid_json() {
        let err = parse_batch(b"{not json").unwrap_err();
        assert_eq!(kinds(&err), vec![("body", "json_invalid")]);
    }

    #[test]
    fn test_reports_every_violation() {
        let body = br#"{"items":[
            {"id":"","name":"ok","value":"12"},
            {"id":"b","name":7,"value":1,"timestamp":"yesterday","metadata":[1]},
            "not-an-object"
        ]}"#;

        let err = parse_batch(body).unwrap_err();
        assert_eq!(
            kinds(&err),
            vec![
                ("items[0].id", "string_too_short"),
                ("items[0].value", "float_type"),
                ("items[1].name", "string_type"),
                ("items[1].timestamp", "datetime_parsing"),
                ("items[1].metadata", "dict_type"),
                ("items[2]", "dict_type"),
            ]
        );
    }

    #[test]
    fn test_naive_timestamp_is_utc() {
        let body = br#"{"items":[{"id":"a","name":"n","value":1,"timestamp":"2024-03-01T08:15:00.5"}]}"#;
        let items = parse_batch(body).unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 8, 15, 0).unwrap()
            + chrono::Duration::milliseconds(500);
        assert_eq!(items[0].timestamp, Some(expected));
    }

    #[test]
    fn test_timestamp_grammar() {
        let noon = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        for (raw, expected) in [
            ("2024-01-01T12:00:00Z", noon),
            ("2024-01-01 12:00:00Z", noon),
            ("2024-01-01 14:00:00+02:00", noon),
            ("2024-01-01 12:00:00", noon),
            ("2024-01-01T12:00", noon),
            ("2024-01-01", midnight),
        ] {
            assert_eq!(parse_timestamp(raw), Some(expected), "{raw}");
        }

        for raw in ["2024-13-01", "2024-01-01X12:00:00", "01/01/2024", ""] {
            assert_eq!(parse_timestamp(raw), None, "{raw}");
        }
    }

    #[test]
    fn test_date_only_timestamp_accepted() {
        let body = br#"{"items":[{"id":"a","name":"n","value":1,"timestamp":"2024-01-01"}]}"#;
        let items = parse_batch(body).unwrap();
        assert_eq!(
            items[0].timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let body = br#"{"items":[{"id":"a","name":"n","value":-3,"sk":"spoofed","received_at":"2000-01-01T00:00:00Z"}]}"#;
        let items = parse_batch(body).unwrap();
        assert_eq!(items[0].value, -3.0);
    }
}
