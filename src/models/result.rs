// Result dictionaries produced by the workflow stages

//! # Results
//!
//! A result is a plain JSON object. Routing metadata lives under reserved keys:
//!
//! - `_type`: dot-joined classification (`obd.rpm`, `event.system.power.sleep`)
//! - `_stamp`: ISO-8601 UTC timestamp, assigned by the first stage lacking one
//! - `value` or `values`: the wrapped payload of scalar and sequence returns
//! - `error`: a soft failure summary
//!
//! Results bound for the cloud are [`flatten`]ed and then rewritten into the
//! uplink envelope by [`to_cloud_envelope`].

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use super::message::is_reserved;

/// A result dictionary
pub type ResultMap = Map<String, Value>;

pub const TYPE: &str = "_type";
pub const STAMP: &str = "_stamp";
pub const VALUE: &str = "value";
pub const VALUES: &str = "values";
pub const ERROR: &str = "error";

/// Current UTC time as ISO-8601 with microsecond precision
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Wrap a handler return value into a result dictionary
///
/// scalar → `{value}`, sequence → `{values}`, mapping → verbatim, null → `{}`
pub fn wrap(returned: Value) -> ResultMap {
    match returned {
        Value::Null => ResultMap::new(),
        Value::Object(map) => map,
        Value::Array(items) => {
            let mut result = ResultMap::new();
            result.insert(VALUES.to_string(), Value::Array(items));
            result
        }
        scalar => {
            let mut result = ResultMap::new();
            result.insert(VALUE.to_string(), scalar);
            result
        }
    }
}

/// Build an `{error}` result for the given failure
pub fn error_result(error: &crate::EdmpError) -> ResultMap {
    let mut result = ResultMap::new();
    result.insert(ERROR.to_string(), Value::String(error.to_string()));
    result
}

/// The soft failure of a result, if any
pub fn error_of(result: &ResultMap) -> Option<&str> {
    match result.get(ERROR) {
        Some(Value::String(message)) => Some(message),
        Some(Value::Null) | None => None,
        Some(_) => Some("error"),
    }
}

/// Set `_type` (if missing) and `_stamp` (if missing)
pub fn ensure_envelope(result: &mut ResultMap, default_type: &str) {
    if !matches!(result.get(TYPE), Some(Value::String(_))) {
        result.insert(TYPE.to_string(), Value::String(default_type.to_string()));
    }
    if !matches!(result.get(STAMP), Some(Value::String(_))) {
        result.insert(STAMP.to_string(), Value::String(timestamp_now()));
    }
}

pub fn type_of(result: &ResultMap) -> Option<&str> {
    result.get(TYPE).and_then(Value::as_str)
}

/// Payload fields of a result (everything that is not a reserved key)
pub fn payload(result: &ResultMap) -> ResultMap {
    result
        .iter()
        .filter(|(key, _)| !is_reserved(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Recursively flatten a result for the cloud
///
/// When the payload consists of a single key holding a list, every element
/// becomes its own result sharing the parent's reserved keys. A child that
/// carries its own `_type` gets it appended to the parent's with a dot.
/// Scalar elements are wrapped as `{value}`.
pub fn flatten(result: ResultMap) -> Vec<ResultMap> {
    let data = payload(&result);
    let list_key = match data.iter().next() {
        Some((key, Value::Array(_))) if data.len() == 1 => key.clone(),
        _ => return vec![result],
    };

    let mut header = result;
    let items = match header.remove(&list_key) {
        Some(Value::Array(items)) => items,
        _ => return vec![header],
    };
    let parent_type = type_of(&header).map(str::to_string);

    let mut flattened = Vec::new();
    for item in items {
        let mut child = wrap(item);
        let child_type = child
            .remove(TYPE)
            .and_then(|value| value.as_str().map(str::to_string));

        let mut merged = header.clone();
        let combined = match (&parent_type, child_type) {
            (Some(parent), Some(own)) => Some(format!("{}.{}", parent, own)),
            (Some(parent), None) => Some(parent.clone()),
            (None, own) => own,
        };
        if let Some(combined) = combined {
            merged.insert(TYPE.to_string(), Value::String(combined));
        }
        for (key, value) in child {
            merged.insert(key, value);
        }
        flattened.extend(flatten(merged));
    }
    flattened
}

/// Rewrite a result into the cloud uplink envelope
///
/// `_type` becomes `@t`, `_stamp` becomes `@ts`, other reserved keys are dropped.
pub fn to_cloud_envelope(result: &ResultMap) -> Value {
    let mut envelope = Map::new();
    if let Some(stamp) = result.get(STAMP) {
        envelope.insert("@ts".to_string(), stamp.clone());
    }
    if let Some(kind) = result.get(TYPE) {
        envelope.insert("@t".to_string(), kind.clone());
    }
    for (key, value) in result {
        if !is_reserved(key) {
            envelope.insert(key.clone(), value.clone());
        }
    }
    Value::Object(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> ResultMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_wrap_rule() {
        assert_eq!(Value::Object(wrap(json!(850))), json!({"value": 850}));
        assert_eq!(Value::Object(wrap(json!([1, 2]))), json!({"values": [1, 2]}));
        assert_eq!(Value::Object(wrap(json!({"a": 1}))), json!({"a": 1}));
        assert!(wrap(Value::Null).is_empty());
    }

    #[test]
    fn test_ensure_envelope_keeps_existing_type() {
        let mut result = map(json!({"_type": "rpm", "value": 850}));
        ensure_envelope(&mut result, "query");
        assert_eq!(result["_type"], json!("rpm"));
        assert!(result["_stamp"].as_str().unwrap().ends_with('Z'));

        let mut bare = ResultMap::new();
        ensure_envelope(&mut bare, "query");
        assert_eq!(bare["_type"], json!("query"));
    }

    #[test]
    fn test_flatten_single_list_key() {
        let result = map(json!({
            "_type": "obd",
            "_stamp": "2024-01-01T00:00:00.000000Z",
            "values": [
                {"_type": "rpm", "value": 850},
                {"_type": "speed", "value": 42},
                7,
            ],
        }));
        let flat = flatten(result);
        assert_eq!(flat.len(), 3);
        assert_eq!(flat[0]["_type"], json!("obd.rpm"));
        assert_eq!(flat[1]["_type"], json!("obd.speed"));
        assert_eq!(flat[2]["_type"], json!("obd"));
        assert_eq!(flat[2]["value"], json!(7));
        assert!(flat.iter().all(|r| r["_stamp"] == json!("2024-01-01T00:00:00.000000Z")));
    }

    #[test]
    fn test_flatten_is_recursive() {
        let result = map(json!({
            "_type": "acc",
            "values": [{"_type": "xyz", "values": [{"x": 1}, {"x": 2}]}],
        }));
        let flat = flatten(result);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0]["_type"], json!("acc.xyz"));
        assert_eq!(flat[1]["x"], json!(2));
    }

    #[test]
    fn test_flatten_leaves_regular_results_alone() {
        let result = map(json!({"_type": "bat", "state": "charging", "levels": [1, 2]}));
        assert_eq!(flatten(result.clone()), vec![result]);
    }

    #[test]
    fn test_cloud_envelope() {
        let result = map(json!({
            "_type": "obd.rpm",
            "_stamp": "2024-01-01T00:00:00.000000Z",
            "_internal": true,
            "value": 850,
        }));
        assert_eq!(
            to_cloud_envelope(&result),
            json!({"@t": "obd.rpm", "@ts": "2024-01-01T00:00:00.000000Z", "value": 850})
        );
    }

    #[test]
    fn test_error_of() {
        assert_eq!(error_of(&map(json!({"error": "boom"}))), Some("boom"));
        assert_eq!(error_of(&map(json!({"value": 1}))), None);
    }
}
