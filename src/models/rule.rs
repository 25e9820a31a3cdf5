// Matcher grammar for listeners and reactors

//! # Rules Module
//!
//! This module defines the small condition grammar listeners and reactors use
//! to decide whether they fire. A rule is evaluated against one JSON subject:
//! a result dictionary for listeners, an `{tag, data, timestamp}` object for
//! reactors. No code is ever executed; conditions are plain data that can live
//! in configuration files.
//!
//! ## Key Concepts
//!
//! - **Rule**: A single evaluatable condition with an ID and description
//! - **RuleCondition**: The actual logic - field checks, glob matches, logical operations
//!
//! Field names are dotted paths, so `data.state` reaches into nested objects.
//!
//! ## Rust Learning Notes:
//!
//! ### Recursive Enums
//! The `RuleCondition` enum is recursive - `And` and `Or` variants contain
//! vectors of `Rule` structs, which themselves contain `RuleCondition` enums.
//! This enables arbitrarily complex logical expressions.
//!
//! ### Serde Tag for JSON Serialization
//! The `#[serde(tag = "type")]` attribute creates "tagged union" JSON.
//! Instead of nested objects, it creates flat objects with a "type" field:
//! `{"type": "FieldEquals", "field": "_type", "value": "rpm"}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::{glob_match, lookup_path};

/// A single rule that can be evaluated against a result or an event
///
/// ## Examples:
///
/// **Simple field check**:
/// ```
/// use edmp::models::{Rule, RuleCondition};
///
/// Rule {
///     id: "is_rpm".to_string(),
///     description: "Result carries an RPM reading".to_string(),
///     condition: RuleCondition::FieldEquals {
///         field: "_type".to_string(),
///         value: serde_json::json!("rpm"),
///     },
/// };
/// ```
///
/// **Event matcher**:
/// ```
/// use edmp::models::Rule;
///
/// let rule = Rule::tag_matches("sleeping", "system/power/sleep");
/// assert!(rule.evaluate(&serde_json::json!({"tag": "system/power/sleep"})));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Identifier used in logs and detailed evaluation results
    pub id: String,

    #[serde(default)]
    pub description: String,

    pub condition: RuleCondition,
}

/// Different types of conditions that can be evaluated
///
/// ## Rust Learning Notes:
///
/// ### Box<Rule> for Recursion
/// The `Not` variant uses `Box<Rule>` because Rust enums must have a known size.
/// Since `Rule` contains `RuleCondition` which contains `Rule`, we need `Box`
/// to break the infinite size chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuleCondition {
    /// Always passes; a catch-all matcher
    Always,

    /// Check if a field exists (regardless of value)
    ///
    /// Example: `{"type": "FieldExists", "field": "value"}`
    FieldExists { field: String },

    /// Check if a field has a specific value
    ///
    /// Example: `{"type": "FieldEquals", "field": "_type", "value": "rpm"}`
    FieldEquals { field: String, value: Value },

    /// Check if a numeric field is greater than a threshold
    ///
    /// Example: `{"type": "FieldGreaterThan", "field": "value", "value": 0.0}`
    FieldGreaterThan { field: String, value: f64 },

    /// Check if a numeric field is less than a threshold
    FieldLessThan { field: String, value: f64 },

    /// Check if a string field contains a substring (case-sensitive)
    FieldContains { field: String, substring: String },

    /// Check a string field against a `*`/`?` glob
    ///
    /// Example: `{"type": "FieldMatches", "field": "tag", "pattern": "vehicle/position/*"}`
    FieldMatches { field: String, pattern: String },

    /// Logical AND - all nested rules must pass; empty passes
    And { rules: Vec<Rule> },

    /// Logical OR - at least one nested rule must pass; empty fails
    Or { rules: Vec<Rule> },

    /// Logical NOT
    Not { rule: Box<Rule> },
}

impl Rule {
    /// Evaluate this rule against a JSON subject
    pub fn evaluate(&self, subject: &Value) -> bool {
        self.condition.evaluate(subject)
    }
}

impl RuleCondition {
    /// Evaluate the condition against a subject
    ///
    /// ## Rust Learning Notes:
    ///
    /// ### Option Chaining with and_then
    /// We use `.and_then()` for chaining Option operations. It only continues
    /// if the previous step returned `Some(value)`.
    pub fn evaluate(&self, subject: &Value) -> bool {
        match self {
            RuleCondition::Always => true,

            RuleCondition::FieldExists { field } => lookup_path(subject, field).is_some(),

            RuleCondition::FieldEquals { field, value } => {
                lookup_path(subject, field).map_or(false, |found| numeric_eq(found, value))
            }

            RuleCondition::FieldGreaterThan { field, value } => lookup_path(subject, field)
                .and_then(Value::as_f64)
                .map_or(false, |v| v > *value),

            RuleCondition::FieldLessThan { field, value } => lookup_path(subject, field)
                .and_then(Value::as_f64)
                .map_or(false, |v| v < *value),

            RuleCondition::FieldContains { field, substring } => lookup_path(subject, field)
                .and_then(Value::as_str)
                .map_or(false, |v| v.contains(substring.as_str())),

            RuleCondition::FieldMatches { field, pattern } => lookup_path(subject, field)
                .and_then(Value::as_str)
                .map_or(false, |v| glob_match(pattern, v)),

            RuleCondition::And { rules } => rules.iter().all(|rule| rule.evaluate(subject)),

            RuleCondition::Or { rules } => rules.iter().any(|rule| rule.evaluate(subject)),

            RuleCondition::Not { rule } => !rule.evaluate(subject),
        }
    }
}

/// JSON equality where `850` and `850.0` compare equal
fn numeric_eq(found: &Value, expected: &Value) -> bool {
    match (found.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) if found.is_number() && expected.is_number() => a == b,
        _ => found == expected,
    }
}

// Builder methods for easier rule construction
impl Rule {
    pub fn always(id: &str) -> Self {
        Rule {
            id: id.to_string(),
            description: "Always matches".to_string(),
            condition: RuleCondition::Always,
        }
    }

    /// ```
    /// use edmp::models::Rule;
    ///
    /// let rule = Rule::field_exists("has_value", "value");
    /// ```
    pub fn field_exists(id: &str, field: &str) -> Self {
        Rule {
            id: id.to_string(),
            description: format!("Field '{}' must exist", field),
            condition: RuleCondition::FieldExists {
                field: field.to_string(),
            },
        }
    }

    /// ```
    /// use edmp::models::Rule;
    ///
    /// let rule = Rule::field_equals("is_rpm", "_type", serde_json::json!("rpm"));
    /// ```
    pub fn field_equals(id: &str, field: &str, value: Value) -> Self {
        Rule {
            id: id.to_string(),
            description: format!("Field '{}' must equal {}", field, value),
            condition: RuleCondition::FieldEquals {
                field: field.to_string(),
                value,
            },
        }
    }

    pub fn field_greater_than(id: &str, field: &str, value: f64) -> Self {
        Rule {
            id: id.to_string(),
            description: format!("Field '{}' must be greater than {}", field, value),
            condition: RuleCondition::FieldGreaterThan {
                field: field.to_string(),
                value,
            },
        }
    }

    pub fn field_less_than(id: &str, field: &str, value: f64) -> Self {
        Rule {
            id: id.to_string(),
            description: format!("Field '{}' must be less than {}", field, value),
            condition: RuleCondition::FieldLessThan {
                field: field.to_string(),
                value,
            },
        }
    }

    pub fn field_matches(id: &str, field: &str, pattern: &str) -> Self {
        Rule {
            id: id.to_string(),
            description: format!("Field '{}' must match '{}'", field, pattern),
            condition: RuleCondition::FieldMatches {
                field: field.to_string(),
                pattern: pattern.to_string(),
            },
        }
    }

    /// Match an event's tag against a glob
    pub fn tag_matches(id: &str, pattern: &str) -> Self {
        Self::field_matches(id, "tag", pattern)
    }

    pub fn and(id: &str, description: &str, rules: Vec<Rule>) -> Self {
        Rule {
            id: id.to_string(),
            description: description.to_string(),
            condition: RuleCondition::And { rules },
        }
    }

    pub fn or(id: &str, description: &str, rules: Vec<Rule>) -> Self {
        Rule {
            id: id.to_string(),
            description: description.to_string(),
            condition: RuleCondition::Or { rules },
        }
    }

    pub fn not(id: &str, description: &str, rule: Rule) -> Self {
        Rule {
            id: id.to_string(),
            description: description.to_string(),
            condition: RuleCondition::Not {
                rule: Box::new(rule),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_equals_on_result() {
        let rule = Rule::field_equals("is_rpm", "_type", json!("rpm"));
        assert!(rule.evaluate(&json!({"_type": "rpm", "value": 850})));
        assert!(!rule.evaluate(&json!({"_type": "speed", "value": 42})));
        assert!(!rule.evaluate(&json!({"value": 850})));
    }

    #[test]
    fn test_numeric_equality_ignores_representation() {
        let rule = Rule::field_equals("idle", "value", json!(850));
        assert!(rule.evaluate(&json!({"value": 850.0})));
    }

    #[test]
    fn test_dotted_paths_into_event_data() {
        let rule = Rule::and(
            "standstill_discharging",
            "Standstill while discharging",
            vec![
                Rule::tag_matches("tag", "vehicle/position/*"),
                Rule::field_equals("state", "data.state", json!("standstill")),
            ],
        );
        let event = json!({"tag": "vehicle/position/standstill", "data": {"state": "standstill"}});
        assert!(rule.evaluate(&event));

        let other = json!({"tag": "vehicle/geofence/inside", "data": {"state": "standstill"}});
        assert!(!rule.evaluate(&other));
    }

    #[test]
    fn test_or_and_not() {
        let rule = Rule::or(
            "power_change",
            "Sleep or hibernate",
            vec![
                Rule::tag_matches("sleep", "system/power/sleep"),
                Rule::tag_matches("hibernate", "system/power/hibernate"),
            ],
        );
        assert!(rule.evaluate(&json!({"tag": "system/power/hibernate"})));
        assert!(!rule.evaluate(&json!({"tag": "system/power/on"})));

        let negated = Rule::not("not_power", "Anything but power", rule);
        assert!(negated.evaluate(&json!({"tag": "engine/running"})));
        assert!(Rule::and("empty", "", vec![]).evaluate(&json!({})));
        assert!(!Rule::or("empty", "", vec![]).evaluate(&json!({})));
    }

    #[test]
    fn test_numeric_comparisons() {
        let rule = Rule::field_greater_than("revving", "value", 0.0);
        assert!(rule.evaluate(&json!({"value": 850})));
        assert!(!rule.evaluate(&json!({"value": 0})));
        assert!(!rule.evaluate(&json!({"value": "fast"})));
        assert!(Rule::field_less_than("low", "level", 20.0).evaluate(&json!({"level": 12.5})));
    }

    #[test]
    fn test_rules_deserialize_from_configuration() {
        let rule: Rule = serde_json::from_value(json!({
            "id": "geofence",
            "condition": {"type": "FieldMatches", "field": "tag", "pattern": "vehicle/geofence/*"},
        }))
        .unwrap();
        assert!(rule.evaluate(&json!({"tag": "vehicle/geofence/outside"})));

        let always: Rule = serde_json::from_value(json!({"id": "all", "condition": {"type": "Always"}})).unwrap();
        assert!(always.evaluate(&json!(null)));
    }
}
