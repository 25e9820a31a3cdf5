//! Small helpers shared across the engine.

use std::time::Duration;

use serde_json::Value;

/// Match `text` against a pattern where `*` matches any run of characters
/// (including `/`) and `?` matches exactly one character.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            // Let the last star swallow one more character and retry
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Convert configuration seconds into a `Duration`, clamping negatives to zero.
pub fn secs(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}

/// Walk a dotted path (`"a.b.0"`) through a JSON tree
///
/// A key that literally contains dots is tried first, so `{"a.b": 1}` still
/// resolves `"a.b"`. Numeric segments index into arrays.
pub fn lookup_path<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(found) = tree.get(path) {
        return Some(found);
    }
    path.split('.').try_fold(tree, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_glob_wildcards() {
        assert!(glob_match("*", "anything/at/all"));
        assert!(glob_match("vehicle/position/*", "vehicle/position/standstill"));
        assert!(!glob_match("vehicle/position/*", "vehicle/geofence/inside"));
        assert!(glob_match("obd_*_reader", "obd_rpm_reader"));
        assert!(glob_match("w?rker", "worker"));
        assert!(!glob_match("worker", "worker2"));
        assert!(glob_match("system/*/sleep", "system/power/sleep"));
    }

    #[test]
    fn test_secs_clamps() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(1.5), Duration::from_millis(1500));
    }

    #[test]
    fn test_lookup_path() {
        let tree = json!({"vehicle": {"speed": 42, "doors": [true, false]}, "a.b": 1});
        assert_eq!(lookup_path(&tree, "vehicle.speed"), Some(&json!(42)));
        assert_eq!(lookup_path(&tree, "vehicle.doors.1"), Some(&json!(false)));
        assert_eq!(lookup_path(&tree, "a.b"), Some(&json!(1)));
        assert_eq!(lookup_path(&tree, "vehicle.rpm"), None);
        assert_eq!(lookup_path(&tree, "vehicle.speed.x"), None);
    }
}
