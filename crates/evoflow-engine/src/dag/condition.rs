use serde_json::Value;

/// Evaluate a `skip_if` expression against a JSON object.
///
/// Supported expressions:
/// - `key == "value"`
/// - `key != "value"`
/// - `key contains "substr"`
///
/// Keys may be dotted paths (`user.tier`). Non-string values are compared by
/// their JSON text, so `count == "3"` matches the number `3`. A missing key
/// never matches, and unparseable expressions evaluate to `false`.
pub fn evaluate_condition(expr: &str, data: &Value) -> bool {
    let expr = expr.trim();

    if let Some((key, substr)) = parse_operator(expr, "contains") {
        return lookup(data, key).is_some_and(|s| s.contains(substr));
    }

    if let Some((key, value)) = parse_operator(expr, "!=") {
        return lookup(data, key).is_some_and(|s| s != value);
    }

    if let Some((key, value)) = parse_operator(expr, "==") {
        return lookup(data, key).is_some_and(|s| s == value);
    }

    false
}

/// Check that an expression uses one of the supported operators.
pub fn is_well_formed(expr: &str) -> bool {
    ["contains", "!=", "=="]
        .iter()
        .any(|op| parse_operator(expr.trim(), op).is_some_and(|(k, _)| !k.is_empty()))
}

/// Parse `key OP "value"`, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    Some((key.trim(), val.trim().trim_matches('"')))
}

fn lookup(data: &Value, key: &str) -> Option<String> {
    let value = key
        .split('.')
        .try_fold(data, |cur, segment| cur.get(segment))?;
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_condition_equals() {
        let data = json!({"mode": "dry_run"});
        assert!(evaluate_condition(r#"mode == "dry_run""#, &data));
        assert!(!evaluate_condition(r#"mode == "live""#, &data));
    }

    #[test]
    fn test_condition_not_equals() {
        let data = json!({"mode": "dry_run"});
        assert!(evaluate_condition(r#"mode != "live""#, &data));
        assert!(!evaluate_condition(r#"mode != "dry_run""#, &data));
    }

    #[test]
    fn test_condition_contains() {
        let data = json!({"topic": "rust async patterns"});
        assert!(evaluate_condition(r#"topic contains "async""#, &data));
        assert!(!evaluate_condition(r#"topic contains "python""#, &data));
    }

    #[test]
    fn test_condition_nested_and_numeric() {
        let data = json!({"user": {"tier": "free"}, "count": 3, "flag": true});
        assert!(evaluate_condition(r#"user.tier == "free""#, &data));
        assert!(evaluate_condition(r#"count == "3""#, &data));
        assert!(evaluate_condition(r#"flag == "true""#, &data));
    }

    #[test]
    fn test_condition_missing_key() {
        assert!(!evaluate_condition(r#"missing == "value""#, &json!({})));
        assert!(!evaluate_condition(r#"missing != "value""#, &json!({})));
    }

    #[test]
    fn test_condition_invalid_expr() {
        assert!(!evaluate_condition("this is not valid", &json!({})));
        assert!(!is_well_formed("this is not valid"));
        assert!(is_well_formed(r#"a == "b""#));
    }
}
