use serde_json::Value;

/// Read a JSON value as a finite number.
///
/// Accepts JSON numbers and strings holding a number (`"39.5"`), the way the
/// sensor firmware and hand-edited settings documents send them. `NaN`,
/// infinities, booleans, nulls and everything else yield `None`.
pub fn finite_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Look up the first of `keys` present in a JSON object.
pub fn field<'a>(doc: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| doc.get(*k))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn numbers_and_numeric_strings_are_accepted() {
        assert_eq!(finite_number(&json!(39.5)), Some(39.5));
        assert_eq!(finite_number(&json!(10)), Some(10.0));
        assert_eq!(finite_number(&json!(" 75 ")), Some(75.0));
    }

    #[test]
    fn non_numeric_values_are_rejected() {
        assert_eq!(finite_number(&json!("abc")), None);
        assert_eq!(finite_number(&json!("NaN")), None);
        assert_eq!(finite_number(&json!("inf")), None);
        assert_eq!(finite_number(&json!(true)), None);
        assert_eq!(finite_number(&Value::Null), None);
    }

    #[test]
    fn field_prefers_first_key() {
        let doc = json!({"suhu": 30, "temperature": 40});
        assert_eq!(field(&doc, &["temperature", "suhu"]), Some(&json!(40)));
        assert_eq!(field(&doc, &["missing", "suhu"]), Some(&json!(30)));
        assert_eq!(field(&doc, &["missing"]), None);
    }
}
