use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    })
}

/// Substitute `{VAR_NAME}` placeholders from `vars`.
///
/// Strings are inserted as-is, other values as compact JSON. Placeholders
/// with no matching variable are left untouched.
pub fn render(template: &str, vars: &HashMap<String, Value>) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| match vars.get(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Display form of a value used as a branch discriminator.
pub fn discriminator(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
