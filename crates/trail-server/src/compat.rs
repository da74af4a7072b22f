//! Param normalization for extension clients that send camelCase keys.

/// camelCase keys the extension sends, mapped to the snake_case keys the
/// handlers read.
const CAMEL_TO_SNAKE: &[(&str, &str)] = &[
    ("objectId", "object_id"),
    ("tabId", "tab_id"),
    ("windowId", "window_id"),
    ("sessionId", "session_id"),
    ("logLevel", "level"),
];

/// If the snake_case key already exists, the existing value takes precedence.
pub fn normalize_params(params: &serde_json::Value) -> serde_json::Value {
    let Some(obj) = params.as_object() else {
        return params.clone();
    };
    let mut result = obj.clone();
    for &(camel, snake) in CAMEL_TO_SNAKE {
        if result.contains_key(snake) {
            result.remove(camel);
        } else if let Some(val) = result.remove(camel) {
            result.insert(snake.to_string(), val);
        }
    }
    serde_json::Value::Object(result)
}
