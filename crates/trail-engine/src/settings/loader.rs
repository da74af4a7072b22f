//! Loading flow:
//! 1. Start with compiled [`TrailSettings::default()`]
//! 2. If `<data dir>/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `TABTRAIL_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use super::errors::Result;
use super::types::TrailSettings;

/// Data directory (`~/.tabtrail`, or `$TABTRAIL_HOME` when set).
pub fn data_dir() -> PathBuf {
    if let Some(dir) = read_env_string("TABTRAIL_HOME") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tabtrail")
}

pub fn settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

pub fn load_settings() -> Result<TrailSettings> {
    load_settings_from_path(&settings_path())
}

/// Missing file means defaults; invalid JSON or out-of-range values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<TrailSettings> {
    let defaults = serde_json::to_value(TrailSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TrailSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Objects merge recursively, everything else is replaced by `source`, and
/// nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut TrailSettings) {
    if let Some(v) = read_env_string("TABTRAIL_DB_PATH") {
        settings.store.db_path = v;
    }
    if let Some(v) = read_env_string("TABTRAIL_STATE_PATH") {
        settings.store.state_path = v;
    }
    if let Some(v) = read_env_u64("TABTRAIL_PROBE_TIMEOUT_MS", 100, 600_000) {
        settings.store.probe_timeout_ms = v;
    }
    if let Some(v) = read_env_usize("TABTRAIL_QUEUE_MAX_PENDING", 1, 100_000) {
        settings.queue.max_pending = v;
    }
    if let Some(v) = read_env_u64("TABTRAIL_QUEUE_FLUSH_DELAY_MS", 0, 600_000) {
        settings.queue.flush_delay_ms = v;
    }
    if let Some(v) = read_env_u64("TABTRAIL_TAB_REOPEN_WINDOW_MS", 0, 86_400_000) {
        settings.resurrection.tab_reopen_window_ms = v;
    }
    if let Some(v) = read_env_u64("TABTRAIL_RECONCILE_WINDOW_MS", 0, 604_800_000) {
        settings.resurrection.reconcile_window_ms = v;
    }
    if let Some(v) = read_env_u64("TABTRAIL_SESSION_CONTINUATION_MS", 0, 604_800_000) {
        settings.session.continuation_window_ms = v;
    }
    if let Some(v) = read_env_string("TABTRAIL_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("TABTRAIL_PORT", 1, 65535) {
        settings.server.port = v;
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsError;
    use serde_json::json;

    #[test]
    fn deep_merge_nested_objects() {
        let merged = deep_merge(
            json!({"queue": {"maxPending": 100, "flushDelayMs": 2000}}),
            json!({"queue": {"maxPending": 10}}),
        );
        assert_eq!(merged["queue"]["maxPending"], 10);
        assert_eq!(merged["queue"]["flushDelayMs"], 2000);
    }

    #[test]
    fn deep_merge_skips_null() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": null, "b": 2}));
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let merged = deep_merge(json!({"a": [1, 2]}), json!({"a": [3]}));
        assert_eq!(merged["a"], json!([3]));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s.queue, TrailSettings::default().queue);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"resurrection": {"tabReopenWindowMs": 60000}}"#).unwrap();
        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.resurrection.tab_reopen_window_ms, 60_000);
        assert_eq!(s.resurrection.reconcile_window_ms, 1_800_000);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn out_of_range_file_value_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"graph": {"pruneThreshold": 3.0}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn range_parsers() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("abc", 0, 10), None);
        assert_eq!(parse_usize_range("5", 1, 10), Some(5));
        assert_eq!(parse_usize_range("11", 1, 10), None);
    }
}
