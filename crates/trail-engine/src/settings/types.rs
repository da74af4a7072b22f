//! Settings types. JSON field names are camelCase; every struct is
//! `#[serde(default)]` so a partial file only overrides what it names.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{Result, SettingsError};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrailSettings {
    pub store: StoreSettings,
    pub identity: IdentitySettings,
    pub queue: QueueSettings,
    pub session: SessionSettings,
    pub resurrection: ResurrectionSettings,
    pub graph: GraphSettings,
    pub cleanup: CleanupSettings,
    pub debounce: DebounceSettings,
    pub server: ServerSettings,
}

impl TrailSettings {
    /// Reject values the engine can not run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_pending == 0 {
            return Err(SettingsError::InvalidValue("queue.maxPending must be positive".into()));
        }
        if self.identity.tab_capacity == 0 || self.identity.window_capacity == 0 {
            return Err(SettingsError::InvalidValue("identity cache capacity must be positive".into()));
        }
        if self.graph.temporal_window_ms == 0 {
            return Err(SettingsError::InvalidValue("graph.temporalWindowMs must be positive".into()));
        }
        for (name, v) in [
            ("graph.siblingStrength", self.graph.sibling_strength),
            ("graph.pruneThreshold", self.graph.prune_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(SettingsError::InvalidValue(format!("{name} must be within [0, 1]")));
            }
        }
        if self.debounce.max_wait_ms < self.debounce.delay_ms {
            return Err(SettingsError::InvalidValue(
                "debounce.maxWaitMs must not be shorter than debounce.delayMs".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Database file, relative to the data directory unless absolute.
    pub db_path: String,
    /// Working-state snapshot file, relative to the data directory unless absolute.
    pub state_path: String,
    /// Startup probe deadline.
    pub probe_timeout_ms: u64,
}

impl StoreSettings {
    pub fn resolved_db_path(&self, data_dir: &Path) -> PathBuf {
        resolve(data_dir, &self.db_path)
    }

    pub fn resolved_state_path(&self, data_dir: &Path) -> PathBuf {
        resolve(data_dir, &self.state_path)
    }
}

fn resolve(base: &Path, p: &str) -> PathBuf {
    let p = Path::new(p);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: "trail.db".to_string(),
            state_path: "state.json".to_string(),
            probe_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdentitySettings {
    pub tab_capacity: usize,
    pub window_capacity: usize,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            tab_capacity: 5_000,
            window_capacity: 500,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    /// Delay between the first unflushed write and the timed flush.
    pub flush_delay_ms: u64,
    /// Pending entries that force an inline flush.
    pub max_pending: usize,
    /// Fallback flush period.
    pub fallback_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            flush_delay_ms: 2_000,
            max_pending: 100,
            fallback_interval_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// An active session started within this window is continued.
    pub continuation_window_ms: u64,
    /// Lifetime of an unsaved session after it starts.
    pub retention_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            continuation_window_ms: 60 * 60 * 1000,
            retention_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResurrectionSettings {
    /// Steady-state close/reopen window.
    pub tab_reopen_window_ms: u64,
    /// Cold-start reconciliation window.
    pub reconcile_window_ms: u64,
}

impl Default for ResurrectionSettings {
    fn default() -> Self {
        Self {
            tab_reopen_window_ms: 5 * 60 * 1000,
            reconcile_window_ms: 30 * 60 * 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphSettings {
    pub sibling_strength: f64,
    pub temporal_window_ms: u64,
    pub temporal_horizon_ms: u64,
    pub prune_threshold: f64,
    pub recompute_interval_ms: u64,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            sibling_strength: 0.5,
            temporal_window_ms: 10 * 60 * 1000,
            temporal_horizon_ms: 60 * 60 * 1000,
            prune_threshold: 0.2,
            recompute_interval_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupSettings {
    pub interval_ms: u64,
    /// Closed objects older than this are hard deleted unless their session is saved.
    pub closed_retention_ms: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            interval_ms: 60 * 60 * 1000,
            closed_retention_ms: 30 * 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DebounceSettings {
    pub delay_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            delay_ms: 300,
            max_wait_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9323,
        }
    }
}

/// Millisecond setting as a std duration.
pub fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

/// Longest span a window setting may cover, so timestamp arithmetic never overflows.
const MAX_SPAN_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Millisecond setting as a chrono duration, clamped to [`MAX_SPAN_MS`].
pub fn chrono_ms(v: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(v.min(MAX_SPAN_MS) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let s = TrailSettings::default();
        s.validate().unwrap();
        assert_eq!(s.queue.max_pending, 100);
        assert_eq!(s.resurrection.tab_reopen_window_ms, 300_000);
        assert_eq!(s.resurrection.reconcile_window_ms, 1_800_000);
        assert_eq!(s.graph.prune_threshold, 0.2);
        assert_eq!(s.server.host, "127.0.0.1");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: TrailSettings =
            serde_json::from_str(r#"{"queue": {"maxPending": 10}, "graph": {"siblingStrength": 0.4}}"#)
                .unwrap();
        assert_eq!(s.queue.max_pending, 10);
        assert_eq!(s.queue.flush_delay_ms, QueueSettings::default().flush_delay_ms);
        assert_eq!(s.graph.sibling_strength, 0.4);
        assert_eq!(s.graph.temporal_window_ms, 600_000);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut s = TrailSettings::default();
        s.queue.max_pending = 0;
        assert!(s.validate().is_err());

        let mut s = TrailSettings::default();
        s.graph.prune_threshold = 1.5;
        assert!(s.validate().is_err());

        let mut s = TrailSettings::default();
        s.debounce.max_wait_ms = 10;
        assert!(s.validate().is_err());
    }

    #[test]
    fn relative_paths_resolve_against_data_dir() {
        let s = StoreSettings {
            db_path: "/abs/trail.db".into(),
            ..Default::default()
        };
        let base = Path::new("/home/u/.tabtrail");
        assert_eq!(s.resolved_db_path(base), PathBuf::from("/abs/trail.db"));
        assert_eq!(s.resolved_state_path(base), base.join("state.json"));
    }

    #[test]
    fn chrono_conversion() {
        assert_eq!(chrono_ms(1_500), chrono::Duration::milliseconds(1_500));
        assert_eq!(chrono_ms(u64::MAX), chrono::Duration::milliseconds(MAX_SPAN_MS as i64));
    }
}
