//! Opportunistic snapshot of in-memory state, so a restarted process can
//! warm its identity cache and active pointers before the first event.
//!
//! Written with write-then-rename and no fsync: it survives a process
//! restart, not a power loss. A missing or unreadable file is a cold start.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use trail_core::ids::{SessionId, TabId, WindowId};

use crate::error::{EngineError, Result};
use crate::identity::IdentitySnapshot;

const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub active_tab: Option<TabId>,
    #[serde(default)]
    pub active_window: Option<WindowId>,
    #[serde(default)]
    pub identity: IdentitySnapshot,
}

impl WorkingState {
    pub fn new(saved_at: DateTime<Utc>) -> Self {
        Self {
            version: FORMAT_VERSION,
            saved_at,
            session_id: None,
            active_tab: None,
            active_window: None,
            identity: IdentitySnapshot::default(),
        }
    }
}

pub struct WorkingStateStore {
    path: PathBuf,
}

impl WorkingStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last saved state, or `None` for a cold start.
    pub fn load(&self) -> Option<WorkingState> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "working state unreadable, starting cold");
                return None;
            }
        };
        match serde_json::from_str::<WorkingState>(&text) {
            Ok(state) if state.version == FORMAT_VERSION => Some(state),
            Ok(state) => {
                warn!(version = state.version, "unknown working state version, starting cold");
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "working state corrupt, starting cold");
                None
            }
        }
    }

    pub fn save(&self, state: &WorkingState) -> Result<()> {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| EngineError::WorkingState(format!("create dir: {e}")))?;
        let text = serde_json::to_string(state).map_err(|e| EngineError::WorkingState(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text).map_err(|e| EngineError::WorkingState(format!("write: {e}")))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| EngineError::WorkingState(format!("rename: {e}")))?;
        debug!(path = %self.path.display(), "working state saved");
        Ok(())
    }
}
