//! Durable domain records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::ids::{FocusId, ObjectRef, SessionId, TabId, VisitId, VolatileId, WindowId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Tab,
    Window,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tab => write!(f, "tab"),
            Self::Window => write!(f, "window"),
        }
    }
}

impl std::str::FromStr for ObjectKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tab" => Ok(Self::Tab),
            "window" => Ok(Self::Window),
            other => Err(format!("unknown object kind: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    #[default]
    Normal,
    Popup,
    App,
    Devtools,
}

impl std::fmt::Display for WindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Popup => write!(f, "popup"),
            Self::App => write!(f, "app"),
            Self::Devtools => write!(f, "devtools"),
        }
    }
}

impl std::str::FromStr for WindowKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "popup" => Ok(Self::Popup),
            "app" => Ok(Self::App),
            "devtools" => Ok(Self::Devtools),
            other => Err(format!("unknown window kind: {other}")),
        }
    }
}

/// Fields every tracked object carries, whatever its kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tracking {
    pub volatile_id: VolatileId,
    /// None when the content could not be fingerprinted.
    pub fingerprint: Option<Fingerprint>,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub active_duration_ms: i64,
    pub closed_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub metadata: serde_json::Value,
}

impl Tracking {
    pub fn new(
        volatile_id: VolatileId,
        fingerprint: Option<Fingerprint>,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            volatile_id,
            fingerprint,
            session_id,
            created_at: now,
            last_active_at: now,
            active_duration_ms: 0,
            closed_at: None,
            tags: Vec::new(),
            notes: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn is_live(&self) -> bool {
        self.closed_at.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TabRecord {
    pub id: TabId,
    #[serde(flatten)]
    pub tracking: Tracking,
    pub window_id: Option<WindowId>,
    pub opener_id: Option<TabId>,
    pub url: String,
    pub title: String,
    pub index: i64,
    pub pinned: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub id: WindowId,
    #[serde(flatten)]
    pub tracking: Tracking,
    pub kind: WindowKind,
    pub focused: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "snake_case")]
pub enum TrackedObject {
    Tab(TabRecord),
    Window(WindowRecord),
}

impl TrackedObject {
    pub fn tracking(&self) -> &Tracking {
        match self {
            Self::Tab(t) => &t.tracking,
            Self::Window(w) => &w.tracking,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_saved: bool,
    /// None once saved.
    pub expires_at: Option<DateTime<Utc>>,
    pub tab_count: i64,
    pub window_count: i64,
    pub visit_count: i64,
}

/// One URL visited in one tab.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VisitRecord {
    pub id: VisitId,
    pub owner_id: TabId,
    pub session_id: SessionId,
    pub url: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// One interval during which a tab or window held focus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FocusRecord {
    pub id: FocusId,
    pub owner: ObjectRef,
    pub session_id: SessionId,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Opener,
    Sibling,
    Temporal,
}

impl EdgeKind {
    /// Structural edges describe how a tab came to be and never decay.
    pub fn is_structural(self) -> bool {
        !matches!(self, Self::Temporal)
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opener => write!(f, "opener"),
            Self::Sibling => write!(f, "sibling"),
            Self::Temporal => write!(f, "temporal"),
        }
    }
}

impl std::str::FromStr for EdgeKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opener" => Ok(Self::Opener),
            "sibling" => Ok(Self::Sibling),
            "temporal" => Ok(Self::Temporal),
            other => Err(format!("unknown edge kind: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub source_id: TabId,
    pub target_id: TabId,
    pub kind: EdgeKind,
    pub strength: f64,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    pub name: String,
    pub use_count: i64,
    pub last_used_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_roundtrip_through_strings() {
        for kind in [EdgeKind::Opener, EdgeKind::Sibling, EdgeKind::Temporal] {
            assert_eq!(kind.to_string().parse::<EdgeKind>().unwrap(), kind);
        }
        for kind in [WindowKind::Normal, WindowKind::Popup, WindowKind::App, WindowKind::Devtools] {
            assert_eq!(kind.to_string().parse::<WindowKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<EdgeKind>().is_err());
    }

    #[test]
    fn only_temporal_edges_decay() {
        assert!(EdgeKind::Opener.is_structural());
        assert!(EdgeKind::Sibling.is_structural());
        assert!(!EdgeKind::Temporal.is_structural());
    }

    #[test]
    fn tracked_object_serializes_flat() {
        let tab = TabRecord {
            id: TabId::from_raw("tab_1"),
            tracking: Tracking::new(7, None, SessionId::from_raw("sess_1"), Utc::now()),
            window_id: None,
            opener_id: None,
            url: "https://example.com/".into(),
            title: "Example".into(),
            index: 0,
            pinned: false,
        };
        let json = serde_json::to_value(TrackedObject::Tab(tab)).unwrap();
        assert_eq!(json["object"], "tab");
        assert_eq!(json["volatile_id"], 7);
        assert_eq!(json["url"], "https://example.com/");
    }
}
