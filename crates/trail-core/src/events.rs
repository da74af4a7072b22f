use serde::{Deserialize, Serialize};

use crate::ids::VolatileId;
use crate::model::WindowKind;

/// A live tab as reported by the host.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TabSnapshot {
    pub volatile_id: VolatileId,
    pub window_volatile_id: VolatileId,
    #[serde(default)]
    pub opener_volatile_id: Option<VolatileId>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub active: bool,
}

/// A live window and the tabs it contains.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub volatile_id: VolatileId,
    #[serde(default)]
    pub kind: WindowKind,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub tabs: Vec<TabSnapshot>,
}

impl WindowSnapshot {
    pub fn tab_urls(&self) -> impl Iterator<Item = &str> {
        self.tabs.iter().map(|t| t.url.as_str())
    }
}

/// Everything the host currently has open.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveSnapshot {
    pub windows: Vec<WindowSnapshot>,
}

impl LiveSnapshot {
    pub fn tab_count(&self) -> usize {
        self.windows.iter().map(|w| w.tabs.len()).sum()
    }
}

/// Fields that changed on a tab. Absent fields did not change.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TabChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
}

impl TabChange {
    /// Fold a later change over this one; later values win per field.
    pub fn merge(&mut self, later: TabChange) {
        if later.url.is_some() {
            self.url = later.url;
        }
        if later.title.is_some() {
            self.title = later.title;
        }
        if later.pinned.is_some() {
            self.pinned = later.pinned;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.title.is_none() && self.pinned.is_none()
    }
}

/// Steady-state notifications from the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectEvent {
    TabCreated {
        tab: TabSnapshot,
    },
    TabRemoved {
        volatile_id: VolatileId,
        #[serde(default)]
        window_volatile_id: Option<VolatileId>,
        #[serde(default)]
        is_window_closing: bool,
    },
    TabActivated {
        volatile_id: VolatileId,
        window_volatile_id: VolatileId,
    },
    TabUpdated {
        volatile_id: VolatileId,
        change: TabChange,
    },
    TabMoved {
        volatile_id: VolatileId,
        window_volatile_id: VolatileId,
        to_index: i64,
    },
    TabAttached {
        volatile_id: VolatileId,
        new_window_volatile_id: VolatileId,
        new_index: i64,
    },
    TabDetached {
        volatile_id: VolatileId,
        old_window_volatile_id: VolatileId,
    },
    WindowCreated {
        window: WindowSnapshot,
    },
    WindowRemoved {
        volatile_id: VolatileId,
    },
    /// `None` means focus left the host entirely.
    WindowFocusChanged {
        volatile_id: Option<VolatileId>,
    },
}

impl ObjectEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TabCreated { .. } => "tab_created",
            Self::TabRemoved { .. } => "tab_removed",
            Self::TabActivated { .. } => "tab_activated",
            Self::TabUpdated { .. } => "tab_updated",
            Self::TabMoved { .. } => "tab_moved",
            Self::TabAttached { .. } => "tab_attached",
            Self::TabDetached { .. } => "tab_detached",
            Self::WindowCreated { .. } => "window_created",
            Self::WindowRemoved { .. } => "window_removed",
            Self::WindowFocusChanged { .. } => "window_focus_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_format() {
        let json = r#"{"type":"tab_created","tab":{"volatile_id":12,"window_volatile_id":3,"url":"https://a.com/"}}"#;
        let evt: ObjectEvent = serde_json::from_str(json).unwrap();
        match evt {
            ObjectEvent::TabCreated { tab } => {
                assert_eq!(tab.volatile_id, 12);
                assert_eq!(tab.window_volatile_id, 3);
                assert_eq!(tab.opener_volatile_id, None);
                assert!(!tab.pinned);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn focus_left_host() {
        let evt: ObjectEvent =
            serde_json::from_str(r#"{"type":"window_focus_changed","volatile_id":null}"#).unwrap();
        assert_eq!(evt, ObjectEvent::WindowFocusChanged { volatile_id: None });
        assert_eq!(evt.name(), "window_focus_changed");
    }

    #[test]
    fn change_merge_keeps_latest_per_field() {
        let mut first = TabChange {
            url: Some("https://a.com/".into()),
            title: Some("A".into()),
            pinned: None,
        };
        first.merge(TabChange {
            url: None,
            title: Some("A (loaded)".into()),
            pinned: Some(true),
        });
        assert_eq!(first.url.as_deref(), Some("https://a.com/"));
        assert_eq!(first.title.as_deref(), Some("A (loaded)"));
        assert_eq!(first.pinned, Some(true));
        assert!(!first.is_empty());
        assert!(TabChange::default().is_empty());
    }

    #[test]
    fn snapshot_counts_tabs() {
        let snap = LiveSnapshot {
            windows: vec![
                WindowSnapshot {
                    volatile_id: 1,
                    tabs: vec![TabSnapshot::default(), TabSnapshot::default()],
                    ..Default::default()
                },
                WindowSnapshot {
                    volatile_id: 2,
                    tabs: vec![TabSnapshot::default()],
                    ..Default::default()
                },
            ],
        };
        assert_eq!(snap.tab_count(), 3);
    }
}
