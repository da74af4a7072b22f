use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! stable_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Mint a fresh identifier. UUIDv7 keeps minted ids time-ordered.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the raw string carries this id's prefix.
            pub fn matches(raw: &str) -> bool {
                raw.strip_prefix($prefix)
                    .is_some_and(|rest| rest.starts_with('_'))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

stable_id!(TabId, "tab");
stable_id!(WindowId, "win");
stable_id!(SessionId, "sess");
stable_id!(VisitId, "visit");
stable_id!(FocusId, "focus");

/// Runtime-assigned numeric id handed out by the host. Only meaningful while
/// the object is live, and reused after a host restart.
pub type VolatileId = i64;

/// A stable id of either tracked kind, parsed from its prefix.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ObjectRef {
    Tab(TabId),
    Window(WindowId),
}

impl ObjectRef {
    pub fn parse(raw: &str) -> Option<Self> {
        if TabId::matches(raw) {
            Some(Self::Tab(TabId::from_raw(raw)))
        } else if WindowId::matches(raw) {
            Some(Self::Window(WindowId::from_raw(raw)))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Tab(id) => id.as_str(),
            Self::Window(id) => id.as_str(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix() {
        assert!(TabId::new().as_str().starts_with("tab_"));
        assert!(WindowId::new().as_str().starts_with("win_"));
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert!(VisitId::new().as_str().starts_with("visit_"));
        assert!(FocusId::new().as_str().starts_with("focus_"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(TabId::new(), TabId::new());
    }

    #[test]
    fn minted_ids_sort_by_creation() {
        let ids: Vec<TabId> = (0..100).map(|_| TabId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn serde_is_transparent() {
        let id = TabId::from_raw("tab_abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"tab_abc\"");
        let parsed: TabId = serde_json::from_str("\"tab_abc\"").unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn object_ref_parses_by_prefix() {
        let tab = TabId::new();
        let win = WindowId::new();
        assert_eq!(ObjectRef::parse(tab.as_str()), Some(ObjectRef::Tab(tab)));
        assert_eq!(ObjectRef::parse(win.as_str()), Some(ObjectRef::Window(win)));
        assert_eq!(ObjectRef::parse("sess_123"), None);
        assert_eq!(ObjectRef::parse("tabby_123"), None);
        assert_eq!(ObjectRef::parse(""), None);
    }
}
