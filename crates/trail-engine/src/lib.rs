//! Identity reconciliation and tracking for browser tabs and windows.
//!
//! The host hands out volatile numeric ids that are reused across restarts.
//! This crate maps them onto stable ids, keeps the mapping alive across
//! restarts through content fingerprints, and records sessions, visits,
//! focus intervals and relationships between tabs.

pub mod context;
pub mod debounce;
pub mod error;
pub mod graph;
pub mod identity;
pub mod query;
pub mod reconcile;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod tracker;
pub mod working_state;
pub mod write_queue;

pub use context::TrailContext;
pub use error::{EngineError, Result};
pub use graph::{calculate_strength, Relationships};
pub use query::{MetadataUpdate, Trail};
pub use reconcile::{LiveObjectSource, ReconcileReport};
pub use scheduler::{Scheduler, Tick};
pub use settings::TrailSettings;
pub use tracker::Tracker;
