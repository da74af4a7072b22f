//! Layered configuration: compiled defaults, then `settings.json` in the
//! data directory, then `TABTRAIL_*` environment variables. The binary
//! applies CLI flags last.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::SettingsError;
pub use loader::{data_dir, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
