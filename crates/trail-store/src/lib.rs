pub mod database;
pub mod error;
pub mod intervals;
pub mod relationships;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod tabs;
pub mod tags;
pub mod windows;

pub use database::Database;
pub use error::StoreError;
