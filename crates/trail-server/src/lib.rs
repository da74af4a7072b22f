//! Local HTTP transport for the trail engine: event intake, cold-start
//! reconcile and JSON-RPC style queries.

pub mod compat;
pub mod handlers;
pub mod rpc;
pub mod server;
pub mod shutdown;

pub use handlers::HandlerState;
pub use server::{start, ServerConfig, ServerHandle};
pub use shutdown::ShutdownCoordinator;
