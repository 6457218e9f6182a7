pub mod exposer;
pub mod query;
pub mod refresher;
pub mod registry;
pub mod server;

pub use server::{router, serve, AppState};
