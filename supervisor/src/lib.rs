pub mod api;
pub mod config;
pub mod health;
pub mod ingest;
pub mod lifecycle;
pub mod persist;
pub mod process;
pub mod shutdown;
pub mod state;

pub use state::AppState;
