//! HTTP surface over the task lifecycle and resource accounting

pub mod access;
pub mod handlers;
pub mod state;

pub use handlers::{create_router, ApiError};
pub use state::AppState;
