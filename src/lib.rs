pub mod api;
pub mod call;
pub mod config;
pub mod error;
pub mod ice;
pub mod models;
pub mod peer;
pub mod registry;
pub mod state;
pub mod ws;

pub use config::Config;
pub use error::{AppError, Result};
pub use state::AppState;
