pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

pub use config::CacheConfig;
pub use error::{CacheError, Result};

pub use logic::*;
pub use model::*;
pub use store::*;

/// Initialize env_logger for embedding applications and tests. Safe to call
/// more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
