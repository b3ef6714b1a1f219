pub mod config;
pub mod ids;
pub mod types;
pub mod validate;

pub use config::{ConfigError, ManagerConfig, RouterConfig};
pub use ids::{epoch_millis, fresh_id};
pub use types::*;
