pub mod loader;
pub mod models;
pub mod provider;
pub mod validation;

pub use loader::{LoadedConfig, load_config};
pub use models::*;
pub use provider::ConfigProvider;
pub use validation::{ServiceConfigValidator, ValidationError, ValidationResult};
