pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{load_operator_config, load_resolver_config};
pub use models::*;
pub use validation::{ConfigValidator, ValidationError, ValidationResult};
