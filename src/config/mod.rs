pub mod loader;

pub use loader::{load_config, parse_config, validate_config, API_KEY_ENV};
