pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str, resolve_var_dir, VAR_DIR_ENV};
pub use schema::{Config, DatabaseConfig, ToolConfig};
