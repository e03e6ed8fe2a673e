//! Configuration file parsing for scriptlink
//!
//! Settings live in `<config_dir>/scriptlink/config.toml` unless a path is
//! given explicitly.

pub mod settings;
pub mod types;

pub use settings::{default_config_path, init_config_file, load_settings};
pub use types::*;
