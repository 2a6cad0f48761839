//! Configuration system for the playbook orchestration engine.
//!
//! Provides TOML-based configuration with:
//! - Poll loop, retry, worker and AI backend sections
//! - Contract normalization and SLA accounting switches
//! - Config file layering (user config dir + project-local override)
//! - API keys and worker tokens resolved from environment variables only

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
