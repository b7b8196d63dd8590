//! Clair Configuration System
//!
//! Provides the global options consumed by the clair build engine:
//! - Cross and host toolchain programs (compiler, assembler, archiver)
//! - Strip tool and assembler target architecture
//! - Concurrency limit, optional global timeout and feature selection
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Global config (~/.clair/config.toml)
//! 2. Project config (./clair.toml)
//! 3. Environment variables (CLAIR_*)
//! 4. Explicit values set by the embedding tool
//!
//! # Example
//!
//! ```no_run
//! use clair_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("cross compiler: {}", config.settings.cross_tools().cc);
//! ```

pub mod loader;
pub mod settings;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export main types
pub use loader::{Config, ConfigLoader, CONFIG_FILE_NAME};
pub use settings::{BuildSection, Settings, ToolSet, ToolchainSection, Tools};
