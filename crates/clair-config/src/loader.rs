//! Configuration Loader
//!
//! Handles loading and merging settings from multiple sources with proper precedence.

use crate::settings::{BuildSection, Settings, ToolchainSection};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Name of the project-level settings file
pub const CONFIG_FILE_NAME: &str = "clair.toml";

/// Configuration loader
///
/// Loads settings from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.clair/config.toml) - lowest priority
/// 2. Project config (./clair.toml) - overrides global
/// 3. Environment variables (CLAIR_*) - overrides project
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone)]
pub struct Config {
    /// Effective settings after merging every source
    pub settings: Settings,

    /// Project root directory (where clair.toml was found)
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Use an explicit global config path instead of ~/.clair/config.toml
    pub fn with_global_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.global_config_path = Some(path.into());
        self
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find clair.toml, then layers it over the
    /// global config and applies environment overrides.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project_settings) = self.find_project_settings(start_dir)?;

        let mut settings = self.load_global_settings()?;
        settings.merge(project_settings);
        let settings = self.apply_env_overrides(settings)?;

        Ok(Config {
            settings,
            project_root,
        })
    }

    /// Load configuration from a specific project settings file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project_settings = Settings::load_from_file(config_path)?;

        let mut settings = self.load_global_settings()?;
        settings.merge(project_settings);
        let settings = self.apply_env_overrides(settings)?;

        Ok(Config {
            settings,
            project_root: config_path.parent().map(|p| p.to_path_buf()),
        })
    }

    /// Find project settings by walking up directory tree
    fn find_project_settings(&self, start_dir: &Path) -> ConfigResult<(Option<PathBuf>, Settings)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(CONFIG_FILE_NAME);

            if config_path.exists() {
                let settings = Settings::load_from_file(&config_path)?;
                return Ok((Some(current), settings));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, Settings::default())),
            }
        }
    }

    /// Load global settings; a missing file means defaults
    fn load_global_settings(&mut self) -> ConfigResult<Settings> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => match Self::global_config_dir() {
                Ok(dir) => {
                    let path = dir.join("config.toml");
                    self.global_config_path = Some(path.clone());
                    path
                }
                // No home directory: nothing to layer underneath.
                Err(ConfigError::HomeNotFound) => return Ok(Settings::default()),
                Err(e) => return Err(e),
            },
        };

        if !path.exists() {
            return Ok(Settings::default());
        }

        Settings::load_from_file(&path)
    }

    /// Apply environment variable overrides
    ///
    /// Recognized: CLAIR_FEATURES, CLAIR_JOBS, CLAIR_TIMEOUT, CLAIR_ASM_ARCH,
    /// CLAIR_CROSS_PREFIX
    fn apply_env_overrides(&self, mut settings: Settings) -> ConfigResult<Settings> {
        if let Ok(features) = env::var("CLAIR_FEATURES") {
            build_section(&mut settings).features = Some(features);
        }

        if let Ok(jobs) = env::var("CLAIR_JOBS") {
            let jobs = parse_positive("CLAIR_JOBS", &jobs)?;
            build_section(&mut settings).jobs = Some(jobs as usize);
        }

        if let Ok(timeout) = env::var("CLAIR_TIMEOUT") {
            let timeout = parse_positive("CLAIR_TIMEOUT", &timeout)?;
            build_section(&mut settings).timeout = Some(timeout);
        }

        if let Ok(arch) = env::var("CLAIR_ASM_ARCH") {
            toolchain_section(&mut settings).asm_arch = Some(arch);
        }

        if let Ok(prefix) = env::var("CLAIR_CROSS_PREFIX") {
            toolchain_section(&mut settings).cross_prefix = Some(prefix);
        }

        Ok(settings)
    }

    /// Get the global configuration directory (~/.clair)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".clair"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if a clair.toml was found
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }
}

fn build_section(settings: &mut Settings) -> &mut BuildSection {
    settings.build.get_or_insert_with(Default::default)
}

fn toolchain_section(settings: &mut Settings) -> &mut ToolchainSection {
    settings.toolchain.get_or_insert_with(Default::default)
}

fn parse_positive(field: &str, value: &str) -> ConfigResult<u64> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected a positive integer, got '{value}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn isolated_loader(dir: &Path) -> ConfigLoader {
        ConfigLoader::new().with_global_path(dir.join("no-global.toml"))
    }

    #[test]
    fn test_parse_positive() {
        assert_eq!(parse_positive("X", "8").unwrap(), 8);
        assert!(parse_positive("X", "0").is_err());
        assert!(parse_positive("X", "many").is_err());
    }

    #[test]
    #[serial]
    fn test_env_override_jobs() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(CONFIG_FILE_NAME), "[build]\njobs = 2\n").unwrap();

        env::set_var("CLAIR_JOBS", "6");
        let config = isolated_loader(temp_dir.path()).load_from_directory(temp_dir.path());
        env::remove_var("CLAIR_JOBS");

        assert_eq!(config.unwrap().settings.jobs(), 6);
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_jobs() {
        let temp_dir = TempDir::new().unwrap();

        env::set_var("CLAIR_JOBS", "zero");
        let result = isolated_loader(temp_dir.path()).load_from_directory(temp_dir.path());
        env::remove_var("CLAIR_JOBS");

        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
