/// Build system error types
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type BuildResult<T> = Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid descriptor for '{context}': {reason}")]
    Validation { context: String, reason: String },

    #[error("Unknown feature '{name}' (available: {available})")]
    UnknownFeature { name: String, available: String },

    #[error("Circular dependency detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("Target not found: {target}")]
    TargetNotFound { target: String },

    #[error("Source file for target '{target}' not found: {path}")]
    MissingSource { target: String, path: PathBuf },

    #[error("{program} failed for target '{target}' ({}): {stderr}", exit_status(.exit_code))]
    Toolchain {
        target: String,
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Dependency index {path} is unreadable: {reason}")]
    DependencyIndexCorrupt { path: PathBuf, reason: String },

    #[error("Target '{target}' did not finish within {after:?}")]
    Timeout { target: String, after: Duration },

    #[error("I/O error at {path}: {error}")]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },

    #[error("Build configuration error: {0}")]
    Config(#[from] clair_config::ConfigError),

    #[error("Failed to start worker pool: {0}")]
    WorkerPool(String),
}

fn exit_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".to_string(),
    }
}

impl BuildError {
    /// Create a descriptor validation error
    pub fn validation(context: impl Into<String>, reason: impl ToString) -> Self {
        Self::Validation {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            error,
        }
    }

    /// Create a missing source error
    pub fn missing_source(target: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::MissingSource {
            target: target.into(),
            path: path.into(),
        }
    }

    /// Create a target not found error
    pub fn target_not_found(target: impl Into<String>) -> Self {
        Self::TargetNotFound {
            target: target.into(),
        }
    }

    /// Whether this error aborts the whole build before any subprocess runs
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::UnknownFeature { .. }
                | Self::Cycle { .. }
                | Self::TargetNotFound { .. }
                | Self::Config(_)
                | Self::WorkerPool(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = BuildError::Cycle {
            cycle: vec!["lib/a".into(), "lib/b".into(), "lib/a".into()],
        };
        assert_eq!(
            err.to_string(),
            "Circular dependency detected: lib/a -> lib/b -> lib/a"
        );
    }

    #[test]
    fn test_toolchain_message() {
        let err = BuildError::Toolchain {
            target: "bin/cat".into(),
            program: "i686-elf-gcc".into(),
            exit_code: Some(1),
            stderr: "cat.c:3: error".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit code 1"));
        assert!(msg.contains("cat.c:3: error"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(BuildError::validation("kernel", "missing output").is_fatal());
        assert!(BuildError::target_not_found("nope").is_fatal());
        assert!(!BuildError::missing_source("bin/ls", "bin/ls.c").is_fatal());
    }
}
