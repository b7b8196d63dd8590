//! Build settings (clair.toml / ~/.clair/config.toml)
//!
//! Both files share one schema. Every field is optional so a global file can
//! provide machine-wide toolchain paths while a project file only pins what it
//! needs; [`Settings::merge`] layers one over the other.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix of the freestanding cross toolchain when none is configured.
pub const DEFAULT_CROSS_PREFIX: &str = "i686-elf-";

/// Assembler output format when none is configured.
pub const DEFAULT_ASM_ARCH: &str = "elf32";

/// Settings file contents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Toolchain programs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toolchain: Option<ToolchainSection>,

    /// Build scheduling options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSection>,
}

/// `[toolchain]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ToolchainSection {
    /// Prefix used to derive cross tool names (e.g. "i686-elf-")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_prefix: Option<String>,

    /// Assembler output format substituted for `$(ASMARCH)`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asm_arch: Option<String>,

    /// Strip tool substituted for `$(STRIP)`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strip: Option<String>,

    /// Explicit cross tool overrides
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross: Option<ToolSet>,

    /// Explicit host tool overrides
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<ToolSet>,
}

/// `[toolchain.cross]` / `[toolchain.host]` tables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ToolSet {
    /// C compiler (also used as the link driver)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc: Option<String>,

    /// Assembler
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asm: Option<String>,

    /// Archiver
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ar: Option<String>,
}

/// `[build]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct BuildSection {
    /// Maximum number of concurrently running toolchain processes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,

    /// Global timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Comma-separated feature selection (empty means all)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<String>,
}

/// Fully resolved program names for one toolchain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tools {
    pub cc: String,
    pub asm: String,
    pub ar: String,
}

impl Settings {
    /// Load settings from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        Self::parse(&content).map_err(|e| match e {
            ConfigError::TomlParseError { error, .. } => ConfigError::TomlParseError {
                file: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse settings from TOML text
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let settings: Self =
            toml::from_str(content).map_err(|error| ConfigError::TomlParseError {
                file: Default::default(),
                error,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate value ranges that serde cannot express
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(build) = &self.build {
            if build.jobs == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "build.jobs".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            if build.timeout == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "build.timeout".to_string(),
                    reason: "must be at least 1 second".to_string(),
                });
            }
        }

        if let Some(toolchain) = &self.toolchain {
            let sets = [("cross", &toolchain.cross), ("host", &toolchain.host)];
            for (section, set) in sets {
                let Some(set) = set else { continue };
                for (key, value) in [("cc", &set.cc), ("asm", &set.asm), ("ar", &set.ar)] {
                    if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                        return Err(ConfigError::InvalidValue {
                            field: format!("toolchain.{section}.{key}"),
                            reason: "program name cannot be empty".to_string(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Layer `other` on top of `self`; values present in `other` win.
    pub fn merge(&mut self, other: Settings) {
        if let Some(theirs) = other.toolchain {
            let ours = self.toolchain.get_or_insert_with(Default::default);
            if theirs.cross_prefix.is_some() {
                ours.cross_prefix = theirs.cross_prefix;
            }
            if theirs.asm_arch.is_some() {
                ours.asm_arch = theirs.asm_arch;
            }
            if theirs.strip.is_some() {
                ours.strip = theirs.strip;
            }
            merge_tool_set(&mut ours.cross, theirs.cross);
            merge_tool_set(&mut ours.host, theirs.host);
        }

        if let Some(theirs) = other.build {
            let ours = self.build.get_or_insert_with(Default::default);
            if theirs.jobs.is_some() {
                ours.jobs = theirs.jobs;
            }
            if theirs.timeout.is_some() {
                ours.timeout = theirs.timeout;
            }
            if theirs.features.is_some() {
                ours.features = theirs.features;
            }
        }
    }

    /// Cross tool name prefix
    pub fn cross_prefix(&self) -> &str {
        self.toolchain
            .as_ref()
            .and_then(|t| t.cross_prefix.as_deref())
            .unwrap_or(DEFAULT_CROSS_PREFIX)
    }

    /// Resolved cross toolchain
    pub fn cross_tools(&self) -> Tools {
        let prefix = self.cross_prefix();
        let set = self.toolchain.as_ref().and_then(|t| t.cross.as_ref());
        Tools {
            cc: pick(set.and_then(|s| s.cc.as_deref()), || format!("{prefix}gcc")),
            asm: pick(set.and_then(|s| s.asm.as_deref()), || "nasm".to_string()),
            ar: pick(set.and_then(|s| s.ar.as_deref()), || format!("{prefix}ar")),
        }
    }

    /// Resolved host toolchain
    pub fn host_tools(&self) -> Tools {
        let set = self.toolchain.as_ref().and_then(|t| t.host.as_ref());
        Tools {
            cc: pick(set.and_then(|s| s.cc.as_deref()), || "cc".to_string()),
            asm: pick(set.and_then(|s| s.asm.as_deref()), || "nasm".to_string()),
            ar: pick(set.and_then(|s| s.ar.as_deref()), || "ar".to_string()),
        }
    }

    /// Strip tool (defaults to the cross prefix's strip)
    pub fn strip(&self) -> String {
        pick(
            self.toolchain.as_ref().and_then(|t| t.strip.as_deref()),
            || format!("{}strip", self.cross_prefix()),
        )
    }

    /// Assembler architecture
    pub fn asm_arch(&self) -> &str {
        self.toolchain
            .as_ref()
            .and_then(|t| t.asm_arch.as_deref())
            .unwrap_or(DEFAULT_ASM_ARCH)
    }

    /// Concurrency limit (defaults to the available parallelism)
    pub fn jobs(&self) -> usize {
        self.build
            .as_ref()
            .and_then(|b| b.jobs)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    }

    /// Optional global timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.build
            .as_ref()
            .and_then(|b| b.timeout)
            .map(Duration::from_secs)
    }

    /// Feature selection string (empty means all)
    pub fn features(&self) -> &str {
        self.build
            .as_ref()
            .and_then(|b| b.features.as_deref())
            .unwrap_or("")
    }
}

fn merge_tool_set(ours: &mut Option<ToolSet>, theirs: Option<ToolSet>) {
    let Some(theirs) = theirs else { return };
    let ours = ours.get_or_insert_with(Default::default);
    if theirs.cc.is_some() {
        ours.cc = theirs.cc;
    }
    if theirs.asm.is_some() {
        ours.asm = theirs.asm;
    }
    if theirs.ar.is_some() {
        ours.ar = theirs.ar;
    }
}

fn pick(value: Option<&str>, fallback: impl FnOnce() -> String) -> String {
    value.map(str::to_string).unwrap_or_else(fallback)
}
