//! Module and target descriptors and their normalized form
//!
//! Descriptors arrive already parsed (the loader is outside this crate) with
//! every override optional. [`normalize`] validates them once and produces
//! [`Module`]/[`Target`] values where every directory, flag string and flag set
//! is resolved. A target-level value replaces the module default wholesale.

use crate::build_order::normalize_path;
use crate::error::{BuildError, BuildResult};
use crate::features::{FeatureFlag, FeatureTable};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// One source file and the paths whose changes force it to recompile
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileEntry {
    /// Source path, relative to the target's source directory
    pub source: PathBuf,
    /// Declared dependencies, relative to the target's deps directory
    #[serde(default)]
    pub deps: Vec<PathBuf>,
}

impl FileEntry {
    /// Create an entry with no declared dependencies
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            deps: Vec::new(),
        }
    }

    /// Set declared dependencies
    pub fn with_deps<I, P>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }
}

impl From<&str> for FileEntry {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

/// Recipe-affecting flags of a target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TargetFlags {
    /// Use the compiled object directly as the output
    pub no_link: bool,
    /// Archive objects into a static library
    pub build_ar: bool,
    /// Use the host toolchain instead of the cross toolchain
    pub host_cc: bool,
}

impl TargetFlags {
    /// Parse flag names (case-insensitive)
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        let mut flags = Self::default();
        for name in names {
            match name.as_ref().trim().to_ascii_uppercase().as_str() {
                "NO_LINK" => flags.no_link = true,
                "BUILD_AR" => flags.build_ar = true,
                "HOST_CC" => flags.host_cc = true,
                other => return Err(format!("unknown target flag '{other}'")),
            }
        }
        Ok(flags)
    }
}

impl fmt::Display for TargetFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.no_link {
            names.push("NO_LINK");
        }
        if self.build_ar {
            names.push("BUILD_AR");
        }
        if self.host_cc {
            names.push("HOST_CC");
        }
        if names.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Settings a module provides as defaults and a target may override
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Overrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srcdir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objdir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depsdir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cflags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asmflags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldflags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_ld: Option<Vec<String>>,
}

/// Raw target descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub out: Option<PathBuf>,
    #[serde(flatten)]
    pub overrides: Overrides,
    #[serde(default)]
    pub c_files: Vec<FileEntry>,
    #[serde(default)]
    pub asm_files: Vec<FileEntry>,
    /// Optional feature rows owned by this target
    #[serde(default)]
    pub features: Vec<FeatureFlag>,
}

impl TargetDescriptor {
    /// Create a target descriptor with a name and output path
    pub fn new(name: impl Into<String>, out: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            out: Some(out.into()),
            ..Default::default()
        }
    }

    pub fn with_c_files<I, F>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<FileEntry>,
    {
        self.c_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_asm_files<I, F>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<FileEntry>,
    {
        self.asm_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_flags(mut self, flags: &[&str]) -> Self {
        self.overrides.flags = Some(flags.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn with_srcdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.overrides.srcdir = Some(dir.into());
        self
    }

    pub fn with_objdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.overrides.objdir = Some(dir.into());
        self
    }

    pub fn with_depsdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.overrides.depsdir = Some(dir.into());
        self
    }

    pub fn with_cflags(mut self, flags: impl Into<String>) -> Self {
        self.overrides.cflags = Some(flags.into());
        self
    }

    pub fn with_asmflags(mut self, flags: impl Into<String>) -> Self {
        self.overrides.asmflags = Some(flags.into());
        self
    }

    pub fn with_ldflags(mut self, flags: impl Into<String>) -> Self {
        self.overrides.ldflags = Some(flags.into());
        self
    }

    pub fn with_extra_ld(mut self, commands: &[&str]) -> Self {
        self.overrides.extra_ld = Some(commands.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_features(mut self, features: Vec<FeatureFlag>) -> Self {
        self.features = features;
        self
    }
}

/// Raw module descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModuleDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub defaults: Overrides,
    #[serde(default)]
    pub targets: Vec<TargetDescriptor>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: TargetDescriptor) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_defaults(mut self, defaults: Overrides) -> Self {
        self.defaults = defaults;
        self
    }
}

/// Language of a source file, which picks compiler or assembler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    C,
    Asm,
}

/// A normalized, fully resolved target
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub module: String,
    pub name: String,
    pub output: PathBuf,
    pub source_dir: PathBuf,
    pub obj_dir: PathBuf,
    pub deps_dir: PathBuf,
    pub cflags: String,
    pub asmflags: String,
    pub ldflags: String,
    pub flags: TargetFlags,
    pub extra_ld: Vec<String>,
    pub c_files: Vec<FileEntry>,
    pub asm_files: Vec<FileEntry>,
    pub features: Option<FeatureTable>,
}

impl Target {
    /// `module/target`, unique across the build
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.module, self.name)
    }

    /// Whether `name` designates this target (`target` or `module/target`)
    pub fn matches(&self, name: &str) -> bool {
        match name.split_once('/') {
            Some((module, target)) => module == self.module && target == self.name,
            None => name == self.name,
        }
    }

    /// All file entries in compile order: C sources first, then assembly
    pub fn sources(&self) -> impl Iterator<Item = (SourceKind, &FileEntry)> {
        self.c_files
            .iter()
            .map(|e| (SourceKind::C, e))
            .chain(self.asm_files.iter().map(|e| (SourceKind::Asm, e)))
    }

    /// Source path of an entry, relative to the build root
    pub fn source_path(&self, entry: &FileEntry) -> PathBuf {
        self.source_dir.join(&entry.source)
    }

    /// Object path of an entry, relative to the build root
    pub fn object_path(&self, entry: &FileEntry) -> PathBuf {
        let mut name = entry.source.clone().into_os_string();
        name.push(".o");
        self.obj_dir.join(name)
    }

    /// Declared dependency path, relative to the build root
    pub fn dependency_path(&self, dep: &Path) -> PathBuf {
        self.deps_dir.join(dep)
    }
}

/// A normalized module
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub name: String,
    pub targets: Vec<Target>,
}

/// Validate descriptors and resolve module defaults into every target
pub fn normalize(descriptors: &[ModuleDescriptor]) -> BuildResult<Vec<Module>> {
    let mut module_names = HashSet::new();
    let mut outputs: HashMap<PathBuf, String> = HashMap::new();
    let mut modules = Vec::with_capacity(descriptors.len());

    for descriptor in descriptors {
        if descriptor.name.trim().is_empty() {
            return Err(BuildError::validation("<module>", "module name is required"));
        }
        if !module_names.insert(descriptor.name.as_str()) {
            return Err(BuildError::validation(
                &descriptor.name,
                "module declared more than once",
            ));
        }

        let mut target_names = HashSet::new();
        let mut targets = Vec::with_capacity(descriptor.targets.len());
        for target in &descriptor.targets {
            let normalized = normalize_target(descriptor, target)?;
            if !target_names.insert(normalized.name.clone()) {
                return Err(BuildError::validation(
                    normalized.qualified_name(),
                    "target declared more than once in its module",
                ));
            }
            let name = normalized.qualified_name();
            if let Some(other) = outputs.insert(normalize_path(&normalized.output), name.clone()) {
                return Err(BuildError::validation(
                    name,
                    format!(
                        "output '{}' is also produced by {other}",
                        normalized.output.display()
                    ),
                ));
            }
            targets.push(normalized);
        }

        modules.push(Module {
            name: descriptor.name.clone(),
            targets,
        });
    }

    Ok(modules)
}

fn normalize_target(module: &ModuleDescriptor, target: &TargetDescriptor) -> BuildResult<Target> {
    let context = format!("{}/{}", module.name, target.name);
    if target.name.trim().is_empty() {
        return Err(BuildError::validation(
            format!("{}/<target>", module.name),
            "target name is required",
        ));
    }

    let output = match &target.out {
        Some(out) if !out.as_os_str().is_empty() => out.clone(),
        _ => return Err(BuildError::validation(&context, "output path is required")),
    };

    let defaults = &module.defaults;
    let own = &target.overrides;

    let flag_names = own.flags.as_ref().or(defaults.flags.as_ref());
    let flags = match flag_names {
        Some(names) => TargetFlags::parse(names).map_err(|e| BuildError::validation(&context, e))?,
        None => TargetFlags::default(),
    };
    if flags.no_link && flags.build_ar {
        return Err(BuildError::validation(
            &context,
            "NO_LINK and BUILD_AR cannot be combined",
        ));
    }

    let source_dir = pick(&own.srcdir, &defaults.srcdir).unwrap_or_else(|| PathBuf::from("."));
    let obj_dir = pick(&own.objdir, &defaults.objdir)
        .unwrap_or_else(|| Path::new("build").join(&module.name));
    let deps_dir = pick(&own.depsdir, &defaults.depsdir).unwrap_or_else(|| source_dir.clone());

    let mut seen = HashSet::new();
    for entry in target.c_files.iter().chain(&target.asm_files) {
        if entry.source.as_os_str().is_empty() {
            return Err(BuildError::validation(&context, "file entry has an empty source path"));
        }
        if !seen.insert(&entry.source) {
            return Err(BuildError::validation(
                &context,
                format!("source '{}' listed more than once", entry.source.display()),
            ));
        }
    }

    let features = if target.features.is_empty() {
        None
    } else {
        Some(FeatureTable::new(target.features.clone()).map_err(|e| match e {
            BuildError::Validation { reason, .. } => BuildError::validation(&context, reason),
            other => other,
        })?)
    };

    if target.c_files.is_empty() && target.asm_files.is_empty() && features.is_none() {
        return Err(BuildError::validation(&context, "target has no source files"));
    }

    Ok(Target {
        module: module.name.clone(),
        name: target.name.clone(),
        output,
        source_dir,
        obj_dir,
        deps_dir,
        cflags: pick(&own.cflags, &defaults.cflags).unwrap_or_default(),
        asmflags: pick(&own.asmflags, &defaults.asmflags).unwrap_or_default(),
        ldflags: pick(&own.ldflags, &defaults.ldflags).unwrap_or_default(),
        flags,
        extra_ld: pick(&own.extra_ld, &defaults.extra_ld).unwrap_or_default(),
        c_files: target.c_files.clone(),
        asm_files: target.asm_files.clone(),
        features,
    })
}

/// Target value wins wholesale; otherwise the module default
fn pick<T: Clone>(own: &Option<T>, default: &Option<T>) -> Option<T> {
    own.clone().or_else(|| default.clone())
}
