//! Staleness decisions for compiled objects
//!
//! Only the dependencies a file entry declares are consulted. Nothing is
//! scanned, so a header included by a declared header does not trigger a
//! recompile unless it is declared as well.

use crate::cache::{DependencyIndex, DependencyRecord, FileIdentity, RecordedDependency};
use crate::error::{BuildError, BuildResult};
use crate::targets::{CompileUnit, TargetPlan};
use std::fmt;
use std::path::{Path, PathBuf};

/// Why a source must be recompiled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// The object file does not exist
    ObjectMissing,
    /// No record for this source
    NoRecord,
    /// The last compile failed
    PreviousFailure,
    /// The compile command line changed
    CommandChanged,
    /// Source content changed
    SourceChanged,
    /// The set of declared dependencies changed
    DependenciesRedeclared,
    /// A declared dependency changed
    DependencyChanged(PathBuf),
    /// A declared dependency does not exist
    DependencyMissing(PathBuf),
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ObjectMissing => write!(f, "object missing"),
            Self::NoRecord => write!(f, "never compiled"),
            Self::PreviousFailure => write!(f, "last compile failed"),
            Self::CommandChanged => write!(f, "command line changed"),
            Self::SourceChanged => write!(f, "source changed"),
            Self::DependenciesRedeclared => write!(f, "declared dependencies changed"),
            Self::DependencyChanged(path) => write!(f, "{} changed", path.display()),
            Self::DependencyMissing(path) => write!(f, "{} missing", path.display()),
        }
    }
}

/// Verdict for one compile unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Stale(StaleReason),
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }
}

/// Checks compile units against recorded dependency state
#[derive(Debug, Clone)]
pub struct DependencyTracker {
    root: PathBuf,
}

impl DependencyTracker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Verdict for every unit of a target, in unit order
    ///
    /// Fails with `MissingSource` if any declared source is absent.
    pub fn check_target(
        &self,
        target: &str,
        plan: &TargetPlan,
        index: &DependencyIndex,
    ) -> BuildResult<Vec<Staleness>> {
        plan.units
            .iter()
            .map(|unit| {
                let source = self.root.join(&unit.source);
                if !source.is_file() {
                    return Err(BuildError::missing_source(target, &unit.source));
                }
                Ok(self.check(unit, index.get(&unit.source)))
            })
            .collect()
    }

    /// Verdict for one unit given its last record
    pub fn check(&self, unit: &CompileUnit, record: Option<&DependencyRecord>) -> Staleness {
        if !self.root.join(&unit.object).is_file() {
            return Staleness::Stale(StaleReason::ObjectMissing);
        }

        let Some(record) = record else {
            return Staleness::Stale(StaleReason::NoRecord);
        };
        if !record.success {
            return Staleness::Stale(StaleReason::PreviousFailure);
        }
        if record.command != unit.command_signature() {
            return Staleness::Stale(StaleReason::CommandChanged);
        }
        if !self.unchanged(&record.source, &unit.source) {
            return Staleness::Stale(StaleReason::SourceChanged);
        }

        let recorded: Vec<&Path> = record.deps.iter().map(|d| d.path.as_path()).collect();
        let declared: Vec<&Path> = unit.deps.iter().map(PathBuf::as_path).collect();
        if recorded != declared {
            return Staleness::Stale(StaleReason::DependenciesRedeclared);
        }

        for dep in &record.deps {
            if !self.root.join(&dep.path).exists() {
                return Staleness::Stale(StaleReason::DependencyMissing(dep.path.clone()));
            }
            if !self.unchanged(&dep.identity, &dep.path) {
                return Staleness::Stale(StaleReason::DependencyChanged(dep.path.clone()));
            }
        }

        Staleness::Fresh
    }

    /// Snapshot what a finished compile saw
    ///
    /// Dependencies that cannot be read are left out, so the next check sees
    /// a different dependency list and recompiles.
    pub fn snapshot(&self, unit: &CompileUnit, success: bool) -> Option<DependencyRecord> {
        let source = FileIdentity::capture(&self.root.join(&unit.source)).ok()?;
        let deps = unit
            .deps
            .iter()
            .filter_map(|path| {
                FileIdentity::capture(&self.root.join(path))
                    .ok()
                    .map(|identity| RecordedDependency {
                        path: path.clone(),
                        identity,
                    })
            })
            .collect();

        Some(DependencyRecord {
            source,
            deps,
            command: unit.command_signature(),
            success,
        })
    }

    fn unchanged(&self, identity: &FileIdentity, path: &Path) -> bool {
        identity.matches(&self.root.join(path)).unwrap_or(false)
    }
}
