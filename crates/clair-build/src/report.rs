//! Build outcome reporting
use crate::error::BuildError;
use std::fmt;
use std::time::Duration;

/// Final state of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetStatus {
    /// Up to date, nothing ran
    Skipped,
    /// At least one step ran and all succeeded
    Rebuilt,
    Failed,
    /// Not attempted because an upstream target failed
    Blocked,
}

impl TargetStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Skipped | Self::Rebuilt)
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => write!(f, "skipped"),
            Self::Rebuilt => write!(f, "rebuilt"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// Outcome of one target
#[derive(Debug)]
pub struct TargetReport {
    /// Qualified name (`module/target`)
    pub name: String,
    pub status: TargetStatus,
    pub elapsed: Duration,
    /// Root cause when failed
    pub error: Option<BuildError>,
    /// Failing ancestor when blocked
    pub blocked_by: Option<String>,
}

impl TargetReport {
    /// Exit code of the failing subprocess, if one failed
    pub fn exit_code(&self) -> Option<i32> {
        match &self.error {
            Some(BuildError::Toolchain { exit_code, .. }) => *exit_code,
            _ => None,
        }
    }

    /// Captured stderr of the failing subprocess
    pub fn stderr(&self) -> Option<&str> {
        match &self.error {
            Some(BuildError::Toolchain { stderr, .. }) => Some(stderr),
            _ => None,
        }
    }
}

/// Outcome of a whole build, targets in build order
#[derive(Debug, Default)]
pub struct BuildReport {
    pub targets: Vec<TargetReport>,
    pub total_time: Duration,
}

impl BuildReport {
    /// Look a target up by `target` or `module/target`
    pub fn get(&self, name: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| {
            t.name == name
                || t.name
                    .split_once('/')
                    .map_or(false, |(_, target)| target == name)
        })
    }

    pub fn status(&self, name: &str) -> Option<TargetStatus> {
        self.get(name).map(|t| t.status)
    }

    pub fn is_success(&self) -> bool {
        self.targets.iter().all(|t| t.status.is_success())
    }

    /// Process exit status reflecting the worst outcome
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn count(&self, status: TargetStatus) -> usize {
        self.targets.iter().filter(|t| t.status == status).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets.iter().filter(|t| t.status == TargetStatus::Failed)
    }

    pub fn blocked(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets.iter().filter(|t| t.status == TargetStatus::Blocked)
    }

    /// Human-readable report
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} targets in {:.2}s: {} rebuilt, {} skipped, {} failed, {} blocked\n",
            self.targets.len(),
            self.total_time.as_secs_f64(),
            self.count(TargetStatus::Rebuilt),
            self.count(TargetStatus::Skipped),
            self.count(TargetStatus::Failed),
            self.count(TargetStatus::Blocked),
        );

        for target in self.failed() {
            out.push_str(&format!("  failed  {}", target.name));
            if let Some(error) = &target.error {
                out.push_str(&format!(": {error}"));
            }
            out.push('\n');
        }
        for target in self.blocked() {
            out.push_str(&format!(
                "  blocked {} (by {})\n",
                target.name,
                target.blocked_by.as_deref().unwrap_or("?")
            ));
        }
        out
    }
}
