//! Optional feature (driver) selection
//!
//! A feature table is a fixed list of rows `{name, bit, dir}`. Resolving a
//! selection never depends on the order names were typed: enabled rows are
//! always emitted in bit order, so the same enabled set produces the same file
//! list, the same defines and therefore the same objects and graph.

use crate::error::{BuildError, BuildResult};
use crate::model::{FileEntry, Module};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Name accepted in a selection for every row of a table
pub const ALL_FEATURES: &str = "all";

/// One selectable feature
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureFlag {
    pub name: String,
    pub bit: u32,
    /// Sub-directory of the target's sources holding this feature
    pub dir: String,
}

impl FeatureFlag {
    pub fn new(name: impl Into<String>, bit: u32, dir: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bit,
            dir: dir.into(),
        }
    }

    /// Preprocessor define enabling the feature, e.g. `DRIVER_BGA`
    pub fn define(&self) -> String {
        format!("DRIVER_{}", self.name.to_ascii_uppercase())
    }

    /// `<dir>/<name>.c`, declaring `<dir>/<name>.h`
    pub fn file_entry(&self) -> FileEntry {
        let base = PathBuf::from(&self.dir).join(&self.name);
        FileEntry::new(base.with_extension("c")).with_deps([base.with_extension("h")])
    }
}

/// A feature's contribution to its target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFeature {
    pub entry: FileEntry,
    pub define: String,
}

/// Immutable, bit-ordered feature table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureTable {
    rows: Vec<FeatureFlag>,
}

impl FeatureTable {
    /// Validate rows and order them by bit
    pub fn new(mut rows: Vec<FeatureFlag>) -> BuildResult<Self> {
        let mut names = BTreeSet::new();
        let mut bits = 0u32;

        for row in &rows {
            let name = row.name.trim().to_ascii_lowercase();
            if name.is_empty() || name == ALL_FEATURES || name.contains(',') {
                return Err(BuildError::validation(
                    "<features>",
                    format!("invalid feature name '{}'", row.name),
                ));
            }
            if !row.bit.is_power_of_two() {
                return Err(BuildError::validation(
                    "<features>",
                    format!("feature '{}' must use exactly one bit, got {:#x}", row.name, row.bit),
                ));
            }
            if !names.insert(name) {
                return Err(BuildError::validation(
                    "<features>",
                    format!("feature '{}' declared more than once", row.name),
                ));
            }
            if bits & row.bit != 0 {
                return Err(BuildError::validation(
                    "<features>",
                    format!("feature '{}' reuses bit {:#x}", row.name, row.bit),
                ));
            }
            bits |= row.bit;
        }

        rows.sort_by_key(|r| r.bit);
        Ok(Self { rows })
    }

    /// Rows in bit order
    pub fn rows(&self) -> &[FeatureFlag] {
        &self.rows
    }

    /// Bitwise OR of every row
    pub fn all(&self) -> u32 {
        self.rows.iter().fold(0, |mask, row| mask | row.bit)
    }

    /// Find a row by name (case-insensitive)
    pub fn lookup(&self, name: &str) -> Option<&FeatureFlag> {
        self.rows.iter().find(|r| r.name.eq_ignore_ascii_case(name.trim()))
    }

    /// Parse a selection string against this table alone
    pub fn parse_selection(&self, selection: &str) -> BuildResult<u32> {
        let parsed = Selection::parse(selection);
        parsed.check_known(std::slice::from_ref(self))?;
        Ok(parsed.mask_for(self))
    }

    /// Contributions of every enabled row, in bit order
    pub fn resolve(&self, mask: u32) -> Vec<ResolvedFeature> {
        self.rows
            .iter()
            .filter(|row| mask & row.bit != 0)
            .map(|row| ResolvedFeature {
                entry: row.file_entry(),
                define: row.define(),
            })
            .collect()
    }
}

/// A parsed selection string
#[derive(Debug, Clone, PartialEq, Eq)]
struct Selection {
    all: bool,
    names: Vec<String>,
}

impl Selection {
    fn parse(selection: &str) -> Self {
        let names: Vec<String> = selection
            .split(',')
            .map(|n| n.trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .collect();

        Self {
            all: names.is_empty() || names.iter().any(|n| n == ALL_FEATURES),
            names,
        }
    }

    /// Every name must belong to at least one table
    fn check_known(&self, tables: &[FeatureTable]) -> BuildResult<()> {
        for name in self.names.iter().filter(|n| *n != ALL_FEATURES) {
            if !tables.iter().any(|t| t.lookup(name).is_some()) {
                let available: BTreeSet<&str> = tables
                    .iter()
                    .flat_map(|t| t.rows.iter().map(|r| r.name.as_str()))
                    .collect();
                return Err(BuildError::UnknownFeature {
                    name: name.clone(),
                    available: available.into_iter().collect::<Vec<_>>().join(", "),
                });
            }
        }
        Ok(())
    }

    fn mask_for(&self, table: &FeatureTable) -> u32 {
        if self.all {
            return table.all();
        }
        self.names
            .iter()
            .filter_map(|n| table.lookup(n))
            .fold(0, |mask, row| mask | row.bit)
    }
}

/// Merge the selected features into every target owning a table
///
/// Entries are appended after the declared C files and `-D<define>` flags
/// after the declared cflags, both in bit order. An entry whose source is
/// already declared keeps the declared entry and only gains the define.
pub fn apply_features(modules: &mut [Module], selection: &str) -> BuildResult<()> {
    let parsed = Selection::parse(selection);
    let tables: Vec<FeatureTable> = modules
        .iter()
        .flat_map(|m| m.targets.iter())
        .filter_map(|t| t.features.clone())
        .collect();

    if tables.is_empty() {
        if parsed.names.iter().any(|n| n != ALL_FEATURES) {
            parsed.check_known(&tables)?;
        }
        return Ok(());
    }
    parsed.check_known(&tables)?;

    for target in modules.iter_mut().flat_map(|m| m.targets.iter_mut()) {
        let Some(table) = &target.features else { continue };
        let resolved = table.resolve(parsed.mask_for(table));

        for feature in resolved {
            if !target.c_files.iter().any(|e| e.source == feature.entry.source) {
                target.c_files.push(feature.entry);
            }
            if !target.cflags.is_empty() {
                target.cflags.push(' ');
            }
            target.cflags.push_str("-D");
            target.cflags.push_str(&feature.define);
        }

        log::debug!("{}: features resolved, cflags '{}'", target.qualified_name(), target.cflags);
    }

    Ok(())
}
