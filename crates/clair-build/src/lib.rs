//! Clair build orchestration
//!
//! Turns module and target descriptors into a minimal, incrementally rebuilt
//! sequence of compiler, assembler, linker and archiver invocations:
//! - Descriptor validation and default inheritance
//! - Optional feature (driver) selection
//! - Declared-dependency staleness tracking with a persisted index
//! - Recipe selection (link, raw object, static archive) per toolchain
//! - Cross-target dependency graph with cycle detection
//! - Bounded parallel execution with failure isolation

pub mod build_order;
pub mod builder;
pub mod cache;
pub mod error;
pub mod executor;
pub mod features;
pub mod model;
pub mod report;
pub mod targets;
pub mod toolchain;
pub mod tracker;

// Re-export main types
pub use build_order::{normalize_path, BuildGraph, BuildNode, TargetNode};
pub use builder::{BuildConfig, Builder};
pub use cache::{
    DependencyIndex, DependencyRecord, FileIdentity, IndexStore, ProductRecord, RecordedDependency,
};
pub use error::{BuildError, BuildResult};
pub use executor::Executor;
pub use features::{apply_features, FeatureFlag, FeatureTable, ResolvedFeature, ALL_FEATURES};
pub use model::{
    normalize, FileEntry, Module, ModuleDescriptor, Overrides, SourceKind, Target,
    TargetDescriptor, TargetFlags,
};
pub use report::{BuildReport, TargetReport, TargetStatus};
pub use targets::{CompileUnit, ProduceStep, Recipe, RecipeShape, TargetPlan};
pub use toolchain::{
    Invocation, InvocationKind, ProcessRunner, ToolOutput, ToolRunner, ToolchainKind, Toolchains,
    Tools,
};
pub use tracker::{DependencyTracker, StaleReason, Staleness};

// Re-export configuration types for convenience
pub use clair_config::{Config, ConfigLoader, Settings};
