//! Build orchestration entry points
use crate::build_order::BuildGraph;
use crate::error::BuildResult;
use crate::executor::Executor;
use crate::features::apply_features;
use crate::model::{normalize, ModuleDescriptor};
use crate::report::BuildReport;
use crate::toolchain::{ProcessRunner, ToolRunner, Toolchains, Tools};
use clair_config::{Config, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global build options
#[derive(Debug, Clone, PartialEq)]
pub struct BuildConfig {
    /// Directory every descriptor path is relative to
    pub root_dir: PathBuf,
    /// Feature selection (empty means all)
    pub features: String,
    /// Assembler output format substituted for `$(ASMARCH)`
    pub asm_arch: String,
    pub cross: Tools,
    pub host: Tools,
    pub strip: String,
    /// Concurrency limit
    pub jobs: usize,
    /// Optional global timeout
    pub timeout: Option<Duration>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl BuildConfig {
    /// Options from merged settings, rooted at the current directory
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            root_dir: PathBuf::from("."),
            features: settings.features().to_string(),
            asm_arch: settings.asm_arch().to_string(),
            cross: settings.cross_tools(),
            host: settings.host_tools(),
            strip: settings.strip(),
            jobs: settings.jobs(),
            timeout: settings.timeout(),
        }
    }

    /// Options from a loaded configuration, rooted at its project
    pub fn from_config(config: &Config) -> Self {
        let mut build = Self::from_settings(&config.settings);
        if let Some(root) = config.project_root() {
            build.root_dir = root.to_path_buf();
        }
        build
    }
}

/// Main builder for orchestrating builds
pub struct Builder {
    config: BuildConfig,
    runner: Arc<dyn ToolRunner>,
}

impl Builder {
    /// Builder running real processes in the configured root
    pub fn new(config: BuildConfig) -> Self {
        let runner = Arc::new(ProcessRunner::new(&config.root_dir));
        Self { config, runner }
    }

    /// Replace the subprocess runner
    pub fn with_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.config.jobs = jobs;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_features(mut self, features: impl Into<String>) -> Self {
        self.config.features = features.into();
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Validate, resolve features and order every target without touching disk
    pub fn plan(&self, modules: &[ModuleDescriptor]) -> BuildResult<BuildGraph> {
        let mut normalized = normalize(modules)?;
        apply_features(&mut normalized, &self.config.features)?;
        BuildGraph::new(normalized, &Toolchains::from_config(&self.config))
    }

    /// Build every target, or only `filter` and what it depends on
    ///
    /// Descriptor, feature, cycle and filter errors are returned before any
    /// subprocess runs. Per-target failures are reported in the
    /// [`BuildReport`] instead.
    pub fn build(
        &self,
        modules: &[ModuleDescriptor],
        filter: Option<&[&str]>,
    ) -> BuildResult<BuildReport> {
        let start = Instant::now();
        let graph = self.plan(modules)?;
        let selected = graph.select(filter)?;

        log::info!(
            "building {} of {} targets with {} jobs",
            selected.len(),
            graph.len(),
            self.config.jobs
        );
        for node in graph.ordered().filter(|n| selected.contains(&n.index)) {
            log::debug!(
                "{}: {} -> {}",
                node.qualified_name(),
                node.recipe(),
                node.target.output.display()
            );
        }

        let mut report = Executor::new(&graph, Arc::clone(&self.runner), &self.config.root_dir)
            .with_jobs(self.config.jobs)
            .with_timeout(self.config.timeout)
            .run(&selected)?;
        report.total_time = start.elapsed();

        if report.is_success() {
            log::info!("build finished in {:.2}s", report.total_time.as_secs_f64());
        } else {
            log::error!("{}", report.summary().trim_end());
        }
        Ok(report)
    }
}
