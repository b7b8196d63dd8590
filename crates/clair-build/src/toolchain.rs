//! Toolchain programs and subprocess execution
//!
//! Every compiler, assembler, linker, archiver and post-link command goes
//! through a [`ToolRunner`]. The default [`ProcessRunner`] spawns the program
//! in the build root and captures its output; tests substitute a recording
//! runner.

pub use clair_config::Tools;

use crate::builder::BuildConfig;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Which toolchain a target is built with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolchainKind {
    /// Freestanding cross compiler
    Cross,
    /// The host's native compiler
    Host,
}

impl fmt::Display for ToolchainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cross => write!(f, "cross"),
            Self::Host => write!(f, "host"),
        }
    }
}

/// Both toolchains plus the values substituted into flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchains {
    pub cross: Tools,
    pub host: Tools,
    pub strip: String,
    pub asm_arch: String,
}

impl Toolchains {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            cross: config.cross.clone(),
            host: config.host.clone(),
            strip: config.strip.clone(),
            asm_arch: config.asm_arch.clone(),
        }
    }

    pub fn tools(&self, kind: ToolchainKind) -> &Tools {
        match kind {
            ToolchainKind::Cross => &self.cross,
            ToolchainKind::Host => &self.host,
        }
    }

    /// Substitute `$@`, `$(ASMARCH)`, `$(ASM_ARCH)`, `$(STRIP)`, `$(CC)`, `$(AS)`
    /// and `$(AR)` in a flag string or command
    pub fn expand(&self, kind: ToolchainKind, text: &str, output: &Path) -> String {
        let tools = self.tools(kind);
        text.replace("$@", &output.to_string_lossy())
            .replace("$(ASMARCH)", &self.asm_arch)
            .replace("$(ASM_ARCH)", &self.asm_arch)
            .replace("$(STRIP)", &self.strip)
            .replace("$(CC)", &tools.cc)
            .replace("$(AS)", &tools.asm)
            .replace("$(AR)", &tools.ar)
    }

    /// Expand and split a flag string on whitespace
    pub fn expand_flags(&self, kind: ToolchainKind, flags: &str, output: &Path) -> Vec<String> {
        self.expand(kind, flags, output)
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Whether a flag string still holds command substitutions after expansion
    pub fn needs_shell(&self, kind: ToolchainKind, flags: &str, output: &Path) -> bool {
        let expanded = self.expand(kind, flags, output);
        expanded.contains('`') || expanded.contains("$(")
    }
}

/// What an invocation does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationKind {
    Compile,
    Assemble,
    Link,
    Archive,
    /// Post-link shell command
    Command,
}

impl fmt::Display for InvocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Compile => "compile",
            Self::Assemble => "assemble",
            Self::Link => "link",
            Self::Archive => "archive",
            Self::Command => "command",
        };
        write!(f, "{name}")
    }
}

/// One subprocess call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Invocation {
    pub kind: InvocationKind,
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(kind: InvocationKind, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind,
            program: program.into(),
            args,
        }
    }

    /// `sh -c <command>` with make's leading `@` removed
    pub fn shell(command: &str) -> Self {
        let command = command.trim_start();
        let command = command.strip_prefix('@').unwrap_or(command);
        Self::new(
            InvocationKind::Command,
            "sh",
            vec!["-c".to_string(), command.trim().to_string()],
        )
    }

    /// The same command line handed to `sh -c`, keeping its kind
    ///
    /// Used when flags carry substitutions such as `` `pkg-config --libs fuse` ``.
    pub fn through_shell(self) -> Self {
        let line = self.to_string();
        Self::new(self.kind, "sh", vec!["-c".to_string(), line])
    }

    /// Stable text used to detect command changes between builds
    pub fn signature(&self) -> String {
        let mut text = self.program.clone();
        for arg in &self.args {
            text.push('\0');
            text.push_str(arg);
        }
        text
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code; `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Launches toolchain subprocesses
pub trait ToolRunner: Send + Sync {
    /// Run to completion; `Err` only when the program could not be started
    fn run(&self, invocation: &Invocation) -> io::Result<ToolOutput>;
}

/// Runs invocations as real processes inside the build root
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    working_dir: PathBuf,
}

impl ProcessRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

impl ToolRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<ToolOutput> {
        let start = Instant::now();

        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?
            .wait_with_output()?;

        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            elapsed: start.elapsed(),
        })
    }
}
