//! Shared fixtures for integration tests
#![allow(dead_code)]

use clair_build::{
    BuildConfig, Builder, FeatureFlag, FileEntry, Invocation, InvocationKind, ModuleDescriptor,
    Overrides, ToolOutput, ToolRunner, TargetDescriptor,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Stand-in toolchain: records every call and writes the declared output
pub struct FakeRunner {
    root: PathBuf,
    calls: Mutex<Vec<Invocation>>,
    failures: Mutex<Vec<(String, i32, String)>>,
    delays: Mutex<Vec<(String, Duration)>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeRunner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            delays: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Fail any invocation whose command line contains `pattern`
    pub fn fail_on(&self, pattern: &str, exit_code: i32, stderr: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((pattern.to_string(), exit_code, stderr.to_string()));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    /// Sleep before running any invocation containing `pattern`
    pub fn delay_on(&self, pattern: &str, delay: Duration) {
        self.delays.lock().unwrap().push((pattern.to_string(), delay));
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.to_string()).collect()
    }

    pub fn calls_of(&self, kind: InvocationKind) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.to_string())
            .collect()
    }

    /// Most invocations observed running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
        self.peak.store(0, Ordering::SeqCst);
    }

    fn write_output(&self, path: &str, content: &[u8]) -> io::Result<()> {
        let path = self.root.join(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)
    }
}

impl ToolRunner for FakeRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<ToolOutput> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.execute(invocation);
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl FakeRunner {
    fn execute(&self, invocation: &Invocation) -> io::Result<ToolOutput> {
        self.calls.lock().unwrap().push(invocation.clone());
        let line = invocation.to_string();

        let delay = self
            .delays
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| line.contains(p.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _, _)| line.contains(p.as_str()))
            .cloned();
        if let Some((_, code, stderr)) = failure {
            return Ok(ToolOutput {
                exit_code: Some(code),
                stdout: String::new(),
                stderr,
                elapsed: Duration::ZERO,
            });
        }

        match invocation.kind {
            InvocationKind::Compile | InvocationKind::Assemble | InvocationKind::Link => {
                // shell-wrapped commands carry the whole line in one argument
                let words: Vec<&str> = if invocation.program == "sh" {
                    invocation.args[1].split_whitespace().collect()
                } else {
                    invocation.args.iter().map(String::as_str).collect()
                };
                if let Some(pos) = words.iter().position(|&a| a == "-o") {
                    self.write_output(words[pos + 1], format!("{line}\n").as_bytes())?;
                }
            }
            InvocationKind::Archive => {
                let mut content = Vec::new();
                for object in &invocation.args[2..] {
                    content.extend(fs::read(self.root.join(object))?);
                }
                self.write_output(&invocation.args[1], &content)?;
            }
            InvocationKind::Command => {}
        }

        Ok(ToolOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
        })
    }
}

/// Temporary source tree with a fake toolchain
pub struct Sandbox {
    pub dir: TempDir,
    pub runner: Arc<FakeRunner>,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(dir.path()));
        Self { dir, runner }
    }

    /// Sandbox holding the sources of [`os_modules`]
    pub fn os() -> Self {
        let sandbox = Self::new();
        for (path, content) in [
            ("libc/stdio.c", "int printf(const char *fmt, ...);\n"),
            ("libc/string.c", "void *memset(void *s, int c, unsigned n);\n"),
            ("libc/setjmp.asm", "global setjmp\n"),
            ("include/stdio.h", "#define EOF (-1)\n"),
            ("bin/cat.c", "int main(void) { return 0; }\n"),
            ("bin/ls.c", "int main(void) { return 1; }\n"),
            ("boot/stage0.asm", "org 0x7c00\n"),
        ] {
            sandbox.write(path, content);
        }
        sandbox
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, path: &str, content: &str) {
        let path = self.root().join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn read(&self, path: &str) -> Vec<u8> {
        fs::read(self.root().join(path)).unwrap()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.root().join(path).exists()
    }

    pub fn remove(&self, path: &str) {
        fs::remove_file(self.root().join(path)).unwrap();
    }

    pub fn config(&self) -> BuildConfig {
        BuildConfig {
            root_dir: self.root().to_path_buf(),
            jobs: 4,
            ..Default::default()
        }
    }

    pub fn builder(&self) -> Builder {
        Builder::new(self.config()).with_runner(self.runner.clone())
    }
}

fn bin(name: &str) -> TargetDescriptor {
    TargetDescriptor::new(name, format!("build/bin/{name}"))
        .with_ldflags("-T bin/linker.ld -nostdlib build/libc.a -lgcc")
        .with_c_files([format!("{name}.c").as_str()])
}

/// Userland binaries declared before the C library they link
pub fn os_modules() -> Vec<ModuleDescriptor> {
    vec![
        ModuleDescriptor::new("bin")
            .with_defaults(Overrides {
                srcdir: Some("bin".into()),
                objdir: Some("build/bin-obj".into()),
                depsdir: Some("bin".into()),
                cflags: Some("-ffreestanding -Iinclude".into()),
                extra_ld: Some(vec!["@$(STRIP) -g $@".into()]),
                ..Default::default()
            })
            .with_target(bin("cat"))
            .with_target(bin("ls")),
        ModuleDescriptor::new("libc")
            .with_defaults(Overrides {
                srcdir: Some("libc".into()),
                objdir: Some("build/libc".into()),
                depsdir: Some("include".into()),
                cflags: Some("-ffreestanding -Iinclude".into()),
                asmflags: Some("-f$(ASM_ARCH)".into()),
                flags: Some(vec!["BUILD_AR".into()]),
                ..Default::default()
            })
            .with_target(
                TargetDescriptor::new("libc", "build/libc.a")
                    .with_c_files([
                        FileEntry::new("stdio.c").with_deps(["stdio.h"]),
                        FileEntry::new("string.c"),
                    ])
                    .with_asm_files(["setjmp.asm"]),
            ),
        ModuleDescriptor::new("boot").with_target(
            TargetDescriptor::new("stage0", "build/boot/stage0.bin")
                .with_flags(&["NO_LINK"])
                .with_srcdir("boot")
                .with_asmflags("-fbin -Iboot")
                .with_asm_files(["stage0.asm"]),
        ),
    ]
}

/// Driver table used by kernel fixtures, declared out of bit order
pub fn driver_table() -> Vec<FeatureFlag> {
    vec![
        FeatureFlag::new("ext2", 0x4, "fs"),
        FeatureFlag::new("bga", 0x1, "driver"),
        FeatureFlag::new("uhci", 0x2, "driver"),
    ]
}

pub fn kernel_module() -> ModuleDescriptor {
    ModuleDescriptor::new("kernel").with_target(
        TargetDescriptor::new("kernel", "build/e.clair")
            .with_srcdir("kernel")
            .with_objdir("build/kernel")
            .with_depsdir("include/kernel")
            .with_cflags("-ffreestanding -Iinclude")
            .with_ldflags("-T kernel/linker.ld -nostdlib -lgcc")
            .with_c_files(["main.c"])
            .with_features(driver_table()),
    )
}

/// Sandbox holding the kernel sources, including every driver
pub fn kernel_sandbox() -> Sandbox {
    let sandbox = Sandbox::new();
    for (path, content) in [
        ("kernel/main.c", "void kmain(void) {}\n"),
        ("kernel/driver/bga.c", "void bga_init(void) {}\n"),
        ("include/kernel/driver/bga.h", "void bga_init(void);\n"),
        ("kernel/driver/uhci.c", "void uhci_init(void) {}\n"),
        ("include/kernel/driver/uhci.h", "void uhci_init(void);\n"),
        ("kernel/fs/ext2.c", "void ext2_mount(void) {}\n"),
        ("include/kernel/fs/ext2.h", "void ext2_mount(void);\n"),
    ] {
        sandbox.write(path, content);
    }
    sandbox
}
