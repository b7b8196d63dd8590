/// Target classification and recipe planning
use crate::cache::hash_bytes;
use crate::model::{SourceKind, Target, TargetFlags};
use crate::toolchain::{Invocation, InvocationKind, ToolchainKind, Toolchains};
use std::fmt;
use std::path::PathBuf;

/// How a target's output is produced from its objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipeShape {
    /// Link objects into an executable
    Link,
    /// Use the object bytes directly (concatenated if several)
    Raw,
    /// Archive objects into a static library
    Archive,
}

impl RecipeShape {
    /// Whether a linker is ever invoked for this shape
    pub fn uses_linker(&self) -> bool {
        matches!(self, Self::Link)
    }
}

impl fmt::Display for RecipeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Link => write!(f, "link"),
            Self::Raw => write!(f, "raw"),
            Self::Archive => write!(f, "archive"),
        }
    }
}

/// Shape plus toolchain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Recipe {
    pub shape: RecipeShape,
    pub toolchain: ToolchainKind,
}

impl Recipe {
    /// NO_LINK and BUILD_AR pick the shape, HOST_CC only the toolchain
    pub fn classify(flags: TargetFlags) -> Self {
        let shape = if flags.no_link {
            RecipeShape::Raw
        } else if flags.build_ar {
            RecipeShape::Archive
        } else {
            RecipeShape::Link
        };
        let toolchain = if flags.host_cc {
            ToolchainKind::Host
        } else {
            ToolchainKind::Cross
        };
        Self { shape, toolchain }
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.shape, self.toolchain)
    }
}

/// Compile one source into one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileUnit {
    pub kind: SourceKind,
    /// Source path relative to the build root
    pub source: PathBuf,
    pub object: PathBuf,
    /// Declared dependency paths relative to the build root
    pub deps: Vec<PathBuf>,
    pub invocation: Invocation,
}

impl CompileUnit {
    /// Hash of the command line, recorded to catch flag changes
    pub fn command_signature(&self) -> String {
        hash_bytes(self.invocation.signature().as_bytes())
    }
}

/// The step that turns objects into the target output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProduceStep {
    Link(Invocation),
    Archive(Invocation),
    Raw { objects: Vec<PathBuf> },
}

/// Everything needed to build one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPlan {
    pub recipe: Recipe,
    pub output: PathBuf,
    pub units: Vec<CompileUnit>,
    pub produce: ProduceStep,
    /// Expanded extra-ld commands, in declared order
    pub post: Vec<Invocation>,
}

impl TargetPlan {
    pub fn new(target: &Target, toolchains: &Toolchains) -> Self {
        let recipe = Recipe::classify(target.flags);
        let kind = recipe.toolchain;
        let tools = toolchains.tools(kind);
        let output = target.output.clone();

        let cflags = toolchains.expand_flags(kind, &target.cflags, &output);
        let asmflags = toolchains.expand_flags(kind, &target.asmflags, &output);
        let c_shell = toolchains.needs_shell(kind, &target.cflags, &output);
        let asm_shell = toolchains.needs_shell(kind, &target.asmflags, &output);

        let units: Vec<CompileUnit> = target
            .sources()
            .map(|(source_kind, entry)| {
                let source = target.source_path(entry);
                let object = target.object_path(entry);
                let invocation = match source_kind {
                    SourceKind::C => {
                        let mut args = cflags.clone();
                        args.push("-c".to_string());
                        args.push(path_arg(&source));
                        args.push("-o".to_string());
                        args.push(path_arg(&object));
                        let compile = Invocation::new(InvocationKind::Compile, &tools.cc, args);
                        shell_if(c_shell, compile)
                    }
                    SourceKind::Asm => {
                        let mut args = asmflags.clone();
                        args.push(path_arg(&source));
                        args.push("-o".to_string());
                        args.push(path_arg(&object));
                        let assemble = Invocation::new(InvocationKind::Assemble, &tools.asm, args);
                        shell_if(asm_shell, assemble)
                    }
                };
                CompileUnit {
                    kind: source_kind,
                    deps: entry.deps.iter().map(|d| target.dependency_path(d)).collect(),
                    source,
                    object,
                    invocation,
                }
            })
            .collect();

        let objects: Vec<PathBuf> = units.iter().map(|u| u.object.clone()).collect();

        let produce = match recipe.shape {
            RecipeShape::Link => {
                let mut args: Vec<String> = objects.iter().map(|o| path_arg(o)).collect();
                args.extend(toolchains.expand_flags(kind, &target.ldflags, &output));
                args.push("-o".to_string());
                args.push(path_arg(&output));
                let link = Invocation::new(InvocationKind::Link, &tools.cc, args);
                ProduceStep::Link(shell_if(
                    toolchains.needs_shell(kind, &target.ldflags, &output),
                    link,
                ))
            }
            RecipeShape::Archive => {
                let mut args = vec!["rcs".to_string(), path_arg(&output)];
                args.extend(objects.iter().map(|o| path_arg(o)));
                ProduceStep::Archive(Invocation::new(InvocationKind::Archive, &tools.ar, args))
            }
            RecipeShape::Raw => ProduceStep::Raw { objects },
        };

        let post = target
            .extra_ld
            .iter()
            .map(|cmd| Invocation::shell(&toolchains.expand(kind, cmd, &output)))
            .collect();

        Self {
            recipe,
            output,
            units,
            produce,
            post,
        }
    }

    /// Hash of the produce step and post-link commands
    pub fn produce_signature(&self) -> String {
        let mut text = match &self.produce {
            ProduceStep::Link(inv) | ProduceStep::Archive(inv) => inv.signature(),
            ProduceStep::Raw { objects } => {
                let objects: Vec<String> = objects.iter().map(|o| path_arg(o)).collect();
                objects.join("\0")
            }
        };
        for command in &self.post {
            text.push('\n');
            text.push_str(&command.signature());
        }
        hash_bytes(text.as_bytes())
    }

    /// Every subprocess a full rebuild of this target would run
    pub fn invocations(&self) -> Vec<&Invocation> {
        let mut all: Vec<&Invocation> = self.units.iter().map(|u| &u.invocation).collect();
        match &self.produce {
            ProduceStep::Link(inv) | ProduceStep::Archive(inv) => all.push(inv),
            ProduceStep::Raw { .. } => {}
        }
        all.extend(self.post.iter());
        all
    }
}

fn shell_if(shell: bool, invocation: Invocation) -> Invocation {
    if shell {
        invocation.through_shell()
    } else {
        invocation
    }
}

fn path_arg(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{normalize, FileEntry, ModuleDescriptor, TargetDescriptor};
    use crate::toolchain::Tools;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn toolchains() -> Toolchains {
        Toolchains {
            cross: Tools {
                cc: "i686-elf-gcc".into(),
                asm: "nasm".into(),
                ar: "i686-elf-ar".into(),
            },
            host: Tools {
                cc: "cc".into(),
                asm: "nasm".into(),
                ar: "ar".into(),
            },
            strip: "i686-elf-strip".into(),
            asm_arch: "elf32".into(),
        }
    }

    fn single(target: TargetDescriptor) -> Target {
        let module = ModuleDescriptor::new("m").with_target(target);
        normalize(&[module]).unwrap().remove(0).targets.remove(0)
    }

    #[rstest]
    #[case(&[], RecipeShape::Link, ToolchainKind::Cross)]
    #[case(&["NO_LINK"], RecipeShape::Raw, ToolchainKind::Cross)]
    #[case(&["BUILD_AR"], RecipeShape::Archive, ToolchainKind::Cross)]
    #[case(&["HOST_CC"], RecipeShape::Link, ToolchainKind::Host)]
    #[case(&["HOST_CC", "BUILD_AR"], RecipeShape::Archive, ToolchainKind::Host)]
    #[case(&["no_link", "host_cc"], RecipeShape::Raw, ToolchainKind::Host)]
    fn test_classify(
        #[case] flags: &[&str],
        #[case] shape: RecipeShape,
        #[case] toolchain: ToolchainKind,
    ) {
        let recipe = Recipe::classify(TargetFlags::parse(flags).unwrap());
        assert_eq!(recipe, Recipe { shape, toolchain });
    }

    #[test]
    fn test_link_plan_command_lines() {
        let target = single(
            TargetDescriptor::new("kernel", "build/e.clair")
                .with_srcdir("kernel")
                .with_objdir("build/kernel")
                .with_depsdir("include/kernel")
                .with_cflags("-ffreestanding -Iinclude")
                .with_asmflags("-f$(ASMARCH)")
                .with_ldflags("-T kernel/linker.ld -nostdlib -lgcc")
                .with_c_files([FileEntry::new("main.c")])
                .with_asm_files([FileEntry::new("idta.asm").with_deps(["idt.h"])]),
        );
        let plan = TargetPlan::new(&target, &toolchains());

        assert_eq!(
            plan.units[0].invocation.to_string(),
            "i686-elf-gcc -ffreestanding -Iinclude -c kernel/main.c -o build/kernel/main.c.o"
        );
        assert_eq!(
            plan.units[1].invocation.to_string(),
            "nasm -felf32 kernel/idta.asm -o build/kernel/idta.asm.o"
        );
        assert_eq!(plan.units[1].deps, vec![PathBuf::from("include/kernel/idt.h")]);
        match &plan.produce {
            ProduceStep::Link(inv) => assert_eq!(
                inv.to_string(),
                "i686-elf-gcc build/kernel/main.c.o build/kernel/idta.asm.o \
                 -T kernel/linker.ld -nostdlib -lgcc -o build/e.clair"
            ),
            other => panic!("Expected link step, got {:?}", other),
        }
    }

    #[test]
    fn test_archive_plan_uses_host_archiver() {
        let target = single(
            TargetDescriptor::new("libhost", "build/libhost.a")
                .with_flags(&["BUILD_AR", "HOST_CC"])
                .with_c_files(["a.c", "b.c"]),
        );
        let plan = TargetPlan::new(&target, &toolchains());

        assert_eq!(plan.units[0].invocation.program, "cc");
        match &plan.produce {
            ProduceStep::Archive(inv) => assert_eq!(
                inv.to_string(),
                "ar rcs build/libhost.a build/m/a.c.o build/m/b.c.o"
            ),
            other => panic!("Expected archive step, got {:?}", other),
        }
    }

    #[test]
    fn test_no_link_never_links_even_with_ldflags() {
        let target = single(
            TargetDescriptor::new("stage1", "build/boot/stage1.bin")
                .with_flags(&["NO_LINK"])
                .with_asmflags("-fbin -Iboot")
                .with_ldflags("-T boot/linker.ld")
                .with_asm_files(["main.asm"]),
        );
        let plan = TargetPlan::new(&target, &toolchains());

        assert!(!plan.recipe.shape.uses_linker());
        assert_eq!(
            plan.produce,
            ProduceStep::Raw {
                objects: vec![PathBuf::from("build/m/main.asm.o")]
            }
        );
        assert!(plan
            .invocations()
            .iter()
            .all(|inv| inv.kind != InvocationKind::Link));
    }

    #[test]
    fn test_post_commands_expanded_in_order() {
        let target = single(
            TargetDescriptor::new("cat", "build/bin/cat")
                .with_c_files(["cat.c"])
                .with_extra_ld(&["@$(STRIP) -g $@", "chmod +x $@"]),
        );
        let plan = TargetPlan::new(&target, &toolchains());

        let commands: Vec<_> = plan.post.iter().map(|p| p.args[1].clone()).collect();
        assert_eq!(
            commands,
            vec!["i686-elf-strip -g build/bin/cat", "chmod +x build/bin/cat"]
        );
    }

    #[test]
    fn test_substituted_flags_run_through_shell() {
        let target = single(
            TargetDescriptor::new("mntecfs", "build/mntecfs")
                .with_flags(&["HOST_CC"])
                .with_srcdir("tools")
                .with_objdir("build/tools")
                .with_cflags("`pkg-config --cflags fuse` -g")
                .with_ldflags("`pkg-config --libs fuse` -lm -g")
                .with_c_files(["mntecfs.c"]),
        );
        let plan = TargetPlan::new(&target, &toolchains());

        let compile = &plan.units[0].invocation;
        assert_eq!(compile.kind, InvocationKind::Compile);
        assert_eq!(compile.program, "sh");
        assert_eq!(
            compile.args,
            vec![
                "-c",
                "cc `pkg-config --cflags fuse` -g -c tools/mntecfs.c -o build/tools/mntecfs.c.o"
            ]
        );
        match &plan.produce {
            ProduceStep::Link(inv) => assert_eq!(
                inv.args[1],
                "cc build/tools/mntecfs.c.o `pkg-config --libs fuse` -lm -g -o build/mntecfs"
            ),
            other => panic!("Expected link step, got {:?}", other),
        }
    }

    #[test]
    fn test_produce_signature_tracks_ldflags_and_post() {
        let base = TargetDescriptor::new("cat", "build/bin/cat").with_c_files(["cat.c"]);
        let tc = toolchains();
        let signature = |t: TargetDescriptor| TargetPlan::new(&single(t), &tc).produce_signature();

        let plain = signature(base.clone());
        assert_eq!(plain, signature(base.clone()));
        assert_ne!(plain, signature(base.clone().with_ldflags("-lgcc")));
        assert_ne!(plain, signature(base.with_extra_ld(&["@$(STRIP) $@"])));
    }

    #[test]
    fn test_command_signature_tracks_flags() {
        let a = single(TargetDescriptor::new("k", "k.bin").with_c_files(["main.c"]));
        let b = single(
            TargetDescriptor::new("k", "k.bin")
                .with_cflags("-DDRIVER_BGA")
                .with_c_files(["main.c"]),
        );
        let tc = toolchains();
        assert_ne!(
            TargetPlan::new(&a, &tc).units[0].command_signature(),
            TargetPlan::new(&b, &tc).units[0].command_signature()
        );
    }
}
