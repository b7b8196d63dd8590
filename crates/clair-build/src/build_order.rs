//! Cross-target dependency graph and build order
//!
//! Edges are discovered from what a target's recipe references: a link input
//! naming another target's output (by path, or `-l<name>` against a `-L`
//! directory) or a post-link command mentioning it. Targets are ordered with
//! Kahn's algorithm, breaking ties by declaration index so independent targets
//! keep the order they were declared in.
use crate::error::{BuildError, BuildResult};
use crate::model::{Module, Target};
use crate::targets::{Recipe, TargetPlan};
use crate::toolchain::Toolchains;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};

/// A target in the graph
#[derive(Debug, Clone, PartialEq)]
pub struct TargetNode {
    /// Declaration index across all modules
    pub index: usize,
    pub target: Target,
    pub plan: TargetPlan,
    /// Targets this one references, by declaration index (ascending)
    pub upstream: Vec<usize>,
}

impl TargetNode {
    pub fn qualified_name(&self) -> String {
        self.target.qualified_name()
    }

    pub fn recipe(&self) -> Recipe {
        self.plan.recipe
    }
}

/// One schedulable unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BuildNode {
    /// Compile unit `unit` of target `target`
    Compile { target: usize, unit: usize },
    /// Produce the output of target `target`
    Produce { target: usize },
}

impl BuildNode {
    pub fn target(&self) -> usize {
        match self {
            Self::Compile { target, .. } | Self::Produce { target } => *target,
        }
    }
}

/// Build graph over every target of every module
#[derive(Debug, Clone, PartialEq)]
pub struct BuildGraph {
    /// Nodes in declaration order
    targets: Vec<TargetNode>,
    /// Reverse edges: who references each target
    downstream: Vec<Vec<usize>>,
    /// Topological order, upstream first
    order: Vec<usize>,
}

impl BuildGraph {
    /// Plan every target and order them, failing on a cycle
    pub fn new(modules: Vec<Module>, toolchains: &Toolchains) -> BuildResult<Self> {
        let mut targets: Vec<TargetNode> = modules
            .into_iter()
            .flat_map(|m| m.targets)
            .enumerate()
            .map(|(index, target)| {
                let plan = TargetPlan::new(&target, toolchains);
                TargetNode {
                    index,
                    target,
                    plan,
                    upstream: Vec::new(),
                }
            })
            .collect();

        let outputs: HashMap<PathBuf, usize> = targets
            .iter()
            .map(|n| (normalize_path(&n.target.output), n.index))
            .collect();

        for node in &mut targets {
            let upstream: BTreeSet<usize> = referenced_paths(&node.target, toolchains)
                .iter()
                .filter_map(|path| outputs.get(path).copied())
                .filter(|&i| i != node.index)
                .collect();
            node.upstream = upstream.into_iter().collect();
        }

        let mut downstream = vec![Vec::new(); targets.len()];
        for node in &targets {
            for &up in &node.upstream {
                downstream[up].push(node.index);
            }
        }

        let mut graph = Self {
            targets,
            downstream,
            order: Vec::new(),
        };
        graph.order = graph.compute_build_order()?;
        Ok(graph)
    }

    /// Kahn's algorithm with the smallest declaration index always first
    fn compute_build_order(&self) -> BuildResult<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.targets.iter().map(|n| n.upstream.len()).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.targets.len());
        while let Some(Reverse(index)) = ready.pop() {
            order.push(index);
            for &dependent in &self.downstream[index] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() != self.targets.len() {
            let remaining: BTreeSet<usize> = in_degree
                .iter()
                .enumerate()
                .filter(|(_, d)| **d > 0)
                .map(|(i, _)| i)
                .collect();
            let cycle = self
                .shortest_cycle(&remaining)
                .into_iter()
                .map(|i| self.targets[i].qualified_name())
                .collect();
            return Err(BuildError::Cycle { cycle });
        }

        Ok(order)
    }

    /// Shortest cycle among `remaining`, starting and ending at its
    /// earliest-declared member
    fn shortest_cycle(&self, remaining: &BTreeSet<usize>) -> Vec<usize> {
        let mut best: Option<Vec<usize>> = None;

        for &start in remaining {
            let mut parent: HashMap<usize, usize> = HashMap::new();
            let mut queue = VecDeque::from([start]);
            let mut closing = None;

            'search: while let Some(current) = queue.pop_front() {
                for &next in &self.targets[current].upstream {
                    if !remaining.contains(&next) {
                        continue;
                    }
                    if next == start {
                        closing = Some(current);
                        break 'search;
                    }
                    if !parent.contains_key(&next) {
                        parent.insert(next, current);
                        queue.push_back(next);
                    }
                }
            }

            if let Some(last) = closing {
                let mut path = vec![last];
                let mut cursor = last;
                while cursor != start {
                    cursor = parent[&cursor];
                    path.push(cursor);
                }
                path.reverse();
                path.push(start);

                if best.as_ref().map_or(true, |b| path.len() < b.len()) {
                    best = Some(path);
                }
            }
        }

        best.unwrap_or_default()
    }

    /// Targets in declaration order
    pub fn targets(&self) -> &[TargetNode] {
        &self.targets
    }

    pub fn node(&self, index: usize) -> &TargetNode {
        &self.targets[index]
    }

    /// Declaration indices in build order
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Targets in build order
    pub fn ordered(&self) -> impl Iterator<Item = &TargetNode> {
        self.order.iter().map(|&i| &self.targets[i])
    }

    /// Targets that reference `index` directly
    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.downstream[index]
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Every compile and produce node, in build order
    pub fn nodes(&self) -> Vec<BuildNode> {
        self.ordered()
            .flat_map(|node| {
                (0..node.plan.units.len())
                    .map(move |unit| BuildNode::Compile {
                        target: node.index,
                        unit,
                    })
                    .chain(std::iter::once(BuildNode::Produce { target: node.index }))
            })
            .collect()
    }

    /// Upstream edges keyed by qualified name
    pub fn edges(&self) -> BTreeMap<String, Vec<String>> {
        self.targets
            .iter()
            .map(|node| {
                let upstream = node
                    .upstream
                    .iter()
                    .map(|&i| self.targets[i].qualified_name())
                    .collect();
                (node.qualified_name(), upstream)
            })
            .collect()
    }

    /// Indices of every target matching `name` (`target` or `module/target`)
    pub fn find(&self, name: &str) -> Vec<usize> {
        self.targets
            .iter()
            .filter(|n| n.target.matches(name))
            .map(|n| n.index)
            .collect()
    }

    /// `roots` plus everything they transitively reference
    pub fn upstream_closure(&self, roots: impl IntoIterator<Item = usize>) -> BTreeSet<usize> {
        self.closure(roots, |i| &self.targets[i].upstream)
    }

    /// Everything that transitively references `index`, excluding itself
    pub fn downstream_closure(&self, index: usize) -> BTreeSet<usize> {
        let mut all = self.closure(self.downstream[index].iter().copied(), |i| &self.downstream[i]);
        all.remove(&index);
        all
    }

    /// Targets a filter selects; no filter selects everything
    pub fn select(&self, filter: Option<&[&str]>) -> BuildResult<BTreeSet<usize>> {
        let Some(names) = filter else {
            return Ok((0..self.targets.len()).collect());
        };

        let mut roots = Vec::new();
        for name in names {
            let found = self.find(name);
            if found.is_empty() {
                return Err(BuildError::target_not_found(*name));
            }
            roots.extend(found);
        }
        Ok(self.upstream_closure(roots))
    }

    fn closure<'a, F>(&'a self, roots: impl IntoIterator<Item = usize>, next: F) -> BTreeSet<usize>
    where
        F: Fn(usize) -> &'a Vec<usize>,
    {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = roots.into_iter().collect();
        while let Some(index) = stack.pop() {
            if seen.insert(index) {
                stack.extend(next(index).iter().copied());
            }
        }
        seen
    }
}

/// Every path a target's recipe mentions, normalized
fn referenced_paths(target: &Target, toolchains: &Toolchains) -> Vec<PathBuf> {
    let kind = Recipe::classify(target.flags).toolchain;
    let mut paths = Vec::new();

    let tokens = toolchains.expand_flags(kind, &target.ldflags, &target.output);
    let mut lib_dirs = Vec::new();
    let mut libs = Vec::new();
    let mut iter = tokens.iter();
    while let Some(token) = iter.next() {
        if token == "-L" {
            if let Some(dir) = iter.next() {
                lib_dirs.push(PathBuf::from(dir));
            }
        } else if let Some(dir) = token.strip_prefix("-L") {
            lib_dirs.push(PathBuf::from(dir));
        } else if let Some(lib) = token.strip_prefix("-l") {
            libs.push(lib.to_string());
        } else if !token.starts_with('-') {
            paths.push(normalize_path(Path::new(token)));
        }
    }
    for dir in &lib_dirs {
        for lib in &libs {
            paths.push(normalize_path(&dir.join(format!("lib{lib}.a"))));
        }
    }

    for command in &target.extra_ld {
        let expanded = toolchains.expand(kind, command, &target.output);
        for token in expanded.split_whitespace() {
            let token = token.trim_start_matches('@');
            let value = token.split_once('=').map_or(token, |(_, v)| v);
            let value = value.trim_matches(|c| c == '"' || c == '\'');
            if !value.is_empty() {
                paths.push(normalize_path(Path::new(value)));
            }
        }
    }

    paths
}

/// Lexically normalize a relative path (`./a/../b` → `b`)
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
