//! Execution path planning.
//!
//! An execution path such as `messages-OpenAiStyleModel` is a chain of
//! segments separated by `-`. A segment may hold several comma-separated
//! members that run side by side. Each member names a converter target or a
//! component identity.

use crate::config::{ConverterKind, PipelineSpec};
use crate::errors::PlanError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// What a plan node refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// A configured component.
    Component,
    /// A converter target.
    Converter,
}

/// One stage of an execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Canonical stage name: the converter target or component identity.
    pub name: String,
    /// Whether the stage is a component or a converter.
    pub kind: NodeKind,
    /// Stages whose output this stage consumes, in path order.
    pub dependencies: Vec<String>,
}

impl PlanNode {
    fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            dependencies: Vec::new(),
        }
    }
}

/// A validated, acyclic execution plan in topological order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pipeline: String,
    nodes: Vec<PlanNode>,
    terminals: Vec<String>,
}

impl ExecutionPlan {
    /// The pipeline this plan was built for.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Nodes in topological order.
    #[must_use]
    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    /// Finds a node by name, ignoring ASCII case.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.name.eq_ignore_ascii_case(name))
    }

    /// Returns true if the plan has a node with this name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.node(name).is_some()
    }

    /// Names of the final segment's stages; their outputs are the result.
    #[must_use]
    pub fn terminals(&self) -> &[String] {
        &self.terminals
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the plan has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Groups nodes into waves. Every node's dependencies sit in earlier
    /// waves, so the nodes of one wave can run concurrently.
    #[must_use]
    pub fn waves(&self) -> Vec<Vec<&PlanNode>> {
        let mut level: HashMap<&str, usize> = HashMap::new();
        let mut waves: Vec<Vec<&PlanNode>> = Vec::new();

        for node in &self.nodes {
            let depth = node
                .dependencies
                .iter()
                .filter_map(|d| level.get(d.as_str()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(&node.name, depth);
            if waves.len() <= depth {
                waves.resize_with(depth + 1, Vec::new);
            }
            waves[depth].push(node);
        }

        waves
    }
}

/// Plans the execution path of `spec`.
///
/// # Errors
///
/// Returns [`PlanError::EmptyPath`] for an empty path,
/// [`PlanError::UnresolvedToken`] for a member that names nothing, and
/// [`PlanError::CycleDetected`] if stages or converters depend on themselves.
pub fn plan(pipeline: &str, spec: &PipelineSpec) -> Result<ExecutionPlan, PlanError> {
    let segments = parse_segments(pipeline, &spec.execution_path)?
        .into_iter()
        .map(|segment| {
            segment
                .iter()
                .map(|token| {
                    resolve(spec, token).ok_or_else(|| PlanError::UnresolvedToken {
                        pipeline: pipeline.to_string(),
                        token: token.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;

    check_converter_cycles(pipeline, spec)?;

    let in_path: HashSet<String> = segments
        .iter()
        .flatten()
        .map(|(name, _)| name.to_ascii_lowercase())
        .collect();

    let mut nodes: Vec<PlanNode> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (i, segment) in segments.iter().enumerate() {
        let previous: Vec<String> = if i == 0 {
            Vec::new()
        } else {
            segments[i - 1].iter().map(|(name, _)| name.clone()).collect()
        };

        for (name, kind) in segment {
            let fan_in = match kind {
                NodeKind::Converter => converter_fan_in(spec, name, &in_path),
                NodeKind::Component => Vec::new(),
            };
            let deps = if fan_in.is_empty() { previous.clone() } else { fan_in };

            let idx = *index.entry(name.to_ascii_lowercase()).or_insert_with(|| {
                nodes.push(PlanNode::new(name.clone(), *kind));
                nodes.len() - 1
            });
            for dep in deps {
                if !nodes[idx].dependencies.contains(&dep) {
                    nodes[idx].dependencies.push(dep);
                }
            }
        }
    }

    // A list converter bound to a parameter reads its in-path sources at run time.
    for node in &mut nodes {
        if node.kind != NodeKind::Component {
            continue;
        }
        let Some(component) = spec.component(&node.name) else {
            continue;
        };
        for key in component.param.keys() {
            for dep in param_sources(spec, key, &in_path) {
                if !node.dependencies.contains(&dep) {
                    node.dependencies.push(dep);
                }
            }
        }
    }

    if let Some(cycle) = find_cycle(&nodes) {
        return Err(PlanError::CycleDetected {
            pipeline: pipeline.to_string(),
            cycle,
        });
    }

    let mut terminals: Vec<String> = Vec::new();
    if let Some(last) = segments.last() {
        for (name, _) in last {
            if !terminals.contains(name) {
                terminals.push(name.clone());
            }
        }
    }

    let nodes = topological_sort(nodes);
    debug!(
        pipeline = %pipeline,
        stages = ?nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(),
        "Planned execution path"
    );

    Ok(ExecutionPlan {
        pipeline: pipeline.to_string(),
        nodes,
        terminals,
    })
}

fn parse_segments(pipeline: &str, path: &str) -> Result<Vec<Vec<String>>, PlanError> {
    if path.trim().is_empty() {
        return Err(PlanError::EmptyPath {
            pipeline: pipeline.to_string(),
        });
    }

    path.split('-')
        .map(|segment| {
            segment
                .split(',')
                .map(|member| {
                    let member = member.trim();
                    if member.is_empty() {
                        Err(PlanError::UnresolvedToken {
                            pipeline: pipeline.to_string(),
                            token: String::new(),
                        })
                    } else {
                        Ok(member.to_string())
                    }
                })
                .collect()
        })
        .collect()
}

/// Resolves a name against converter targets first, then component identities.
fn resolve(spec: &PipelineSpec, token: &str) -> Option<(String, NodeKind)> {
    if let Some(rule) = spec.converter(token) {
        return Some((rule.target_name.clone(), NodeKind::Converter));
    }
    spec.component(token)
        .map(|component| (component.identity().to_string(), NodeKind::Component))
}

/// Source stages of a converter that are themselves on the path.
fn converter_fan_in(spec: &PipelineSpec, target: &str, in_path: &HashSet<String>) -> Vec<String> {
    let Some(rule) = spec.converter(target) else {
        return Vec::new();
    };

    let mut fan_in = Vec::new();
    for source in &rule.sources {
        if let Some((name, _)) = resolve(spec, source) {
            if in_path.contains(&name.to_ascii_lowercase()) && !fan_in.contains(&name) {
                fan_in.push(name);
            }
        }
    }
    fan_in
}

/// In-path stages that feed the list converter bound to `param`, following
/// nested list converters that are not on the path themselves.
fn param_sources(spec: &PipelineSpec, param: &str, in_path: &HashSet<String>) -> Vec<String> {
    let mut sources = Vec::new();
    let mut seen = HashSet::new();
    let mut pending = vec![param.to_string()];

    while let Some(target) = pending.pop() {
        let Some(rule) = spec.converter(&target) else {
            continue;
        };
        if rule.kind != ConverterKind::List || !seen.insert(rule.target_name.to_ascii_lowercase()) {
            continue;
        }
        if in_path.contains(&rule.target_name.to_ascii_lowercase()) {
            if !sources.contains(&rule.target_name) {
                sources.push(rule.target_name.clone());
            }
            continue;
        }
        for source in &rule.sources {
            match resolve(spec, source) {
                Some((name, NodeKind::Converter)) => pending.push(name),
                Some((name, NodeKind::Component)) => {
                    if in_path.contains(&name.to_ascii_lowercase()) && !sources.contains(&name) {
                        sources.push(name);
                    }
                }
                None => {}
            }
        }
    }
    sources
}

fn check_converter_cycles(pipeline: &str, spec: &PipelineSpec) -> Result<(), PlanError> {
    let nodes: Vec<PlanNode> = spec
        .converters
        .iter()
        .map(|rule| PlanNode {
            name: rule.target_name.clone(),
            kind: NodeKind::Converter,
            dependencies: rule
                .sources
                .iter()
                .filter_map(|source| spec.converter(source).map(|r| r.target_name.clone()))
                .collect(),
        })
        .collect();

    match find_cycle(&nodes) {
        Some(cycle) => Err(PlanError::CycleDetected {
            pipeline: pipeline.to_string(),
            cycle,
        }),
        None => Ok(()),
    }
}

fn find_cycle(nodes: &[PlanNode]) -> Option<Vec<String>> {
    let by_name: HashMap<&str, &PlanNode> = nodes.iter().map(|n| (n.name.as_str(), n)).collect();
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for node in nodes {
        if !visited.contains(node.name.as_str()) {
            if let Some(cycle) = dfs_cycle(&node.name, &by_name, &mut visited, &mut rec_stack, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_cycle<'a>(
    node: &'a str,
    by_name: &HashMap<&'a str, &'a PlanNode>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(&spec) = by_name.get(node) {
        for dep in &spec.dependencies {
            let dep = dep.as_str();
            if rec_stack.contains(dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| (*n).to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
            if !visited.contains(dep) && by_name.contains_key(dep) {
                if let Some(cycle) = dfs_cycle(dep, by_name, visited, rec_stack, path) {
                    return Some(cycle);
                }
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

/// Depth-first order from path order, so ties keep the order of the path.
fn topological_sort(nodes: Vec<PlanNode>) -> Vec<PlanNode> {
    fn visit(
        idx: usize,
        nodes: &[PlanNode],
        by_name: &HashMap<&str, usize>,
        visited: &mut [bool],
        order: &mut Vec<usize>,
    ) {
        if visited[idx] {
            return;
        }
        visited[idx] = true;
        for dep in &nodes[idx].dependencies {
            if let Some(&d) = by_name.get(dep.as_str()) {
                visit(d, nodes, by_name, visited, order);
            }
        }
        order.push(idx);
    }

    let by_name: HashMap<&str, usize> = nodes.iter().enumerate().map(|(i, n)| (n.name.as_str(), i)).collect();
    let mut visited = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    for idx in 0..nodes.len() {
        visit(idx, &nodes, &by_name, &mut visited, &mut order);
    }

    let mut slots: Vec<Option<PlanNode>> = nodes.into_iter().map(Some).collect();
    order.into_iter().filter_map(|idx| slots[idx].take()).collect()
}
