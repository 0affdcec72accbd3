//! Workflow graph model.
//!
//! A [`WorkflowDag`] is an immutable definition: a list of [`Node`]s whose
//! `dependencies` sets form the edges. Per-run state never lives here, so one
//! definition can back many concurrent executions.

pub mod condition;
pub mod node;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use evoflow_core::error::{DagViolation, EvoflowError, Result};

pub use node::{Node, RetryPolicy};

use crate::template;

/// A complete workflow definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDag {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Visited,
}

impl WorkflowDag {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            name: None,
            description: None,
            nodes,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Parse a JSON definition.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| EvoflowError::WorkflowParse(e.to_string()))
    }

    /// Parse a TOML definition (`[[nodes]]` tables).
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| EvoflowError::WorkflowParse(e.to_string()))
    }

    /// Load a definition from disk; `.toml` files parse as TOML, anything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        let mut dag = if is_toml {
            Self::from_toml(&text)?
        } else {
            Self::from_json(&text)?
        };
        if dag.name.is_none() {
            dag.name = path.file_stem().map(|s| s.to_string_lossy().into_owned());
        }
        Ok(dag)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of nodes with no dependencies, ascending.
    pub fn roots(&self) -> Vec<&str> {
        let mut roots: Vec<&str> = self
            .nodes
            .iter()
            .filter(|n| n.is_root())
            .map(|n| n.id.as_str())
            .collect();
        roots.sort_unstable();
        roots
    }

    /// Reverse adjacency: node id to the ids that depend on it directly.
    pub fn dependents(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut out: BTreeMap<&str, Vec<&str>> =
            self.nodes.iter().map(|n| (n.id.as_str(), vec![])).collect();
        for node in &self.nodes {
            for dep in &node.dependencies {
                if let Some(list) = out.get_mut(dep.as_str()) {
                    list.push(node.id.as_str());
                }
            }
        }
        for list in out.values_mut() {
            list.sort_unstable();
        }
        out
    }

    /// Check structural rules, reporting the first violation found.
    ///
    /// Rules are applied in order: referenceable ids, unique ids, known
    /// dependencies, no cycles, at least one root, and placeholders only
    /// naming transitive dependencies. An empty workflow is valid.
    pub fn validate(&self) -> Result<()> {
        if let Some(node) = self
            .nodes
            .iter()
            .find(|n| !template::is_referenceable_id(&n.id))
        {
            return Err(DagViolation::InvalidId {
                node: node.id.clone(),
            }
            .into());
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(DagViolation::DuplicateId {
                    node: node.id.clone(),
                }
                .into());
            }
        }

        for node in &self.nodes {
            if let Some(missing) = node
                .dependencies
                .iter()
                .find(|d| !ids.contains(d.as_str()))
            {
                return Err(DagViolation::DanglingReference {
                    node: node.id.clone(),
                    missing: missing.clone(),
                }
                .into());
            }
        }

        if let Some(path) = self.find_cycle() {
            return Err(DagViolation::Cycle { path }.into());
        }

        if !self.nodes.is_empty() && self.roots().is_empty() {
            return Err(DagViolation::NoRoot.into());
        }

        let ancestors = self.ancestors();
        let mut ordered: Vec<&Node> = self.nodes.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));
        for node in ordered {
            let allowed = ancestors.get(node.id.as_str());
            for reference in template::referenced_nodes(&node.input_data) {
                if !allowed.is_some_and(|a| a.contains(reference.as_str())) {
                    return Err(DagViolation::UndeclaredReference {
                        node: node.id.clone(),
                        reference,
                    }
                    .into());
                }
            }
        }

        Ok(())
    }

    /// Group nodes into waves: every node in wave `k` depends only on nodes in
    /// earlier waves. Ids within a wave are ascending.
    pub fn topological_levels(&self) -> Result<Vec<Vec<String>>> {
        self.validate()?;

        let mut remaining: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.dependencies.len()))
            .collect();
        let dependents = self.dependents();
        let mut levels = Vec::new();

        let mut wave: Vec<&str> = remaining
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();

        while !wave.is_empty() {
            let mut next = BTreeSet::new();
            for id in &wave {
                remaining.remove(id);
                for &child in dependents.get(id).into_iter().flatten() {
                    if let Some(deg) = remaining.get_mut(child) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.insert(child);
                        }
                    }
                }
            }
            levels.push(wave.iter().map(|s| s.to_string()).collect());
            wave = next.into_iter().collect();
        }

        Ok(levels)
    }

    /// Depth-first search over dependency edges. Returns the cycle path with
    /// the repeated node at both ends, e.g. `["a", "b", "a"]`.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let deps: BTreeMap<&str, &BTreeSet<String>> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), &n.dependencies))
            .collect();
        let mut states: BTreeMap<&str, VisitState> = BTreeMap::new();
        let mut stack: Vec<&str> = Vec::new();

        for &id in deps.keys() {
            if states.contains_key(id) {
                continue;
            }
            if let Some(path) = detect_cycle(id, &deps, &mut states, &mut stack) {
                return Some(path);
            }
        }
        None
    }

    /// Transitive dependency set of every node. Assumes the graph is acyclic.
    fn ancestors(&self) -> BTreeMap<&str, BTreeSet<&str>> {
        let by_id: BTreeMap<&str, &Node> = self.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut memo: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        fn walk<'a>(
            id: &'a str,
            by_id: &BTreeMap<&'a str, &'a Node>,
            memo: &mut BTreeMap<&'a str, BTreeSet<&'a str>>,
        ) -> BTreeSet<&'a str> {
            if let Some(done) = memo.get(id) {
                return done.clone();
            }
            let mut set = BTreeSet::new();
            if let Some(&node) = by_id.get(id) {
                for dep in &node.dependencies {
                    set.insert(dep.as_str());
                    set.extend(walk(dep.as_str(), by_id, memo));
                }
            }
            memo.insert(id, set.clone());
            set
        }

        for &id in by_id.keys() {
            walk(id, &by_id, &mut memo);
        }
        memo
    }
}

fn detect_cycle<'a>(
    id: &'a str,
    deps: &BTreeMap<&'a str, &'a BTreeSet<String>>,
    states: &mut BTreeMap<&'a str, VisitState>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    states.insert(id, VisitState::Visiting);
    stack.push(id);

    for dep in deps.get(id).copied().into_iter().flatten() {
        let dep = dep.as_str();
        match states.get(dep) {
            Some(VisitState::Visiting) => {
                let start = stack.iter().position(|s| *s == dep).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                path.push(dep.to_string());
                return Some(path);
            }
            Some(VisitState::Visited) => {}
            None => {
                if let Some(path) = detect_cycle(dep, deps, states, stack) {
                    return Some(path);
                }
            }
        }
    }

    stack.pop();
    states.insert(id, VisitState::Visited);
    None
}
