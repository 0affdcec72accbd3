use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use evoflow_core::error::{EvoflowError, Result};

use crate::template::{self, Reference, Segment, Template};

static NULL: Value = Value::Null;

/// Per-execution store of node outputs.
///
/// Each node id is written at most once; stored outputs are never mutated.
/// Resolution reads the store and returns a fresh value.
#[derive(Debug, Clone, Default)]
pub struct ContextStore {
    outputs: BTreeMap<String, Value>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node's output. A second write for the same id is an engine bug.
    pub fn set(&mut self, node_id: impl Into<String>, output: Value) -> Result<()> {
        let node_id = node_id.into();
        if self.outputs.contains_key(&node_id) {
            return Err(EvoflowError::DuplicateOutput { node_id });
        }
        self.outputs.insert(node_id, output);
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.outputs.contains_key(node_id)
    }

    /// All stored outputs keyed by node id.
    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    /// Substitute every placeholder inside `input`.
    ///
    /// Dependency references must already be stored, otherwise this fails with
    /// `UnresolvedDependency`. Input references that name an unknown key are
    /// left as written. A string made of exactly one placeholder becomes the
    /// referenced JSON value; embedded placeholders are stringified.
    pub fn resolve(&self, input: &Value, workflow_input: &Value) -> Result<Value> {
        match input {
            Value::String(s) => self.resolve_str(s, workflow_input),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve(v, workflow_input))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve(v, workflow_input)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolve a node's input and, for object inputs, add each direct
    /// dependency's output under `dependency_<id>` unless already present.
    pub fn resolve_for_node(
        &self,
        input: &Value,
        dependencies: &BTreeSet<String>,
        workflow_input: &Value,
    ) -> Result<Value> {
        let mut resolved = self.resolve(input, workflow_input)?;
        if let Value::Object(map) = &mut resolved {
            for dep in dependencies {
                let key = format!("dependency_{}", dep);
                if map.contains_key(&key) {
                    continue;
                }
                let output = self
                    .get(dep)
                    .ok_or_else(|| EvoflowError::UnresolvedDependency {
                        node_id: dep.clone(),
                    })?;
                map.insert(key, output.clone());
            }
        }
        Ok(resolved)
    }

    fn resolve_str(&self, text: &str, workflow_input: &Value) -> Result<Value> {
        let parsed = Template::parse(text);
        if !parsed.has_references() {
            return Ok(Value::String(text.to_string()));
        }

        if let Some(reference) = parsed.sole_reference() {
            return Ok(self
                .lookup(reference, workflow_input)?
                .cloned()
                .unwrap_or_else(|| Value::String(text.to_string())));
        }

        let mut out = String::with_capacity(text.len());
        for segment in parsed.segments() {
            match segment {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Ref { raw, reference } => match self.lookup(reference, workflow_input)? {
                    Some(value) => out.push_str(&template::stringify(value)),
                    None => out.push_str(raw),
                },
            }
        }
        Ok(Value::String(out))
    }

    /// `Ok(None)` means "leave the placeholder verbatim".
    fn lookup<'a>(
        &'a self,
        reference: &Reference,
        workflow_input: &'a Value,
    ) -> Result<Option<&'a Value>> {
        match reference {
            Reference::NodeOutput { node_id, path } => {
                let output = self
                    .get(node_id)
                    .ok_or_else(|| EvoflowError::UnresolvedDependency {
                        node_id: node_id.clone(),
                    })?;
                // A path that misses resolves to null rather than failing the run.
                Ok(Some(template::lookup_path(output, path).unwrap_or(&NULL)))
            }
            Reference::Input { key } => Ok(workflow_input.get(key.as_str())),
        }
    }
}
