//! Workflow Definition Types and YAML Loading
//!
//! A workflow is a coded template owning a singly linked chain of nodes.
//! Chains can be built call by call through the engine, or described in
//! YAML and installed in one go.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use uuid::Uuid;

use crate::types::{ActorId, GroupId, LogicType};
use crate::WorkflowError;

/// A workflow template, identified by its code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkFlow {
    pub id: Uuid,
    /// Immutable identity
    pub code: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkFlow {
    pub fn new(code: impl Into<String>, name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            name,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One stage of a workflow chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkFlowNode {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub code: String,
    pub name: String,
    pub is_start: bool,
    pub is_end: bool,
    pub logic_type: LogicType,
    /// Directly designated actors
    pub actors: BTreeSet<ActorId>,
    /// Designated groups, expanded through the directory at fan-out
    pub groups: BTreeSet<GroupId>,
    /// Successor in the chain; `None` means terminal
    pub next_node_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkFlowNode {
    pub fn is_terminal(&self) -> bool {
        self.next_node_id.is_none()
    }
}

/// Arguments for `WorkflowEngine::create_node`
#[derive(Debug, Clone, Default)]
pub struct NewNode {
    /// Leave `None` (or empty) to get an auto-assigned `N01`-style code
    pub code: Option<String>,
    pub name: String,
    pub is_start: bool,
    pub is_end: bool,
    pub logic_type: LogicType,
    pub actors: Vec<ActorId>,
    pub groups: Vec<GroupId>,
}

impl NewNode {
    pub fn new(name: impl Into<String>, logic_type: LogicType) -> Self {
        Self {
            name: name.into(),
            logic_type,
            ..Default::default()
        }
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn start(mut self) -> Self {
        self.is_start = true;
        self
    }

    pub fn end(mut self) -> Self {
        self.is_end = true;
        self
    }

    pub fn actors<I, A>(mut self, actors: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ActorId>,
    {
        self.actors.extend(actors.into_iter().map(Into::into));
        self
    }

    pub fn groups<I, G>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupId>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    /// Materialize the node. `existing_nodes` is the number of nodes the
    /// workflow already has, used for code assignment.
    pub(crate) fn into_node(self, workflow_id: Uuid, existing_nodes: usize, prefix: &str) -> WorkFlowNode {
        let code = match self.code {
            Some(code) if !code.is_empty() => code,
            _ => auto_node_code(prefix, existing_nodes),
        };
        let now = Utc::now();
        WorkFlowNode {
            id: Uuid::new_v4(),
            workflow_id,
            code,
            name: self.name,
            is_start: self.is_start,
            is_end: self.is_end,
            logic_type: self.logic_type,
            actors: self.actors.into_iter().collect(),
            groups: self.groups.into_iter().collect(),
            next_node_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// `N01`, `N02`, ... sequential per workflow.
pub fn auto_node_code(prefix: &str, existing_nodes: usize) -> String {
    format!("{}{:02}", prefix, existing_nodes + 1)
}

// ─── YAML chain definitions ───────────────────────────────────

/// A complete chain definition loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDefinition {
    /// Workflow code
    pub workflow: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Nodes in chain order; each links to the next
    pub nodes: Vec<NodeDef>,
}

/// Node entry of a chain definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    #[serde(default)]
    pub code: Option<String>,
    pub name: String,
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub end: bool,
    #[serde(default)]
    pub logic: LogicType,
    #[serde(default)]
    pub actors: Vec<ActorId>,
    #[serde(default)]
    pub groups: Vec<GroupId>,
}

impl From<&NodeDef> for NewNode {
    fn from(def: &NodeDef) -> Self {
        Self {
            code: def.code.clone(),
            name: def.name.clone(),
            is_start: def.start,
            is_end: def.end,
            logic_type: def.logic,
            actors: def.actors.clone(),
            groups: def.groups.clone(),
        }
    }
}

/// Loader for chain definitions
pub struct WorkflowLoader;

impl WorkflowLoader {
    /// Load all chain definitions from a directory, keyed by workflow code
    pub fn load_from_dir(dir: &Path) -> Result<HashMap<String, ChainDefinition>, WorkflowError> {
        let mut definitions = HashMap::new();

        if !dir.exists() {
            return Ok(definitions);
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();

            if path
                .extension()
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false)
            {
                let def = Self::load_from_file(&path)?;
                definitions.insert(def.workflow.clone(), def);
            }
        }

        Ok(definitions)
    }

    /// Load a single chain definition from a file
    pub fn load_from_file(path: &Path) -> Result<ChainDefinition, WorkflowError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    /// Load from a YAML string
    pub fn load_from_str(yaml: &str) -> Result<ChainDefinition, WorkflowError> {
        let def: ChainDefinition = serde_yaml::from_str(yaml)?;
        Ok(def)
    }
}
