//! Staged approval workflows.
//!
//! A workflow is a linear chain of nodes. Starting an instance binds the
//! chain to a subject; each node fans out one task (process) per assigned
//! actor, and the node's completion policy (`ANY` or `ALL`) decides when the
//! instance moves on to the next node.
//!
//! ```text
//! gain_workflow / create_node      → definition chain
//! start_workflow_instance          → instance at the start node
//! create_workflow_process          → tasks for a node's actors
//! handle_workflow_process          → agree / deny → advance, complete, deny
//! ```

pub mod config;
pub mod definition;
pub mod directory;
pub mod engine;
pub mod events;
pub mod state;
pub mod store;
pub mod store_memory;
#[cfg(feature = "database")]
pub mod store_postgres;
pub mod types;

pub use config::{EngineConfig, InstanceScope};
pub use definition::{ChainDefinition, NewNode, NodeDef, WorkFlow, WorkFlowNode, WorkflowLoader};
pub use directory::{Directory, StaticDirectory};
pub use engine::WorkflowEngine;
pub use events::EngineEvent;
pub use state::{WorkFlowInstance, WorkFlowProcess};
pub use store::{LockKey, NewFlagScope, StoreLease, WorkflowStore};
pub use store_memory::MemoryStore;
#[cfg(feature = "database")]
pub use store_postgres::PostgresStore;
pub use types::{ActorId, GroupId, InstanceStatus, LogicType, ProcessType, SubjectRef};

use uuid::Uuid;

/// Errors returned by engine operations
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("Workflow node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("Workflow process not found: {0}")]
    ProcessNotFound(Uuid),

    #[error("Instance {0} has no current node")]
    NoCurrentNode(Uuid),

    #[error("'{0}' is not a decision an actor can submit")]
    InvalidDecision(ProcessType),

    #[error("Process {0} has already been decided")]
    ProcessAlreadyDecided(Uuid),

    #[error("Instance {instance_id} is {status} and accepts no further decisions")]
    InstanceClosed {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    #[error("Process {process_id} is for node {node_id}, which is not the instance's current node")]
    NodeNotActive { process_id: Uuid, node_id: Uuid },

    #[error("Instance {0} was modified concurrently")]
    StaleInstance(Uuid),

    #[error("Directory error: {0}")]
    Directory(#[source] anyhow::Error),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
