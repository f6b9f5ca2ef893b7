use crate::definition::{WorkFlow, WorkFlowNode};
use crate::events::EngineEvent;
use crate::state::{WorkFlowInstance, WorkFlowProcess};
use crate::types::{ActorId, ProcessType, SubjectRef};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Which instances compete for the `is_new` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewFlagScope<'a> {
    /// Every instance in the store
    All,
    /// Instances of one workflow bound to one subject
    WorkflowSubject {
        workflow_id: Uuid,
        subject: &'a SubjectRef,
    },
}

/// What a store lock serializes.
///
/// Locks are exclusive across every engine sharing the store, not only
/// within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// Instance starts, which compete for the `is_new` flag
    Starts,
    /// Node creation within one workflow
    Workflow(Uuid),
    /// Decisions, fan-out and termination on one instance
    Instance(Uuid),
}

/// A held store lock.
///
/// `release` frees it for the next waiter. A lease dropped without
/// `release` is still freed, but possibly later.
#[async_trait]
pub trait StoreLease: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Persistence trait for all workflow state.
///
/// Organized by concern: definitions, instances, processes, audit events.
/// The engine operates exclusively through this trait. Every method is one
/// atomic step; bulk updates are set-based and must not interleave with
/// other writes to the same rows.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    // ── Locks ──

    /// Wait until `key` is held exclusively.
    async fn acquire(&self, key: LockKey) -> Result<Box<dyn StoreLease>>;

    // ── Definitions ──

    /// Return the workflow with `code`, creating it with `name` if absent.
    async fn get_or_create_workflow(&self, code: &str, name: Option<&str>) -> Result<WorkFlow>;
    async fn load_workflow(&self, id: Uuid) -> Result<Option<WorkFlow>>;
    async fn find_workflow_by_code(&self, code: &str) -> Result<Option<WorkFlow>>;

    /// Insert or replace a node.
    async fn save_node(&self, node: &WorkFlowNode) -> Result<()>;
    async fn load_node(&self, id: Uuid) -> Result<Option<WorkFlowNode>>;
    async fn count_nodes(&self, workflow_id: Uuid) -> Result<usize>;
    /// Nodes of a workflow in creation order.
    async fn list_nodes(&self, workflow_id: Uuid) -> Result<Vec<WorkFlowNode>>;
    /// Point `from`'s successor at `to`.
    async fn link_nodes(&self, from: Uuid, to: Uuid) -> Result<()>;
    /// First node (in creation order) flagged as start.
    async fn find_start_node(&self, workflow_id: Uuid) -> Result<Option<WorkFlowNode>>;

    // ── Instances ──

    async fn insert_instance(&self, instance: &WorkFlowInstance) -> Result<()>;
    async fn load_instance(&self, id: Uuid) -> Result<Option<WorkFlowInstance>>;

    /// Compare-and-set write. Succeeds only if the stored version equals
    /// `instance.version`; the stored version becomes `instance.version + 1`.
    /// Returns false on a version mismatch. `is_new` is never written here;
    /// only `insert_instance` and `clear_new_flags` touch it.
    async fn update_instance(&self, instance: &WorkFlowInstance) -> Result<bool>;

    /// Clear `is_new` on every instance in scope and return the instances
    /// that held it (as they are after clearing). Versions are left as they
    /// are, so a writer holding the instance lock is not invalidated.
    async fn clear_new_flags(&self, scope: NewFlagScope<'_>) -> Result<Vec<WorkFlowInstance>>;

    async fn list_instances_for_subject(&self, subject: &SubjectRef)
        -> Result<Vec<WorkFlowInstance>>;

    // ── Processes ──

    async fn insert_processes(&self, processes: &[WorkFlowProcess]) -> Result<()>;
    async fn load_process(&self, id: Uuid) -> Result<Option<WorkFlowProcess>>;

    /// Stamp a decision on a process still in `init`. Returns false if the
    /// process had already left `init`.
    async fn decide_process(
        &self,
        id: Uuid,
        decision: ProcessType,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Move every `init` process of (instance, node) to `to`, `todo=false`.
    /// Returns the number of processes closed.
    async fn close_open_processes(
        &self,
        instance_id: Uuid,
        node_id: Uuid,
        to: ProcessType,
    ) -> Result<usize>;

    async fn count_open_processes(&self, instance_id: Uuid, node_id: Uuid) -> Result<usize>;

    /// Set `todo=true` on every `init` process of (instance, node).
    async fn mark_open_processes_todo(&self, instance_id: Uuid, node_id: Uuid) -> Result<usize>;

    /// Processes of an instance in creation order.
    async fn list_processes(&self, instance_id: Uuid) -> Result<Vec<WorkFlowProcess>>;

    /// Open processes with `todo=true` assigned to an actor.
    async fn list_todo_for_actor(&self, actor: &ActorId) -> Result<Vec<WorkFlowProcess>>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, instance_id: Uuid, event: &EngineEvent) -> Result<u64>;
    async fn read_events(&self, instance_id: Uuid) -> Result<Vec<(u64, EngineEvent)>>;
}
