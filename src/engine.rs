//! Workflow Engine
//!
//! Chain building, instance lifecycle, task fan-out and decision
//! resolution. All state lives behind a `WorkflowStore`, and so do the locks
//! the engine serializes with. Engines sharing a store therefore exclude one
//! another:
//!
//! - the start lock, so exactly one instance holds `is_new`
//! - one lock per workflow, so auto-assigned node codes are unique
//! - one lock per instance, held across a whole decision (stamp, count,
//!   merge), so a node visit merges at most once

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, InstanceScope};
use crate::definition::{ChainDefinition, NewNode, WorkFlow, WorkFlowNode};
use crate::directory::{resolve_actor_set, Directory};
use crate::events::EngineEvent;
use crate::state::{WorkFlowInstance, WorkFlowProcess};
use crate::store::{LockKey, NewFlagScope, StoreLease, WorkflowStore};
use crate::types::{ActorId, InstanceStatus, LogicType, ProcessType, SubjectRef};
use crate::{Result, WorkflowError};

/// The workflow execution engine
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    directory: Arc<dyn Directory>,
    config: EngineConfig,
}

impl WorkflowEngine {
    /// Create an engine with the default configuration
    pub fn new(store: Arc<dyn WorkflowStore>, directory: Arc<dyn Directory>) -> Self {
        Self::with_config(store, directory, EngineConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn WorkflowStore>,
        directory: Arc<dyn Directory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            directory,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    // ── Node chain ──

    /// Get or create the workflow with `code`. `name` only applies on creation.
    pub async fn gain_workflow(&self, code: &str, name: Option<&str>) -> Result<WorkFlow> {
        Ok(self.store.get_or_create_workflow(code, name).await?)
    }

    /// Create a node, linking `previous` forward to it when given.
    ///
    /// `previous` is updated in place so callers building a chain keep an
    /// accurate copy of the predecessor.
    pub async fn create_node(
        &self,
        workflow: &WorkFlow,
        node: NewNode,
        previous: Option<&mut WorkFlowNode>,
    ) -> Result<WorkFlowNode> {
        let lease = self.store.acquire(LockKey::Workflow(workflow.id)).await?;
        let result = self.create_node_locked(workflow, node, previous).await;
        finish(lease, result).await
    }

    async fn create_node_locked(
        &self,
        workflow: &WorkFlow,
        node: NewNode,
        previous: Option<&mut WorkFlowNode>,
    ) -> Result<WorkFlowNode> {
        let existing = self.store.count_nodes(workflow.id).await?;
        let node = node.into_node(workflow.id, existing, &self.config.node_code_prefix);
        self.store.save_node(&node).await?;

        if let Some(previous) = previous {
            self.store.link_nodes(previous.id, node.id).await?;
            previous.next_node_id = Some(node.id);
            previous.updated_at = Utc::now();
        }

        debug!(
            workflow = %workflow.code,
            node = %node.code,
            logic = %node.logic_type,
            "Created workflow node"
        );
        Ok(node)
    }

    /// First node flagged as start, if any
    pub async fn get_start_node(&self, workflow: &WorkFlow) -> Result<Option<WorkFlowNode>> {
        Ok(self.store.find_start_node(workflow.id).await?)
    }

    pub async fn list_nodes(&self, workflow: &WorkFlow) -> Result<Vec<WorkFlowNode>> {
        Ok(self.store.list_nodes(workflow.id).await?)
    }

    /// Build a workflow and its chain from a loaded definition.
    ///
    /// A workflow that already has nodes is returned as stored; the
    /// definition's nodes are not applied a second time.
    pub async fn install_chain(
        &self,
        definition: &ChainDefinition,
    ) -> Result<(WorkFlow, Vec<WorkFlowNode>)> {
        let workflow = self
            .gain_workflow(&definition.workflow, definition.name.as_deref())
            .await?;

        let existing = self.store.list_nodes(workflow.id).await?;
        if !existing.is_empty() {
            debug!(workflow = %workflow.code, nodes = existing.len(), "Chain already installed");
            return Ok((workflow, existing));
        }

        let mut nodes: Vec<WorkFlowNode> = Vec::with_capacity(definition.nodes.len());
        for def in &definition.nodes {
            let node = self
                .create_node(&workflow, NewNode::from(def), nodes.last_mut())
                .await?;
            nodes.push(node);
        }

        info!(workflow = %workflow.code, nodes = nodes.len(), "Installed workflow chain");
        Ok((workflow, nodes))
    }

    // ── Instance lifecycle ──

    /// Start an instance of `workflow` bound to `subject`.
    ///
    /// The instance currently holding `is_new` (within the configured scope)
    /// loses the flag and is terminated. Returns `Ok(None)` when the workflow
    /// has no start node; the prior instance is terminated regardless.
    pub async fn start_workflow_instance(
        &self,
        workflow: &WorkFlow,
        subject: SubjectRef,
        starter: ActorId,
        code: Option<String>,
        name: Option<String>,
    ) -> Result<Option<WorkFlowInstance>> {
        let lease = self.store.acquire(LockKey::Starts).await?;
        let result = self
            .start_locked(workflow, subject, starter, code, name)
            .await;
        finish(lease, result).await
    }

    async fn start_locked(
        &self,
        workflow: &WorkFlow,
        subject: SubjectRef,
        starter: ActorId,
        code: Option<String>,
        name: Option<String>,
    ) -> Result<Option<WorkFlowInstance>> {
        let scope = match self.config.instance_scope {
            InstanceScope::Global => NewFlagScope::All,
            InstanceScope::WorkflowSubject => NewFlagScope::WorkflowSubject {
                workflow_id: workflow.id,
                subject: &subject,
            },
        };

        // Clearing leaves versions alone, so a decision already running on a
        // previous holder finishes first and is then terminated here.
        for previous in self.store.clear_new_flags(scope).await? {
            if previous.is_terminal() {
                continue;
            }
            let lease = self.store.acquire(LockKey::Instance(previous.id)).await?;
            let result = self.supersede_locked(previous.id).await;
            finish(lease, result).await?;
        }

        let Some(start_node) = self.store.find_start_node(workflow.id).await? else {
            warn!(workflow = %workflow.code, "Workflow has no start node, no instance created");
            return Ok(None);
        };

        let instance = WorkFlowInstance::new(
            workflow.id,
            start_node.id,
            starter.clone(),
            subject,
            code,
            name,
        );
        self.store.insert_instance(&instance).await?;
        self.record(
            instance.id,
            EngineEvent::InstanceStarted {
                instance_id: instance.id,
                workflow_id: workflow.id,
                start_node_id: start_node.id,
                starter,
            },
        )
        .await?;

        info!(
            instance_id = %instance.id,
            workflow = %workflow.code,
            subject = %instance.subject,
            node = %start_node.code,
            "Started workflow instance"
        );

        if self.config.auto_fan_out {
            let lease = self.store.acquire(LockKey::Instance(instance.id)).await?;
            let result = self.fan_out(&instance, &start_node, true, None).await;
            finish(lease, result).await?;
        }

        Ok(Some(instance))
    }

    async fn supersede_locked(&self, instance_id: Uuid) -> Result<()> {
        let current = self.load_instance(instance_id).await?;
        if current.is_terminal() {
            return Ok(());
        }
        self.record(
            current.id,
            EngineEvent::InstanceSuperseded {
                previous_status: current.status,
            },
        )
        .await?;
        self.terminate_locked(current).await?;
        Ok(())
    }

    /// Force an instance to `terminated`, closing its open tasks at the
    /// current node. Already-terminal instances are returned unchanged.
    pub async fn handle_terminated_instance(&self, instance_id: Uuid) -> Result<WorkFlowInstance> {
        let lease = self.store.acquire(LockKey::Instance(instance_id)).await?;
        let result = match self.load_instance(instance_id).await {
            Ok(instance) => self.terminate_locked(instance).await,
            Err(e) => Err(e),
        };
        finish(lease, result).await
    }

    async fn terminate_locked(&self, mut instance: WorkFlowInstance) -> Result<WorkFlowInstance> {
        if instance.is_terminal() {
            return Ok(instance);
        }

        if let Some(node_id) = instance.current_node_id {
            self.close_siblings(instance.id, node_id, ProcessType::Terminated)
                .await?;
        }

        instance.status = InstanceStatus::Terminated;
        self.save_instance(&mut instance).await?;
        self.record(
            instance.id,
            EngineEvent::InstanceTerminated {
                node_id: instance.current_node_id,
            },
        )
        .await?;

        info!(instance_id = %instance.id, "Workflow instance terminated");
        Ok(instance)
    }

    // ── Task fan-out ──

    /// Create one `init` process per resolved actor at `node`.
    ///
    /// Without `actors` the set is the node's direct actors plus every member
    /// of its groups. An empty set creates nothing.
    pub async fn create_workflow_process(
        &self,
        instance: &WorkFlowInstance,
        node: &WorkFlowNode,
        todo: bool,
        actors: Option<Vec<ActorId>>,
    ) -> Result<Vec<WorkFlowProcess>> {
        let lease = self.store.acquire(LockKey::Instance(instance.id)).await?;
        let result = self.fan_out(instance, node, todo, actors).await;
        finish(lease, result).await
    }

    async fn fan_out(
        &self,
        instance: &WorkFlowInstance,
        node: &WorkFlowNode,
        todo: bool,
        actors: Option<Vec<ActorId>>,
    ) -> Result<Vec<WorkFlowProcess>> {
        let resolved: BTreeSet<ActorId> = match actors {
            Some(actors) => actors.into_iter().collect(),
            None => resolve_actor_set(self.directory.as_ref(), &node.actors, &node.groups)
                .await
                .map_err(WorkflowError::Directory)?,
        };

        if resolved.is_empty() {
            debug!(instance_id = %instance.id, node = %node.code, "No actors to fan out to");
            return Ok(Vec::new());
        }

        let processes: Vec<WorkFlowProcess> = resolved
            .into_iter()
            .map(|actor| WorkFlowProcess::new(instance.id, node.id, actor, todo))
            .collect();
        self.store.insert_processes(&processes).await?;

        self.record(
            instance.id,
            EngineEvent::ProcessesCreated {
                node_id: node.id,
                actors: processes.iter().map(|p| p.actor.clone()).collect(),
                todo,
            },
        )
        .await?;

        debug!(
            instance_id = %instance.id,
            node = %node.code,
            count = processes.len(),
            todo,
            "Fanned out workflow processes"
        );
        Ok(processes)
    }

    // ── Decision resolution ──

    /// Stamp an actor's decision and resolve it against the current node.
    ///
    /// `agree` and `deny` drive the instance; `submit` and `terminated` are
    /// recorded without a transition. Returns the instance as persisted.
    pub async fn handle_workflow_process(
        &self,
        process_id: Uuid,
        decision: ProcessType,
        note: Option<&str>,
    ) -> Result<WorkFlowInstance> {
        if decision == ProcessType::Init {
            warn!(process_id = %process_id, "Rejected init as a decision");
            return Err(WorkflowError::InvalidDecision(decision));
        }

        let instance_id = self.load_process(process_id).await?.instance_id;
        let lease = self.store.acquire(LockKey::Instance(instance_id)).await?;
        let result = self
            .decide_locked(process_id, instance_id, decision, note)
            .await;
        finish(lease, result).await
    }

    async fn decide_locked(
        &self,
        process_id: Uuid,
        instance_id: Uuid,
        decision: ProcessType,
        note: Option<&str>,
    ) -> Result<WorkFlowInstance> {
        let process = self.load_process(process_id).await?;
        if !process.is_open() {
            warn!(process_id = %process_id, state = %process.process_type, "Process already decided");
            return Err(WorkflowError::ProcessAlreadyDecided(process_id));
        }

        let instance = self.load_instance(instance_id).await?;
        if instance.is_terminal() {
            warn!(instance_id = %instance.id, status = %instance.status, "Decision on closed instance");
            return Err(WorkflowError::InstanceClosed {
                instance_id: instance.id,
                status: instance.status,
            });
        }
        if instance.current_node_id != Some(process.node_id) {
            warn!(
                instance_id = %instance.id,
                process_id = %process_id,
                "Decision on a node that is not current"
            );
            return Err(WorkflowError::NodeNotActive {
                process_id,
                node_id: process.node_id,
            });
        }

        if !self
            .store
            .decide_process(process_id, decision, note, Utc::now())
            .await?
        {
            return Err(WorkflowError::ProcessAlreadyDecided(process_id));
        }
        self.record(
            instance.id,
            EngineEvent::ProcessDecided {
                process_id,
                node_id: process.node_id,
                actor: process.actor.clone(),
                decision,
            },
        )
        .await?;

        debug!(
            instance_id = %instance.id,
            actor = %process.actor,
            decision = %decision,
            "Stamped workflow process"
        );

        match decision {
            ProcessType::Agree => self.handle_agree_instance(instance).await,
            ProcessType::Deny => self.handle_deny_instance(instance).await,
            _ => Ok(instance),
        }
    }

    async fn handle_agree_instance(
        &self,
        mut instance: WorkFlowInstance,
    ) -> Result<WorkFlowInstance> {
        let node = self.current_node(&instance).await?;

        let merge_to_next = match node.logic_type {
            LogicType::Any => {
                self.close_siblings(instance.id, node.id, ProcessType::Submit)
                    .await?;
                true
            }
            LogicType::All => self.store.count_open_processes(instance.id, node.id).await? == 0,
        };

        instance.status = InstanceStatus::InProgress;

        if !merge_to_next {
            self.save_instance(&mut instance).await?;
            return Ok(instance);
        }

        let Some(next_id) = node.next_node_id else {
            instance.status = InstanceStatus::Completed;
            self.save_instance(&mut instance).await?;
            self.record(instance.id, EngineEvent::InstanceCompleted { node_id: node.id })
                .await?;
            info!(instance_id = %instance.id, node = %node.code, "Workflow instance completed");
            return Ok(instance);
        };

        let next = self
            .store
            .load_node(next_id)
            .await?
            .ok_or(WorkflowError::NodeNotFound(next_id))?;

        instance.current_node_id = Some(next.id);
        self.save_instance(&mut instance).await?;

        let mut activated = self
            .store
            .mark_open_processes_todo(instance.id, next.id)
            .await?;
        if activated == 0 && self.config.auto_fan_out {
            activated = self.fan_out(&instance, &next, true, None).await?.len();
        }

        self.record(
            instance.id,
            EngineEvent::NodeAdvanced {
                from_node_id: node.id,
                to_node_id: next.id,
                activated,
            },
        )
        .await?;

        info!(
            instance_id = %instance.id,
            from = %node.code,
            to = %next.code,
            activated,
            "Workflow instance advanced"
        );
        Ok(instance)
    }

    async fn handle_deny_instance(&self, mut instance: WorkFlowInstance) -> Result<WorkFlowInstance> {
        if let Some(node_id) = instance.current_node_id {
            self.close_siblings(instance.id, node_id, ProcessType::Submit)
                .await?;
        }

        instance.status = InstanceStatus::Deny;
        self.save_instance(&mut instance).await?;
        self.record(
            instance.id,
            EngineEvent::InstanceDenied {
                node_id: instance.current_node_id,
            },
        )
        .await?;

        info!(instance_id = %instance.id, "Workflow instance denied");
        Ok(instance)
    }

    // ── Lookups ──

    pub async fn workflow(&self, id: Uuid) -> Result<WorkFlow> {
        self.store
            .load_workflow(id)
            .await?
            .ok_or(WorkflowError::WorkflowNotFound(id))
    }

    pub async fn instance(&self, id: Uuid) -> Result<WorkFlowInstance> {
        self.load_instance(id).await
    }

    pub async fn process(&self, id: Uuid) -> Result<WorkFlowProcess> {
        self.load_process(id).await
    }

    pub async fn processes_for_instance(&self, instance_id: Uuid) -> Result<Vec<WorkFlowProcess>> {
        Ok(self.store.list_processes(instance_id).await?)
    }

    /// Open processes waiting on `actor`
    pub async fn todo_for_actor(&self, actor: &ActorId) -> Result<Vec<WorkFlowProcess>> {
        Ok(self.store.list_todo_for_actor(actor).await?)
    }

    pub async fn instances_for_subject(&self, subject: &SubjectRef) -> Result<Vec<WorkFlowInstance>> {
        Ok(self.store.list_instances_for_subject(subject).await?)
    }

    /// Audit trail of an instance, oldest first
    pub async fn events(&self, instance_id: Uuid) -> Result<Vec<(u64, EngineEvent)>> {
        Ok(self.store.read_events(instance_id).await?)
    }

    // ── Internals ──

    async fn load_instance(&self, id: Uuid) -> Result<WorkFlowInstance> {
        self.store
            .load_instance(id)
            .await?
            .ok_or(WorkflowError::InstanceNotFound(id))
    }

    async fn load_process(&self, id: Uuid) -> Result<WorkFlowProcess> {
        self.store
            .load_process(id)
            .await?
            .ok_or(WorkflowError::ProcessNotFound(id))
    }

    async fn current_node(&self, instance: &WorkFlowInstance) -> Result<WorkFlowNode> {
        let node_id = instance
            .current_node_id
            .ok_or(WorkflowError::NoCurrentNode(instance.id))?;
        self.store
            .load_node(node_id)
            .await?
            .ok_or(WorkflowError::NodeNotFound(node_id))
    }

    async fn close_siblings(&self, instance_id: Uuid, node_id: Uuid, to: ProcessType) -> Result<usize> {
        let count = self
            .store
            .close_open_processes(instance_id, node_id, to)
            .await?;
        if count > 0 {
            self.record(
                instance_id,
                EngineEvent::SiblingsClosed {
                    node_id,
                    closed_as: to,
                    count,
                },
            )
            .await?;
        }
        Ok(count)
    }

    /// Compare-and-set write; a concurrent writer surfaces as `StaleInstance`.
    async fn save_instance(&self, instance: &mut WorkFlowInstance) -> Result<()> {
        instance.updated_at = Utc::now();
        if !self.store.update_instance(instance).await? {
            warn!(instance_id = %instance.id, version = instance.version, "Stale instance write");
            return Err(WorkflowError::StaleInstance(instance.id));
        }
        instance.version += 1;
        Ok(())
    }

    async fn record(&self, instance_id: Uuid, event: EngineEvent) -> Result<()> {
        let seq = self.store.append_event(instance_id, &event).await?;
        debug!(instance_id = %instance_id, seq, event = event.kind(), "Recorded engine event");
        Ok(())
    }
}

/// Release `lease`, then hand back `result`. The operation's own error wins
/// over a release error.
async fn finish<T>(lease: Box<dyn StoreLease>, result: Result<T>) -> Result<T> {
    let released = lease.release().await;
    let value = result?;
    released?;
    Ok(value)
}
