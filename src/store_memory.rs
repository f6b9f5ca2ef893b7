//! In-process `WorkflowStore`.
//!
//! One `RwLock` guards all tables, so every trait method is atomic with
//! respect to every other. Rows are kept in insertion order. Store locks are
//! one async mutex per `LockKey`, shared by every engine holding the store.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::definition::{WorkFlow, WorkFlowNode};
use crate::events::EngineEvent;
use crate::state::{WorkFlowInstance, WorkFlowProcess};
use crate::store::{LockKey, NewFlagScope, StoreLease, WorkflowStore};
use crate::types::{ActorId, ProcessType, SubjectRef};

#[derive(Default)]
struct Tables {
    workflows: Vec<WorkFlow>,
    nodes: Vec<WorkFlowNode>,
    instances: Vec<WorkFlowInstance>,
    processes: Vec<WorkFlowProcess>,
    events: HashMap<Uuid, Vec<(u64, EngineEvent)>>,
    event_seq: u64,
}

impl Tables {
    fn node_mut(&mut self, id: Uuid) -> Result<&mut WorkFlowNode> {
        self.nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| anyhow!("node {id} not found"))
    }

    fn open_at(&mut self, instance_id: Uuid, node_id: Uuid) -> impl Iterator<Item = &mut WorkFlowProcess> {
        self.processes.iter_mut().filter(move |p| {
            p.instance_id == instance_id && p.node_id == node_id && p.process_type.is_open()
        })
    }
}

type LockTable = Arc<Mutex<HashMap<LockKey, Arc<Mutex<()>>>>>;

struct MemoryLease {
    key: LockKey,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    table: LockTable,
}

#[async_trait]
impl StoreLease for MemoryLease {
    async fn release(mut self: Box<Self>) -> Result<()> {
        drop(self.guard.take());
        let mut table = self.table.lock().await;
        // Only the table and this lease still reference the mutex: no waiters.
        if Arc::strong_count(&self.lock) == 2 {
            table.remove(&self.key);
        }
        Ok(())
    }
}

/// Memory-backed store for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    locks: LockTable,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn acquire(&self, key: LockKey) -> Result<Box<dyn StoreLease>> {
        let lock = {
            let mut table = self.locks.lock().await;
            table.entry(key).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        Ok(Box::new(MemoryLease {
            key,
            lock,
            guard: Some(guard),
            table: self.locks.clone(),
        }))
    }

    async fn get_or_create_workflow(&self, code: &str, name: Option<&str>) -> Result<WorkFlow> {
        let mut t = self.tables.write().await;
        if let Some(existing) = t.workflows.iter().find(|w| w.code == code) {
            return Ok(existing.clone());
        }
        let workflow = WorkFlow::new(code, name.map(str::to_string));
        t.workflows.push(workflow.clone());
        Ok(workflow)
    }

    async fn load_workflow(&self, id: Uuid) -> Result<Option<WorkFlow>> {
        let t = self.tables.read().await;
        Ok(t.workflows.iter().find(|w| w.id == id).cloned())
    }

    async fn find_workflow_by_code(&self, code: &str) -> Result<Option<WorkFlow>> {
        let t = self.tables.read().await;
        Ok(t.workflows.iter().find(|w| w.code == code).cloned())
    }

    async fn save_node(&self, node: &WorkFlowNode) -> Result<()> {
        let mut t = self.tables.write().await;
        match t.nodes.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => *existing = node.clone(),
            None => t.nodes.push(node.clone()),
        }
        Ok(())
    }

    async fn load_node(&self, id: Uuid) -> Result<Option<WorkFlowNode>> {
        let t = self.tables.read().await;
        Ok(t.nodes.iter().find(|n| n.id == id).cloned())
    }

    async fn count_nodes(&self, workflow_id: Uuid) -> Result<usize> {
        let t = self.tables.read().await;
        Ok(t.nodes.iter().filter(|n| n.workflow_id == workflow_id).count())
    }

    async fn list_nodes(&self, workflow_id: Uuid) -> Result<Vec<WorkFlowNode>> {
        let t = self.tables.read().await;
        Ok(t.nodes
            .iter()
            .filter(|n| n.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn link_nodes(&self, from: Uuid, to: Uuid) -> Result<()> {
        let mut t = self.tables.write().await;
        let node = t.node_mut(from)?;
        node.next_node_id = Some(to);
        node.updated_at = Utc::now();
        Ok(())
    }

    async fn find_start_node(&self, workflow_id: Uuid) -> Result<Option<WorkFlowNode>> {
        let t = self.tables.read().await;
        Ok(t.nodes
            .iter()
            .find(|n| n.workflow_id == workflow_id && n.is_start)
            .cloned())
    }

    async fn insert_instance(&self, instance: &WorkFlowInstance) -> Result<()> {
        let mut t = self.tables.write().await;
        if t.instances.iter().any(|i| i.id == instance.id) {
            return Err(anyhow!("instance {} already exists", instance.id));
        }
        t.instances.push(instance.clone());
        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<WorkFlowInstance>> {
        let t = self.tables.read().await;
        Ok(t.instances.iter().find(|i| i.id == id).cloned())
    }

    async fn update_instance(&self, instance: &WorkFlowInstance) -> Result<bool> {
        let mut t = self.tables.write().await;
        let stored = t
            .instances
            .iter_mut()
            .find(|i| i.id == instance.id)
            .ok_or_else(|| anyhow!("instance {} not found", instance.id))?;
        if stored.version != instance.version {
            return Ok(false);
        }
        let is_new = stored.is_new;
        *stored = instance.clone();
        stored.is_new = is_new;
        stored.version = instance.version + 1;
        stored.updated_at = Utc::now();
        Ok(true)
    }

    async fn clear_new_flags(&self, scope: NewFlagScope<'_>) -> Result<Vec<WorkFlowInstance>> {
        let mut t = self.tables.write().await;
        let now = Utc::now();
        let mut cleared = Vec::new();
        for inst in t.instances.iter_mut().filter(|i| i.is_new) {
            let in_scope = match scope {
                NewFlagScope::All => true,
                NewFlagScope::WorkflowSubject {
                    workflow_id,
                    subject,
                } => inst.workflow_id == workflow_id && &inst.subject == subject,
            };
            if in_scope {
                inst.is_new = false;
                inst.updated_at = now;
                cleared.push(inst.clone());
            }
        }
        Ok(cleared)
    }

    async fn list_instances_for_subject(
        &self,
        subject: &SubjectRef,
    ) -> Result<Vec<WorkFlowInstance>> {
        let t = self.tables.read().await;
        Ok(t.instances
            .iter()
            .filter(|i| &i.subject == subject)
            .cloned()
            .collect())
    }

    async fn insert_processes(&self, processes: &[WorkFlowProcess]) -> Result<()> {
        let mut t = self.tables.write().await;
        t.processes.extend_from_slice(processes);
        Ok(())
    }

    async fn load_process(&self, id: Uuid) -> Result<Option<WorkFlowProcess>> {
        let t = self.tables.read().await;
        Ok(t.processes.iter().find(|p| p.id == id).cloned())
    }

    async fn decide_process(
        &self,
        id: Uuid,
        decision: ProcessType,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut t = self.tables.write().await;
        let process = t
            .processes
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| anyhow!("process {id} not found"))?;
        if !process.process_type.is_open() {
            return Ok(false);
        }
        process.process_type = decision;
        process.decided_at = Some(at);
        process.note = note.map(str::to_string);
        process.todo = false;
        process.updated_at = at;
        Ok(true)
    }

    async fn close_open_processes(
        &self,
        instance_id: Uuid,
        node_id: Uuid,
        to: ProcessType,
    ) -> Result<usize> {
        let mut t = self.tables.write().await;
        let now = Utc::now();
        let mut closed = 0;
        for p in t.open_at(instance_id, node_id) {
            p.process_type = to;
            p.todo = false;
            p.updated_at = now;
            closed += 1;
        }
        Ok(closed)
    }

    async fn count_open_processes(&self, instance_id: Uuid, node_id: Uuid) -> Result<usize> {
        let t = self.tables.read().await;
        Ok(t.processes
            .iter()
            .filter(|p| {
                p.instance_id == instance_id && p.node_id == node_id && p.process_type.is_open()
            })
            .count())
    }

    async fn mark_open_processes_todo(&self, instance_id: Uuid, node_id: Uuid) -> Result<usize> {
        let mut t = self.tables.write().await;
        let now = Utc::now();
        let mut marked = 0;
        for p in t.open_at(instance_id, node_id) {
            p.todo = true;
            p.updated_at = now;
            marked += 1;
        }
        Ok(marked)
    }

    async fn list_processes(&self, instance_id: Uuid) -> Result<Vec<WorkFlowProcess>> {
        let t = self.tables.read().await;
        Ok(t.processes
            .iter()
            .filter(|p| p.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn list_todo_for_actor(&self, actor: &ActorId) -> Result<Vec<WorkFlowProcess>> {
        let t = self.tables.read().await;
        Ok(t.processes
            .iter()
            .filter(|p| &p.actor == actor && p.todo && p.process_type.is_open())
            .cloned()
            .collect())
    }

    async fn append_event(&self, instance_id: Uuid, event: &EngineEvent) -> Result<u64> {
        let mut t = self.tables.write().await;
        t.event_seq += 1;
        let seq = t.event_seq;
        t.events
            .entry(instance_id)
            .or_default()
            .push((seq, event.clone()));
        Ok(seq)
    }

    async fn read_events(&self, instance_id: Uuid) -> Result<Vec<(u64, EngineEvent)>> {
        let t = self.tables.read().await;
        Ok(t.events.get(&instance_id).cloned().unwrap_or_default())
    }
}
