//! Several engines over one store
//!
//! These tests verify that:
//! 1. Decisions on one instance serialize across engines, so an ALL node
//!    whose actors decide through different engines still merges once
//! 2. A start superseding an instance waits for a decision already running
//!    on it, and that decision lands intact
//!
//! A gated store pauses `decide_process` for chosen processes so the
//! interleavings are forced rather than left to the scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use simpleflow::{
    ActorId, EngineEvent, InstanceStatus, LockKey, LogicType, MemoryStore, NewFlagScope, NewNode,
    ProcessType, StaticDirectory, StoreLease, SubjectRef, WorkFlow, WorkFlowInstance,
    WorkFlowNode, WorkFlowProcess, WorkflowEngine, WorkflowStore,
};
use tokio::sync::Notify;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Gated store ──

#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

/// `MemoryStore` whose `decide_process` can be held open per process.
#[derive(Default)]
struct GatedStore {
    inner: MemoryStore,
    gates: Mutex<HashMap<Uuid, Arc<Gate>>>,
}

impl GatedStore {
    /// The next decision on `process_id` signals `entered`, then waits for
    /// `release` before it is stamped.
    fn hold(&self, process_id: Uuid) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates.lock().unwrap().insert(process_id, gate.clone());
        gate
    }
}

#[async_trait]
impl WorkflowStore for GatedStore {
    async fn acquire(&self, key: LockKey) -> Result<Box<dyn StoreLease>> {
        self.inner.acquire(key).await
    }

    async fn get_or_create_workflow(&self, code: &str, name: Option<&str>) -> Result<WorkFlow> {
        self.inner.get_or_create_workflow(code, name).await
    }

    async fn load_workflow(&self, id: Uuid) -> Result<Option<WorkFlow>> {
        self.inner.load_workflow(id).await
    }

    async fn find_workflow_by_code(&self, code: &str) -> Result<Option<WorkFlow>> {
        self.inner.find_workflow_by_code(code).await
    }

    async fn save_node(&self, node: &WorkFlowNode) -> Result<()> {
        self.inner.save_node(node).await
    }

    async fn load_node(&self, id: Uuid) -> Result<Option<WorkFlowNode>> {
        self.inner.load_node(id).await
    }

    async fn count_nodes(&self, workflow_id: Uuid) -> Result<usize> {
        self.inner.count_nodes(workflow_id).await
    }

    async fn list_nodes(&self, workflow_id: Uuid) -> Result<Vec<WorkFlowNode>> {
        self.inner.list_nodes(workflow_id).await
    }

    async fn link_nodes(&self, from: Uuid, to: Uuid) -> Result<()> {
        self.inner.link_nodes(from, to).await
    }

    async fn find_start_node(&self, workflow_id: Uuid) -> Result<Option<WorkFlowNode>> {
        self.inner.find_start_node(workflow_id).await
    }

    async fn insert_instance(&self, instance: &WorkFlowInstance) -> Result<()> {
        self.inner.insert_instance(instance).await
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<WorkFlowInstance>> {
        self.inner.load_instance(id).await
    }

    async fn update_instance(&self, instance: &WorkFlowInstance) -> Result<bool> {
        self.inner.update_instance(instance).await
    }

    async fn clear_new_flags(&self, scope: NewFlagScope<'_>) -> Result<Vec<WorkFlowInstance>> {
        self.inner.clear_new_flags(scope).await
    }

    async fn list_instances_for_subject(
        &self,
        subject: &SubjectRef,
    ) -> Result<Vec<WorkFlowInstance>> {
        self.inner.list_instances_for_subject(subject).await
    }

    async fn insert_processes(&self, processes: &[WorkFlowProcess]) -> Result<()> {
        self.inner.insert_processes(processes).await
    }

    async fn load_process(&self, id: Uuid) -> Result<Option<WorkFlowProcess>> {
        self.inner.load_process(id).await
    }

    async fn decide_process(
        &self,
        id: Uuid,
        decision: ProcessType,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let gate = self.gates.lock().unwrap().remove(&id);
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.inner.decide_process(id, decision, note, at).await
    }

    async fn close_open_processes(
        &self,
        instance_id: Uuid,
        node_id: Uuid,
        to: ProcessType,
    ) -> Result<usize> {
        self.inner.close_open_processes(instance_id, node_id, to).await
    }

    async fn count_open_processes(&self, instance_id: Uuid, node_id: Uuid) -> Result<usize> {
        self.inner.count_open_processes(instance_id, node_id).await
    }

    async fn mark_open_processes_todo(&self, instance_id: Uuid, node_id: Uuid) -> Result<usize> {
        self.inner.mark_open_processes_todo(instance_id, node_id).await
    }

    async fn list_processes(&self, instance_id: Uuid) -> Result<Vec<WorkFlowProcess>> {
        self.inner.list_processes(instance_id).await
    }

    async fn list_todo_for_actor(&self, actor: &ActorId) -> Result<Vec<WorkFlowProcess>> {
        self.inner.list_todo_for_actor(actor).await
    }

    async fn append_event(&self, instance_id: Uuid, event: &EngineEvent) -> Result<u64> {
        self.inner.append_event(instance_id, event).await
    }

    async fn read_events(&self, instance_id: Uuid) -> Result<Vec<(u64, EngineEvent)>> {
        self.inner.read_events(instance_id).await
    }
}

// ── Helpers ──

/// Two engines sharing one gated store
fn engines() -> (Arc<GatedStore>, Arc<WorkflowEngine>, Arc<WorkflowEngine>) {
    init_tracing();
    let store = Arc::new(GatedStore::default());
    let engine = || {
        Arc::new(WorkflowEngine::new(
            store.clone(),
            Arc::new(StaticDirectory::new()),
        ))
    };
    let (a, b) = (engine(), engine());
    (store, a, b)
}

/// Review (ALL or ANY over `actors`) followed by a terminal Pay node.
async fn review_then_pay(
    engine: &WorkflowEngine,
    logic: LogicType,
    actors: &[&str],
) -> (WorkFlow, WorkFlowNode, WorkFlowNode) {
    let workflow = engine.gain_workflow("expense", None).await.unwrap();
    let mut review = engine
        .create_node(
            &workflow,
            NewNode::new("Review", logic).start().actors(actors.iter().copied()),
            None,
        )
        .await
        .unwrap();
    let pay = engine
        .create_node(
            &workflow,
            NewNode::new("Pay", LogicType::Any).end().actors(["cashier"]),
            Some(&mut review),
        )
        .await
        .unwrap();
    (workflow, review, pay)
}

async fn start(engine: &WorkflowEngine, workflow: &WorkFlow, subject: &str) -> WorkFlowInstance {
    engine
        .start_workflow_instance(
            workflow,
            SubjectRef::new("document", subject),
            ActorId::from("starter"),
            None,
            None,
        )
        .await
        .unwrap()
        .unwrap()
}

fn count_events(events: &[(u64, EngineEvent)], kind: &str) -> usize {
    events.iter().filter(|(_, e)| e.kind() == kind).count()
}

const SETTLE: Duration = Duration::from_millis(50);

// ── Tests ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_node_merges_when_actors_decide_through_different_engines() {
    let (store, engine_a, engine_b) = engines();
    let (workflow, review, pay) = review_then_pay(&engine_a, LogicType::All, &["u1", "u2"]).await;
    let instance = start(&engine_a, &workflow, "1").await;
    let created = engine_a
        .create_workflow_process(&instance, &review, true, None)
        .await
        .unwrap();
    let (u1, u2) = (created[0].id, created[1].id);

    let gate = store.hold(u1);
    let first = {
        let engine = engine_a.clone();
        tokio::spawn(async move { engine.handle_workflow_process(u1, ProcessType::Agree, None).await })
    };
    gate.entered.notified().await;

    let second = {
        let engine = engine_b.clone();
        tokio::spawn(async move { engine.handle_workflow_process(u2, ProcessType::Agree, None).await })
    };
    tokio::time::sleep(SETTLE).await;
    assert!(!second.is_finished(), "second decision must wait for the first");

    gate.release.notify_one();
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    assert_eq!(first.current_node_id, Some(review.id));
    assert_eq!(second.current_node_id, Some(pay.id));

    let stored = engine_b.instance(instance.id).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::InProgress);
    assert_eq!(stored.current_node_id, Some(pay.id));

    let events = engine_a.events(instance.id).await.unwrap();
    assert_eq!(count_events(&events, "process_decided"), 2);
    assert_eq!(count_events(&events, "node_advanced"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_engines_agreeing_merge_once() {
    init_tracing();
    let store: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());
    let engines: Vec<Arc<WorkflowEngine>> = (0..4)
        .map(|_| Arc::new(WorkflowEngine::new(store.clone(), Arc::new(StaticDirectory::new()))))
        .collect();
    let actors: Vec<String> = (0..8).map(|i| format!("u{i}")).collect();
    let actor_refs: Vec<&str> = actors.iter().map(String::as_str).collect();
    let (workflow, review, pay) = review_then_pay(&engines[0], LogicType::All, &actor_refs).await;
    let instance = start(&engines[0], &workflow, "1").await;
    let created = engines[0]
        .create_workflow_process(&instance, &review, true, None)
        .await
        .unwrap();

    let handles: Vec<_> = created
        .iter()
        .enumerate()
        .map(|(i, process)| {
            let engine = engines[i % engines.len()].clone();
            let id = process.id;
            tokio::spawn(async move { engine.handle_workflow_process(id, ProcessType::Agree, None).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = engines[1].instance(instance.id).await.unwrap();
    assert_eq!(stored.current_node_id, Some(pay.id));
    let events = engines[2].events(instance.id).await.unwrap();
    assert_eq!(count_events(&events, "process_decided"), 8);
    assert_eq!(count_events(&events, "node_advanced"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_waits_for_decision_on_superseded_instance() {
    let (store, engine_a, engine_b) = engines();
    let (workflow, review, pay) = review_then_pay(&engine_a, LogicType::Any, &["u1"]).await;
    let previous = start(&engine_a, &workflow, "1").await;
    let created = engine_a
        .create_workflow_process(&previous, &review, true, None)
        .await
        .unwrap();
    let u1 = created[0].id;

    let gate = store.hold(u1);
    let decision = {
        let engine = engine_a.clone();
        tokio::spawn(async move {
            engine
                .handle_workflow_process(u1, ProcessType::Agree, Some("ok"))
                .await
        })
    };
    gate.entered.notified().await;

    let starting = {
        let engine = engine_b.clone();
        let workflow = workflow.clone();
        tokio::spawn(async move { start(&engine, &workflow, "2").await })
    };
    tokio::time::sleep(SETTLE).await;
    assert!(!starting.is_finished(), "start must wait for the running decision");

    gate.release.notify_one();
    let decided = decision.await.unwrap().unwrap();
    let next = starting.await.unwrap();

    // The decision landed whole before the supersession
    assert_eq!(decided.current_node_id, Some(pay.id));
    let process = engine_a.process(u1).await.unwrap();
    assert_eq!(process.process_type, ProcessType::Agree);
    assert_eq!(process.note.as_deref(), Some("ok"));

    let previous = engine_a.instance(previous.id).await.unwrap();
    assert_eq!(previous.status, InstanceStatus::Terminated);
    assert!(!previous.is_new);
    assert!(engine_a.instance(next.id).await.unwrap().is_new);

    let kinds: Vec<&str> = engine_a
        .events(previous.id)
        .await
        .unwrap()
        .iter()
        .map(|(_, e)| e.kind())
        .collect();
    let advanced = kinds.iter().position(|k| *k == "node_advanced").unwrap();
    let superseded = kinds.iter().position(|k| *k == "instance_superseded").unwrap();
    assert!(advanced < superseded);
}
