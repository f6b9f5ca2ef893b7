//! Postgres `WorkflowStore`.
//!
//! Runtime-checked queries against the tables in `migrations/`. Bulk
//! transitions are single set-based `UPDATE` statements. Store locks are
//! transaction-scoped advisory locks, so they hold across every pool and
//! process sharing the database.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use uuid::Uuid;

use crate::definition::{WorkFlow, WorkFlowNode};
use crate::events::EngineEvent;
use crate::state::{WorkFlowInstance, WorkFlowProcess};
use crate::store::{LockKey, NewFlagScope, StoreLease, WorkflowStore};
use crate::types::{ActorId, GroupId, ProcessType, SubjectRef};

const NODE_COLUMNS: &str = "id, workflow_id, code, name, is_start, is_end, logic_type, \
                            next_node_id, created_at, updated_at";

const INSTANCE_COLUMNS: &str = "id, workflow_id, code, name, starter, subject_type, subject_id, \
                                status, is_new, current_node_id, version, created_at, updated_at";

const PROCESS_COLUMNS: &str = "id, instance_id, node_id, actor, todo, decided_at, process_type, \
                               note, created_at, updated_at";

const LOCK_POLL_MIN: Duration = Duration::from_millis(2);
const LOCK_POLL_MAX: Duration = Duration::from_millis(50);

/// Advisory lock name for a store lock. Postgres hashes it with
/// `hashtextextended`, so every client derives the same key.
fn lock_name(key: LockKey) -> String {
    match key {
        LockKey::Starts => "simpleflow:starts".to_string(),
        LockKey::Workflow(id) => format!("simpleflow:workflow:{id}"),
        LockKey::Instance(id) => format!("simpleflow:instance:{id}"),
    }
}

/// Holds the open transaction that owns the advisory lock.
/// Dropping it rolls the transaction back, which also frees the lock.
struct AdvisoryLease {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreLease for AdvisoryLease {
    async fn release(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using `DATABASE_URL`
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let pool = PgPool::connect(&url)
            .await
            .with_context(|| format!("connecting to {}", url))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Attach actor and group sets to node rows, keeping row order.
    async fn hydrate_nodes(&self, rows: Vec<NodeRow>) -> Result<Vec<WorkFlowNode>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();

        let actor_rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT node_id, actor FROM workflow_node_actors
            WHERE node_id = ANY($1)
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let group_rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT node_id, group_id FROM workflow_node_groups
            WHERE node_id = ANY($1)
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut actors: HashMap<Uuid, BTreeSet<ActorId>> = HashMap::new();
        for (node_id, actor) in actor_rows {
            actors.entry(node_id).or_default().insert(ActorId(actor));
        }
        let mut groups: HashMap<Uuid, BTreeSet<GroupId>> = HashMap::new();
        for (node_id, group) in group_rows {
            groups.entry(node_id).or_default().insert(GroupId(group));
        }

        rows.into_iter()
            .map(|row| -> Result<WorkFlowNode> {
                let id = row.id;
                let mut node = WorkFlowNode::try_from(row)?;
                node.actors = actors.remove(&id).unwrap_or_default();
                node.groups = groups.remove(&id).unwrap_or_default();
                Ok(node)
            })
            .collect()
    }

    async fn fetch_nodes(&self, sql: &str, id: Uuid) -> Result<Vec<WorkFlowNode>> {
        let rows = sqlx::query_as::<_, NodeRow>(sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        self.hydrate_nodes(rows).await
    }
}

#[async_trait]
impl WorkflowStore for PostgresStore {
    // ── Locks ──

    /// Polls `pg_try_advisory_xact_lock` rather than blocking, so waiters
    /// do not pin pooled connections the holder needs for its own queries.
    async fn acquire(&self, key: LockKey) -> Result<Box<dyn StoreLease>> {
        let name = lock_name(key);
        let mut backoff = LOCK_POLL_MIN;
        loop {
            let mut tx = self.pool.begin().await?;
            let (acquired,): (bool,) =
                sqlx::query_as("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
                    .bind(&name)
                    .fetch_one(&mut *tx)
                    .await
                    .with_context(|| format!("acquiring {name}"))?;
            if acquired {
                return Ok(Box::new(AdvisoryLease { tx }));
            }
            tx.rollback().await?;
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(LOCK_POLL_MAX);
        }
    }

    // ── Definitions ──

    async fn get_or_create_workflow(&self, code: &str, name: Option<&str>) -> Result<WorkFlow> {
        let candidate = WorkFlow::new(code, name.map(str::to_string));
        sqlx::query(
            r#"
            INSERT INTO workflows (id, code, name, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (code) DO NOTHING
            "#,
        )
        .bind(candidate.id)
        .bind(&candidate.code)
        .bind(&candidate.name)
        .bind(&candidate.description)
        .bind(candidate.created_at)
        .bind(candidate.updated_at)
        .execute(&self.pool)
        .await?;

        self.find_workflow_by_code(code)
            .await?
            .ok_or_else(|| anyhow!("workflow {code} vanished after insert"))
    }

    async fn load_workflow(&self, id: Uuid) -> Result<Option<WorkFlow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, code, name, description, created_at, updated_at
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn find_workflow_by_code(&self, code: &str) -> Result<Option<WorkFlow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, code, name, description, created_at, updated_at
            FROM workflows
            WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn save_node(&self, node: &WorkFlowNode) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflow_nodes
            (id, workflow_id, code, name, is_start, is_end, logic_type,
             next_node_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                code = EXCLUDED.code,
                name = EXCLUDED.name,
                is_start = EXCLUDED.is_start,
                is_end = EXCLUDED.is_end,
                logic_type = EXCLUDED.logic_type,
                next_node_id = EXCLUDED.next_node_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(node.id)
        .bind(node.workflow_id)
        .bind(&node.code)
        .bind(&node.name)
        .bind(node.is_start)
        .bind(node.is_end)
        .bind(node.logic_type.as_str())
        .bind(node.next_node_id)
        .bind(node.created_at)
        .bind(node.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM workflow_node_actors WHERE node_id = $1")
            .bind(node.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workflow_node_groups WHERE node_id = $1")
            .bind(node.id)
            .execute(&mut *tx)
            .await?;

        let actors: Vec<String> = node.actors.iter().map(|a| a.0.clone()).collect();
        sqlx::query(
            r#"
            INSERT INTO workflow_node_actors (node_id, actor)
            SELECT $1, unnest($2::text[])
            "#,
        )
        .bind(node.id)
        .bind(&actors)
        .execute(&mut *tx)
        .await?;

        let groups: Vec<String> = node.groups.iter().map(|g| g.0.clone()).collect();
        sqlx::query(
            r#"
            INSERT INTO workflow_node_groups (node_id, group_id)
            SELECT $1, unnest($2::text[])
            "#,
        )
        .bind(node.id)
        .bind(&groups)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_node(&self, id: Uuid) -> Result<Option<WorkFlowNode>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM workflow_nodes WHERE id = $1");
        Ok(self.fetch_nodes(&sql, id).await?.into_iter().next())
    }

    async fn count_nodes(&self, workflow_id: Uuid) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM workflow_nodes WHERE workflow_id = $1")
                .bind(workflow_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    async fn list_nodes(&self, workflow_id: Uuid) -> Result<Vec<WorkFlowNode>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM workflow_nodes WHERE workflow_id = $1 ORDER BY seq"
        );
        self.fetch_nodes(&sql, workflow_id).await
    }

    async fn link_nodes(&self, from: Uuid, to: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_nodes
            SET next_node_id = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("node {from} not found");
        }
        Ok(())
    }

    async fn find_start_node(&self, workflow_id: Uuid) -> Result<Option<WorkFlowNode>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM workflow_nodes \
             WHERE workflow_id = $1 AND is_start ORDER BY seq LIMIT 1"
        );
        Ok(self.fetch_nodes(&sql, workflow_id).await?.into_iter().next())
    }

    // ── Instances ──

    async fn insert_instance(&self, instance: &WorkFlowInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_instances
            (id, workflow_id, code, name, starter, subject_type, subject_id,
             status, is_new, current_node_id, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(instance.id)
        .bind(instance.workflow_id)
        .bind(&instance.code)
        .bind(&instance.name)
        .bind(instance.starter.as_str())
        .bind(&instance.subject.subject_type)
        .bind(&instance.subject.subject_id)
        .bind(instance.status.as_str())
        .bind(instance.is_new)
        .bind(instance.current_node_id)
        .bind(instance.version)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<WorkFlowInstance>> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = $1");
        let row = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(WorkFlowInstance::try_from).transpose()
    }

    async fn update_instance(&self, instance: &WorkFlowInstance) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances SET
                code = $3,
                name = $4,
                status = $5,
                current_node_id = $6,
                version = version + 1,
                updated_at = $7
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(instance.id)
        .bind(instance.version)
        .bind(&instance.code)
        .bind(&instance.name)
        .bind(instance.status.as_str())
        .bind(instance.current_node_id)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn clear_new_flags(&self, scope: NewFlagScope<'_>) -> Result<Vec<WorkFlowInstance>> {
        let rows = match scope {
            NewFlagScope::All => {
                let sql = format!(
                    "UPDATE workflow_instances \
                     SET is_new = false, updated_at = now() \
                     WHERE is_new \
                     RETURNING {INSTANCE_COLUMNS}"
                );
                sqlx::query_as::<_, InstanceRow>(&sql)
                    .fetch_all(&self.pool)
                    .await?
            }
            NewFlagScope::WorkflowSubject {
                workflow_id,
                subject,
            } => {
                let sql = format!(
                    "UPDATE workflow_instances \
                     SET is_new = false, updated_at = now() \
                     WHERE is_new AND workflow_id = $1 AND subject_type = $2 AND subject_id = $3 \
                     RETURNING {INSTANCE_COLUMNS}"
                );
                sqlx::query_as::<_, InstanceRow>(&sql)
                    .bind(workflow_id)
                    .bind(&subject.subject_type)
                    .bind(&subject.subject_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(WorkFlowInstance::try_from).collect()
    }

    async fn list_instances_for_subject(
        &self,
        subject: &SubjectRef,
    ) -> Result<Vec<WorkFlowInstance>> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
             WHERE subject_type = $1 AND subject_id = $2 ORDER BY seq"
        );
        let rows = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(&subject.subject_type)
            .bind(&subject.subject_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(WorkFlowInstance::try_from).collect()
    }

    // ── Processes ──

    async fn insert_processes(&self, processes: &[WorkFlowProcess]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for process in processes {
            sqlx::query(
                r#"
                INSERT INTO workflow_processes
                (id, instance_id, node_id, actor, todo, decided_at, process_type,
                 note, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(process.id)
            .bind(process.instance_id)
            .bind(process.node_id)
            .bind(process.actor.as_str())
            .bind(process.todo)
            .bind(process.decided_at)
            .bind(process.process_type.as_str())
            .bind(&process.note)
            .bind(process.created_at)
            .bind(process.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_process(&self, id: Uuid) -> Result<Option<WorkFlowProcess>> {
        let sql = format!("SELECT {PROCESS_COLUMNS} FROM workflow_processes WHERE id = $1");
        let row = sqlx::query_as::<_, ProcessRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(WorkFlowProcess::try_from).transpose()
    }

    async fn decide_process(
        &self,
        id: Uuid,
        decision: ProcessType,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_processes SET
                process_type = $2,
                note = $3,
                decided_at = $4,
                todo = false,
                updated_at = $4
            WHERE id = $1 AND process_type = 'init'
            "#,
        )
        .bind(id)
        .bind(decision.as_str())
        .bind(note)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM workflow_processes WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            bail!("process {id} not found");
        }
        Ok(false)
    }

    async fn close_open_processes(
        &self,
        instance_id: Uuid,
        node_id: Uuid,
        to: ProcessType,
    ) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_processes
            SET process_type = $3, todo = false, updated_at = now()
            WHERE instance_id = $1 AND node_id = $2 AND process_type = 'init'
            "#,
        )
        .bind(instance_id)
        .bind(node_id)
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn count_open_processes(&self, instance_id: Uuid, node_id: Uuid) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM workflow_processes
            WHERE instance_id = $1 AND node_id = $2 AND process_type = 'init'
            "#,
        )
        .bind(instance_id)
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as usize)
    }

    async fn mark_open_processes_todo(&self, instance_id: Uuid, node_id: Uuid) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_processes
            SET todo = true, updated_at = now()
            WHERE instance_id = $1 AND node_id = $2 AND process_type = 'init'
            "#,
        )
        .bind(instance_id)
        .bind(node_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn list_processes(&self, instance_id: Uuid) -> Result<Vec<WorkFlowProcess>> {
        let sql = format!(
            "SELECT {PROCESS_COLUMNS} FROM workflow_processes WHERE instance_id = $1 ORDER BY seq"
        );
        let rows = sqlx::query_as::<_, ProcessRow>(&sql)
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(WorkFlowProcess::try_from).collect()
    }

    async fn list_todo_for_actor(&self, actor: &ActorId) -> Result<Vec<WorkFlowProcess>> {
        let sql = format!(
            "SELECT {PROCESS_COLUMNS} FROM workflow_processes \
             WHERE actor = $1 AND todo AND process_type = 'init' ORDER BY seq"
        );
        let rows = sqlx::query_as::<_, ProcessRow>(&sql)
            .bind(actor.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(WorkFlowProcess::try_from).collect()
    }

    // ── Event log ──

    async fn append_event(&self, instance_id: Uuid, event: &EngineEvent) -> Result<u64> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO workflow_events (instance_id, event)
            VALUES ($1, $2)
            RETURNING seq
            "#,
        )
        .bind(instance_id)
        .bind(serde_json::to_value(event)?)
        .fetch_one(&self.pool)
        .await?;

        Ok(seq as u64)
    }

    async fn read_events(&self, instance_id: Uuid) -> Result<Vec<(u64, EngineEvent)>> {
        let rows: Vec<(i64, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT seq, event FROM workflow_events
            WHERE instance_id = $1
            ORDER BY seq
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(seq, value)| -> Result<(u64, EngineEvent)> {
                Ok((seq as u64, serde_json::from_value(value)?))
            })
            .collect()
    }
}

// ── Rows ──

#[derive(Debug, sqlx::FromRow)]
struct WorkflowRow {
    id: Uuid,
    code: String,
    name: Option<String>,
    description: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WorkflowRow> for WorkFlow {
    fn from(row: WorkflowRow) -> Self {
        Self {
            id: row.id,
            code: row.code,
            name: row.name,
            description: row.description,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NodeRow {
    id: Uuid,
    workflow_id: Uuid,
    code: String,
    name: String,
    is_start: bool,
    is_end: bool,
    logic_type: String,
    next_node_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<NodeRow> for WorkFlowNode {
    type Error = anyhow::Error;

    fn try_from(row: NodeRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            workflow_id: row.workflow_id,
            code: row.code,
            name: row.name,
            is_start: row.is_start,
            is_end: row.is_end,
            logic_type: row.logic_type.parse().map_err(anyhow::Error::msg)?,
            actors: BTreeSet::new(),
            groups: BTreeSet::new(),
            next_node_id: row.next_node_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InstanceRow {
    id: Uuid,
    workflow_id: Uuid,
    code: Option<String>,
    name: Option<String>,
    starter: String,
    subject_type: String,
    subject_id: String,
    status: String,
    is_new: bool,
    current_node_id: Option<Uuid>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for WorkFlowInstance {
    type Error = anyhow::Error;

    fn try_from(row: InstanceRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            workflow_id: row.workflow_id,
            code: row.code,
            name: row.name,
            starter: ActorId(row.starter),
            subject: SubjectRef::new(row.subject_type, row.subject_id),
            status: row.status.parse().map_err(anyhow::Error::msg)?,
            is_new: row.is_new,
            current_node_id: row.current_node_id,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProcessRow {
    id: Uuid,
    instance_id: Uuid,
    node_id: Uuid,
    actor: String,
    todo: bool,
    decided_at: Option<DateTime<Utc>>,
    process_type: String,
    note: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProcessRow> for WorkFlowProcess {
    type Error = anyhow::Error;

    fn try_from(row: ProcessRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            instance_id: row.instance_id,
            node_id: row.node_id,
            actor: ActorId(row.actor),
            todo: row.todo,
            decided_at: row.decided_at,
            process_type: row.process_type.parse().map_err(anyhow::Error::msg)?,
            note: row.note,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
