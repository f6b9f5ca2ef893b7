//! Workflow State Types
//!
//! Instances (one execution bound to a subject) and processes (one actor's
//! task at one node visit).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ActorId, InstanceStatus, ProcessType, SubjectRef};

/// A running (or finished) execution of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkFlowInstance {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub code: Option<String>,
    pub name: Option<String>,
    /// Who started the instance
    pub starter: ActorId,
    /// The business object under approval
    pub subject: SubjectRef,
    pub status: InstanceStatus,
    /// Newest instance marker; at most one holder per scope
    pub is_new: bool,
    /// Active node. Left in place on completion.
    pub current_node_id: Option<Uuid>,
    /// Optimistic concurrency version, bumped by every `update_instance`
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkFlowInstance {
    pub fn new(
        workflow_id: Uuid,
        start_node_id: Uuid,
        starter: ActorId,
        subject: SubjectRef,
        code: Option<String>,
        name: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            code,
            name,
            starter,
            subject,
            status: InstanceStatus::New,
            is_new: true,
            current_node_id: Some(start_node_id),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One actor's task at one node visit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkFlowProcess {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub node_id: Uuid,
    pub actor: ActorId,
    /// Action currently required from the actor
    pub todo: bool,
    pub decided_at: Option<DateTime<Utc>>,
    pub process_type: ProcessType,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkFlowProcess {
    pub fn new(instance_id: Uuid, node_id: Uuid, actor: ActorId, todo: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            instance_id,
            node_id,
            actor,
            todo,
            decided_at: None,
            process_type: ProcessType::Init,
            note: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.process_type.is_open()
    }
}
