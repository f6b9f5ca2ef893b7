use crate::types::{ActorId, InstanceStatus, ProcessType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Engine events, the durable audit trail of every workflow instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    InstanceStarted {
        instance_id: Uuid,
        workflow_id: Uuid,
        start_node_id: Uuid,
        starter: ActorId,
    },
    /// A newer instance took the `is_new` slot.
    InstanceSuperseded {
        previous_status: InstanceStatus,
    },
    ProcessesCreated {
        node_id: Uuid,
        actors: Vec<ActorId>,
        todo: bool,
    },
    ProcessDecided {
        process_id: Uuid,
        node_id: Uuid,
        actor: ActorId,
        decision: ProcessType,
    },
    /// Open siblings at a node closed in bulk.
    SiblingsClosed {
        node_id: Uuid,
        closed_as: ProcessType,
        count: usize,
    },
    NodeAdvanced {
        from_node_id: Uuid,
        to_node_id: Uuid,
        activated: usize,
    },
    InstanceCompleted {
        node_id: Uuid,
    },
    InstanceDenied {
        node_id: Option<Uuid>,
    },
    InstanceTerminated {
        node_id: Option<Uuid>,
    },
}

impl EngineEvent {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InstanceStarted { .. } => "instance_started",
            Self::InstanceSuperseded { .. } => "instance_superseded",
            Self::ProcessesCreated { .. } => "processes_created",
            Self::ProcessDecided { .. } => "process_decided",
            Self::SiblingsClosed { .. } => "siblings_closed",
            Self::NodeAdvanced { .. } => "node_advanced",
            Self::InstanceCompleted { .. } => "instance_completed",
            Self::InstanceDenied { .. } => "instance_denied",
            Self::InstanceTerminated { .. } => "instance_terminated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_tagged() {
        let event = EngineEvent::SiblingsClosed {
            node_id: Uuid::nil(),
            closed_as: ProcessType::Submit,
            count: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "siblings_closed");
        assert_eq!(json["closed_as"], "submit");
        assert_eq!(event.kind(), "siblings_closed");

        let back: EngineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
