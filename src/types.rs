//! Scalar types shared by definitions, instances and tasks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ─── Identities ───────────────────────────────────────────────

/// Stable identity of an actor (a user who can hold tasks).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of an actor group, resolved through the directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Reference to the business object under approval.
///
/// A type tag plus an identifier. The engine stores it and compares it,
/// never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    /// Kind of object (e.g. "invoice", "leave_request")
    pub subject_type: String,
    /// Identifier of the object within its kind
    pub subject_id: String,
}

impl SubjectRef {
    pub fn new(subject_type: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
        }
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.subject_id)
    }
}

// ─── Completion policy ────────────────────────────────────────

/// How a node decides it is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicType {
    /// First agreement completes the node; siblings are closed.
    Any,
    /// Every assigned actor must decide.
    #[default]
    All,
}

impl LogicType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::All => "all",
        }
    }
}

impl fmt::Display for LogicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "all" => Ok(Self::All),
            _ => Err(format!("Unknown logic type: {}", s)),
        }
    }
}

// ─── Instance status ──────────────────────────────────────────

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    New,
    InProgress,
    Deny,
    Terminated,
    Completed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "in_progress",
            Self::Deny => "deny",
            Self::Terminated => "terminated",
            Self::Completed => "completed",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deny | Self::Terminated | Self::Completed)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "in_progress" => Ok(Self::InProgress),
            "deny" => Ok(Self::Deny),
            "terminated" => Ok(Self::Terminated),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Unknown instance status: {}", s)),
        }
    }
}

// ─── Process (task) type ──────────────────────────────────────

/// Decision recorded on a process. `Init` means still open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessType {
    #[default]
    Init,
    Agree,
    Deny,
    /// Closed on behalf of the actor by a sibling's decision.
    Submit,
    /// Closed because the instance was replaced.
    Terminated,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Agree => "agree",
            Self::Deny => "deny",
            Self::Submit => "submit",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Init)
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "agree" => Ok(Self::Agree),
            "deny" => Ok(Self::Deny),
            "submit" => Ok(Self::Submit),
            "terminated" => Ok(Self::Terminated),
            _ => Err(format!("Unknown process type: {}", s)),
        }
    }
}
