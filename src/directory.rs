//! Actor directory
//!
//! Group membership lives outside the engine. The engine only needs to turn
//! a group into the actors it contains at fan-out time.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

use crate::types::{ActorId, GroupId};

/// Resolves actor groups into member actors.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Members of `group`. Unknown groups resolve to an empty set.
    async fn resolve_group_members(&self, group: &GroupId) -> Result<BTreeSet<ActorId>>;
}

/// Fixed, in-process group table.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    groups: HashMap<GroupId, BTreeSet<ActorId>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or extend) a group
    pub fn with_group<I, A>(mut self, group: impl Into<GroupId>, members: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ActorId>,
    {
        self.groups
            .entry(group.into())
            .or_default()
            .extend(members.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn resolve_group_members(&self, group: &GroupId) -> Result<BTreeSet<ActorId>> {
        Ok(self.groups.get(group).cloned().unwrap_or_default())
    }
}

/// Union of direct actors and every member of every group, deduplicated.
pub async fn resolve_actor_set(
    directory: &dyn Directory,
    actors: &BTreeSet<ActorId>,
    groups: &BTreeSet<GroupId>,
) -> Result<BTreeSet<ActorId>> {
    let mut resolved = actors.clone();
    for group in groups {
        resolved.extend(directory.resolve_group_members(group).await?);
    }
    Ok(resolved)
}
