// File: rusty-cores/src/conflict.rs
// Purpose: Conflict resolution between local and remote versions of a core

use serde::{Deserialize, Serialize};

use crate::models::VersionedEntity;

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Last write wins (based on `last_updated`)
    #[default]
    LastWriteWins,
    /// Local changes always win
    ClientWins,
    /// Remote changes always win
    ServerWins,
}

/// Timestamp-wins resolution: the later `last_updated` wins in full, ties keep the local copy.
///
/// There is no field-level merge, so two concurrent edits touching different
/// fields (a milestone on one device, a value change on another) keep only the
/// later one.
pub fn resolve(local: &VersionedEntity, remote: &VersionedEntity) -> VersionedEntity {
    if remote.last_updated > local.last_updated {
        remote.clone()
    } else {
        local.clone()
    }
}

/// Outcome of resolving one core
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub winner: VersionedEntity,
    pub remote_won: bool,
}

/// Resolver applying the configured strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    strategy: SyncStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: SyncStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> SyncStrategy {
        self.strategy
    }

    pub fn resolve(&self, local: &VersionedEntity, remote: &VersionedEntity) -> Resolution {
        let winner = match self.strategy {
            SyncStrategy::LastWriteWins => resolve(local, remote),
            SyncStrategy::ClientWins => local.clone(),
            SyncStrategy::ServerWins => remote.clone(),
        };
        let remote_won = winner == *remote && winner != *local;
        Resolution { winner, remote_won }
    }

    /// Resolve every incoming core against the local set.
    /// Cores only present remotely are taken as-is.
    pub fn resolve_all(
        &self,
        local: &[VersionedEntity],
        incoming: &[VersionedEntity],
    ) -> Vec<Resolution> {
        incoming
            .iter()
            .map(|remote| match local.iter().find(|l| l.id == remote.id) {
                Some(existing) => self.resolve(existing, remote),
                None => Resolution {
                    winner: remote.clone(),
                    remote_won: true,
                },
            })
            .collect()
    }
}
