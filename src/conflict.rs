// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict resolution for mutations the remote rejected as stale.
//!
//! Policy is last-writer-wins on timestamps (local `created_at` vs remote
//! `lastModified`), with an additive set-union merge for fields explicitly
//! declared mergeable. Everything else is either-or.
//!
//! | local vs remote | result                                  |
//! |-----------------|-----------------------------------------|
//! | local older     | `RemoteWins` (drop local, not an error) |
//! | local newer     | `LocalWins` (resubmit)                  |
//! | equal           | configurable tie-break, default remote  |
//!
//! If any mergeable array field on the losing side holds values the winner
//! lacks, the outcome becomes `Merged` and the merged document is resubmitted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::sync_task::SyncTask;

/// Remote state reported alongside a conflict response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSnapshot {
    /// Remote modification time (epoch millis)
    pub last_modified: i64,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
    Merged,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalWins => write!(f, "local-wins"),
            Self::RemoteWins => write!(f, "remote-wins"),
            Self::Merged => write!(f, "merged"),
        }
    }
}

/// Which side wins when timestamps are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    LocalWins,
    #[default]
    RemoteWins,
}

/// Outcome of one reconciliation step. Logged, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub local: SyncTask,
    pub remote: RemoteSnapshot,
    pub resolution: Resolution,
    /// Present only for `Merged`
    pub merged: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    mergeable_fields: BTreeSet<String>,
    tie_break: TieBreak,
}

impl ConflictResolver {
    #[must_use]
    pub fn new<I, S>(mergeable_fields: I, tie_break: TieBreak) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mergeable_fields: mergeable_fields.into_iter().map(Into::into).collect(),
            tie_break,
        }
    }

    #[must_use]
    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    pub fn mergeable_fields(&self) -> impl Iterator<Item = &str> {
        self.mergeable_fields.iter().map(String::as_str)
    }

    pub fn resolve(&self, local: &SyncTask, remote: &RemoteSnapshot) -> ConflictRecord {
        let local_wins = match local.created_at.cmp(&remote.last_modified) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.tie_break == TieBreak::LocalWins,
        };

        let merged = match (local.payload_json(), &remote.data) {
            (Some(Value::Object(local_obj)), Value::Object(remote_obj)) if !self.mergeable_fields.is_empty() => {
                let (winner, loser) = if local_wins {
                    (&local_obj, remote_obj)
                } else {
                    (remote_obj, &local_obj)
                };
                self.merge_into_winner(winner, loser)
            }
            _ => None,
        };

        let resolution = match (&merged, local_wins) {
            (Some(_), _) => Resolution::Merged,
            (None, true) => Resolution::LocalWins,
            (None, false) => Resolution::RemoteWins,
        };

        ConflictRecord {
            local: local.clone(),
            remote: remote.clone(),
            resolution,
            merged,
        }
    }

    /// Union mergeable arrays from `loser` into a copy of `winner`.
    /// Returns `None` when the union adds nothing the winner lacks.
    fn merge_into_winner(&self, winner: &Map<String, Value>, loser: &Map<String, Value>) -> Option<Value> {
        let mut result = winner.clone();
        let mut changed = false;

        for field in &self.mergeable_fields {
            let Some(Value::Array(extra)) = loser.get(field) else {
                continue;
            };
            let mut combined = match winner.get(field) {
                Some(Value::Array(items)) => items.clone(),
                Some(_) => continue,
                None => Vec::new(),
            };
            for item in extra {
                if !combined.contains(item) {
                    combined.push(item.clone());
                    changed = true;
                }
            }
            result.insert(field.clone(), Value::Array(combined));
        }

        changed.then_some(Value::Object(result))
    }
}
