//! Last-write-wins conflict policy.
//!
//! Every inbound row (pull page, live feed event, push acknowledgment) is
//! merged with the locally held version of the same id through
//! [`ConflictPolicy::decide`]. The greater `updated_at` wins outright. The
//! `deleted` tombstone is an ordinary field here, so a delete only wins when
//! it is the later write.

use crate::Record;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Which side wins when both versions carry the same `updated_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The backend is the authority of record for simultaneous writes.
    #[default]
    RemoteWins,
    /// Keep the local version on a tie.
    LocalWins,
}

/// Outcome of comparing a local and an incoming version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// No local version, or the incoming one is newer: take it.
    TakeIncoming,
    /// The local version is newer (or wins the tie): keep it.
    KeepLocal,
    /// Both sides already hold exactly this version.
    Identical,
}

impl MergeDecision {
    /// Whether the merge changes local state.
    pub fn applies(self) -> bool {
        matches!(self, MergeDecision::TakeIncoming)
    }
}

/// Merge policy shared by the pull, live feed and push paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConflictPolicy {
    pub tie_break: TieBreak,
}

impl ConflictPolicy {
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    /// Compare `local` (if any) against `incoming` for the same id.
    pub fn decide(&self, local: Option<&Record>, incoming: &Record) -> MergeDecision {
        let Some(local) = local else {
            return MergeDecision::TakeIncoming;
        };

        if local.same_version(incoming) {
            return MergeDecision::Identical;
        }

        match incoming.updated_at.cmp(&local.updated_at) {
            Ordering::Greater => MergeDecision::TakeIncoming,
            Ordering::Less => MergeDecision::KeepLocal,
            Ordering::Equal => match self.tie_break {
                TieBreak::RemoteWins => MergeDecision::TakeIncoming,
                TieBreak::LocalWins => MergeDecision::KeepLocal,
            },
        }
    }

    /// Merge `incoming` over `local`, returning the surviving version.
    pub fn merge<'a>(&self, local: Option<&'a Record>, incoming: &'a Record) -> &'a Record {
        match (self.decide(local, incoming), local) {
            (MergeDecision::KeepLocal, Some(local)) => local,
            _ => incoming,
        }
    }
}
