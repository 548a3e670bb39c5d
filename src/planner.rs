//! Partitions refs into created, updated and removed since the last sync

use crate::git::RefMap;
use std::collections::{BTreeMap, BTreeSet};

/// Commit range an updated ref moved across
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub from: String,
    pub to: String,
}

/// What a sync has to do for each ref
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefSyncPlan {
    /// New refs and the commit to walk
    pub created: BTreeMap<String, String>,
    /// Refs whose commit moved
    pub updated: BTreeMap<String, RefUpdate>,
    /// Refs that no longer exist
    pub removed: BTreeSet<String>,
    /// Refs already indexed at their live commit
    pub up_to_date: BTreeSet<String>,
}

impl RefSyncPlan {
    /// Nothing to index and nothing to retire
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Refs the pipeline will produce operations for
    pub fn active_refs(&self) -> BTreeSet<String> {
        self.created
            .keys()
            .chain(self.updated.keys())
            .cloned()
            .collect()
    }
}

/// Compare the live ref map against the last indexed one
pub fn plan(live: &RefMap, indexed: &RefMap) -> RefSyncPlan {
    let mut result = RefSyncPlan::default();

    for (name, commit) in live {
        match indexed.get(name) {
            None => {
                result.created.insert(name.clone(), commit.clone());
            }
            Some(previous) if previous != commit => {
                result.updated.insert(
                    name.clone(),
                    RefUpdate {
                        from: previous.clone(),
                        to: commit.clone(),
                    },
                );
            }
            Some(_) => {
                result.up_to_date.insert(name.clone());
            }
        }
    }

    result.removed = indexed
        .keys()
        .filter(|name| !live.contains_key(*name))
        .cloned()
        .collect();

    result
}
