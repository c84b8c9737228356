//! What the proxy engine currently holds for one node

use std::collections::{HashMap, HashSet};

use crate::core::{HandlerId, NodeParams, TlsMaterial, UserEntry, UserId, UserLimits};

/// Live state of a node, mutated only after the engine accepted a change
#[derive(Debug, Default)]
pub struct LiveState {
    /// Users registered with the engine (or pending the next rebuild)
    pub users: HashMap<UserId, UserEntry>,
    /// Structural hash of the params the current inbound was built from
    pub params_hash: Option<String>,
    /// Params the current inbound was built from
    pub params: Option<NodeParams>,
    /// TLS material the current inbound was built with
    pub tls: Option<TlsMaterial>,
    /// Current inbound handler
    pub handler: Option<HandlerId>,
    /// Last rebuild failed; next node sync rebuilds regardless of the hash
    pub stale: bool,
}

/// Changes needed to bring the live user set to the desired one
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UserDiff {
    /// Only in the desired set
    pub added: Vec<UserEntry>,
    /// Only in the live set
    pub removed: Vec<UserId>,
    /// Same credential, different limits
    pub updated: Vec<UserEntry>,
    /// Credential changed; the engine entry has to be replaced
    pub replaced: Vec<UserEntry>,
}

impl UserDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.replaced.is_empty()
    }
}

impl LiveState {
    /// Whether the inbound is built from `hash` and healthy
    pub fn is_current(&self, hash: &str) -> bool {
        !self.stale && self.handler.is_some() && self.params_hash.as_deref() == Some(hash)
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Diff by user id. Duplicated ids in `desired` resolve to the last entry.
    pub fn diff<'a, I>(&self, desired: I) -> UserDiff
    where
        I: IntoIterator<Item = &'a UserEntry>,
    {
        let desired: HashMap<UserId, &UserEntry> = desired.into_iter().map(|u| (u.id, u)).collect();
        let live_ids: HashSet<UserId> = self.users.keys().copied().collect();
        let desired_ids: HashSet<UserId> = desired.keys().copied().collect();

        let mut diff = UserDiff {
            removed: live_ids.difference(&desired_ids).copied().collect(),
            ..UserDiff::default()
        };

        for id in desired_ids.difference(&live_ids) {
            diff.added.push(desired[id].clone());
        }

        for id in desired_ids.intersection(&live_ids) {
            let (old, new) = (&self.users[id], desired[id]);
            if old.credential != new.credential {
                diff.replaced.push(new.clone());
            } else if UserLimits::from(old) != UserLimits::from(new) {
                diff.updated.push(new.clone());
            }
        }

        // Stable order for logging and tests
        diff.added.sort_by_key(|u| u.id);
        diff.removed.sort_unstable();
        diff.updated.sort_by_key(|u| u.id);
        diff.replaced.sort_by_key(|u| u.id);
        diff
    }

    /// Forget everything, typically after the inbound was torn down
    pub fn reset(&mut self) {
        *self = LiveState::default();
    }
}
