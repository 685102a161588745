//! Watch registry
//!
//! Holds the active subscriptions and evaluates them against each block's
//! events. Watches are evaluated in subscription order and each fires its
//! update callback at most once per block (wildcard watches fire once per
//! discovered key).

use crate::error::{SyncError, SyncResult};
use crate::hooks::{match_hooks, HookPattern, ObjectId, WatchTarget};
use crate::logs::EventLogEntry;
use serde::Deserialize;
use tracing::debug;

/// Handle returned by [`WatchRegistry::subscribe`].
pub type WatchId = u64;

/// Called with the affected key (or the discovered key, for wildcard watches).
pub type UpdateCallback = Box<dyn Fn(ObjectId) + Send + Sync>;

/// Called once when the watch is removed.
pub type DeleteCallback = Box<dyn FnOnce(WatchTarget) + Send + Sync>;

/// What to do with a concrete watch that declares no hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnhookedWatchPolicy {
    /// Fire the watch on every block.
    #[default]
    AlwaysUpdate,
    /// Refuse the subscription with [`SyncError::MissingHooks`].
    Reject,
}

struct Watch {
    id: WatchId,
    target: WatchTarget,
    hooks: Vec<HookPattern>,
    on_update: UpdateCallback,
    on_delete: Option<DeleteCallback>,
}

pub struct WatchRegistry {
    watches: Vec<Watch>,
    next_id: WatchId,
    unhooked: UnhookedWatchPolicy,
}

impl WatchRegistry {
    pub fn new(unhooked: UnhookedWatchPolicy) -> Self {
        Self {
            watches: Vec::new(),
            next_id: 1,
            unhooked,
        }
    }

    /// Register a watch.
    ///
    /// Wildcard watches always need at least one hook; concrete watches
    /// without hooks follow the registry's [`UnhookedWatchPolicy`].
    pub fn subscribe(
        &mut self,
        target: WatchTarget,
        hooks: Vec<HookPattern>,
        on_update: UpdateCallback,
        on_delete: Option<DeleteCallback>,
    ) -> SyncResult<WatchId> {
        if hooks.is_empty()
            && (target == WatchTarget::Any || self.unhooked == UnhookedWatchPolicy::Reject)
        {
            return Err(SyncError::MissingHooks);
        }

        let id = self.next_id;
        self.next_id += 1;
        debug!(
            "Adding watch #{} for {} on [{}]",
            id,
            target,
            hooks.iter().map(|h| h.to_string()).collect::<Vec<_>>().join(", ")
        );
        self.watches.push(Watch {
            id,
            target,
            hooks,
            on_update,
            on_delete,
        });
        Ok(id)
    }

    /// Remove a watch, invoking its delete callback once.
    ///
    /// Returns `false` if no such watch is registered.
    pub fn unsubscribe(&mut self, id: WatchId) -> bool {
        let Some(pos) = self.watches.iter().position(|w| w.id == id) else {
            return false;
        };
        let watch = self.watches.remove(pos);
        debug!("Deleting watch #{} for {}", watch.id, watch.target);
        if let Some(on_delete) = watch.on_delete {
            on_delete(watch.target);
        }
        true
    }

    /// Evaluate every watch against one block's events.
    ///
    /// Returns the number of update callbacks fired.
    pub fn evaluate(&self, events: &[EventLogEntry]) -> usize {
        let mut fired = 0;
        for watch in &self.watches {
            match watch.target {
                WatchTarget::Key(key) => {
                    let update = watch.hooks.is_empty()
                        || match_hooks(&watch.hooks, events, watch.target, |_| {});
                    if update {
                        (watch.on_update)(key);
                        fired += 1;
                    }
                }
                WatchTarget::Any => {
                    match_hooks(&watch.hooks, events, WatchTarget::Any, |id| match id {
                        Some(id) => {
                            (watch.on_update)(id);
                            fired += 1;
                        }
                        None => debug!(
                            "Watch #{} matched an event without a usable key",
                            watch.id
                        ),
                    });
                }
            }
        }
        fired
    }

    pub fn contains(&self, id: WatchId) -> bool {
        self.watches.iter().any(|w| w.id == id)
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new(UnhookedWatchPolicy::default())
    }
}
