//! Snapshot subscriptions.
//!
//! Listeners subscribe through a selector and are called only when the
//! selected slice changes. Each lane keeps its own transaction: publications
//! made inside it are coalesced, and only the last snapshot published before
//! that lane's outermost `end_transaction` reaches listeners.
//!
//! The hub tracks which branch is current. A publication for any other
//! branch is dropped, including one parked in a transaction when the current
//! branch moved underneath it.

use crate::core::queue::Lane;
use crate::core::snapshot::Snapshot;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub type Selector = Arc<dyn Fn(&Snapshot) -> Value + Send + Sync>;
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Call the listener once with the current selection on subscribe.
    pub fire_immediately: bool,
}

struct Entry {
    selector: Selector,
    listener: Listener,
    last: Option<Value>,
}

/// A snapshot together with the branch it belongs to.
struct Publication {
    branch_id: String,
    snapshot: Arc<Snapshot>,
}

#[derive(Default)]
struct LaneTransaction {
    depth: u32,
    pending: Option<Publication>,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    entries: BTreeMap<u64, Entry>,
    current_branch: Option<String>,
    lanes: FxHashMap<Lane, LaneTransaction>,
}

impl HubState {
    fn is_current(&self, branch_id: &str) -> bool {
        self.current_branch.as_deref().is_none_or(|current| current == branch_id)
    }

    fn calls_for(&mut self, snapshot: &Snapshot) -> Vec<(Listener, Value)> {
        self.entries
            .values_mut()
            .filter_map(|entry| {
                let selected = (entry.selector)(snapshot);
                if entry.last.as_ref() == Some(&selected) {
                    return None;
                }
                entry.last = Some(selected.clone());
                Some((Arc::clone(&entry.listener), selected))
            })
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct SubscriptionHub {
    state: Arc<Mutex<HubState>>,
}

/// Live subscription. Dropping it does not unsubscribe; call `unsubscribe`.
pub struct Subscription {
    id: u64,
    hub: Weak<Mutex<HubState>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(state) = self.hub.upgrade() {
            let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
            state.entries.remove(&self.id);
        }
    }
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn subscribe(
        &self,
        selector: Selector,
        listener: Listener,
        opts: SubscribeOptions,
        current: Option<&Snapshot>,
    ) -> Subscription {
        let initial = current.map(|s| selector(s));
        let id = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.entries.insert(
                id,
                Entry {
                    selector,
                    listener: Arc::clone(&listener),
                    last: initial.clone(),
                },
            );
            id
        };
        if opts.fire_immediately
            && let Some(value) = initial
        {
            listener(&value);
        }
        Subscription {
            id,
            hub: Arc::downgrade(&self.state),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn current_branch(&self) -> Option<String> {
        self.lock().current_branch.clone()
    }

    pub fn start_transaction(&self, lane: Lane) {
        self.lock().lanes.entry(lane).or_default().depth += 1;
    }

    pub fn end_transaction(&self, lane: Lane) {
        let calls = {
            let mut state = self.lock();
            let flushed = match state.lanes.get_mut(&lane) {
                Some(tx) => {
                    tx.depth = tx.depth.saturating_sub(1);
                    if tx.depth == 0 { tx.pending.take() } else { None }
                }
                None => None,
            };
            match flushed {
                Some(publication) if state.is_current(&publication.branch_id) => {
                    state.calls_for(&publication.snapshot)
                }
                Some(publication) => {
                    tracing::debug!(branch_id = %publication.branch_id, "dropping publication for a branch that is no longer current");
                    Vec::new()
                }
                None => Vec::new(),
            }
        };
        notify(calls);
    }

    /// Publish `snapshot` as the state of `branch_id`. Parked while `lane` has
    /// an open transaction; dropped unless the branch is current.
    pub fn publish(&self, lane: Lane, branch_id: &str, snapshot: Arc<Snapshot>) {
        let calls = {
            let mut state = self.lock();
            if !state.is_current(branch_id) {
                tracing::trace!(branch_id, "publication for a non-current branch dropped");
                return;
            }
            if let Some(tx) = state.lanes.get_mut(&lane)
                && tx.depth > 0
            {
                tx.pending = Some(Publication {
                    branch_id: branch_id.to_string(),
                    snapshot,
                });
                return;
            }
            state.calls_for(&snapshot)
        };
        notify(calls);
    }

    /// Make `branch_id` current and deliver its head snapshot right away.
    /// Publications other lanes parked for the previous branch are discarded.
    pub fn switch_to(&self, branch_id: &str, snapshot: Arc<Snapshot>) {
        let calls = {
            let mut state = self.lock();
            state.current_branch = Some(branch_id.to_string());
            for tx in state.lanes.values_mut() {
                if tx.pending.as_ref().is_some_and(|p| p.branch_id != branch_id) {
                    tx.pending = None;
                }
            }
            state.calls_for(&snapshot)
        };
        notify(calls);
    }
}

// Listeners run outside the lock so they may subscribe or unsubscribe.
fn notify(calls: Vec<(Listener, Value)>) {
    for (listener, value) in calls {
        listener(&value);
    }
}

/// RAII transaction on one lane: ends on drop, flushing coalesced publications.
pub struct TransactionGuard<'a> {
    hub: &'a SubscriptionHub,
    lane: Lane,
}

impl<'a> TransactionGuard<'a> {
    pub fn begin(hub: &'a SubscriptionHub, lane: Lane) -> Self {
        hub.start_transaction(lane);
        Self { hub, lane }
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.hub.end_transaction(self.lane);
    }
}
