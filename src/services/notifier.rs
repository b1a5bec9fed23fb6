//! Filter change notification
//!
//! Two listener groups are kept. Active listeners stand for in-flight work
//! that must be cancelled when filters change: they are notified first and
//! then dropped, so each must re-register for the next change. Persistent
//! listeners are notified afterwards on every fire, in registration order.
//!
//! Listener failures (errors and panics) are logged and never stop dispatch.

use crate::core::types::{FilterAction, ScopeId, SubscriptionId};
use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

pub type FilterListener = Arc<dyn Fn(&FiltersChanged) -> Result<()> + Send + Sync>;

/// Wrap a closure as a [`FilterListener`].
pub fn listener<F>(f: F) -> FilterListener
where
    F: Fn(&FiltersChanged) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Name and id of the filter touched by a mutation.
///
/// Synthetic mutations (a whole set removed, an explicit commit) carry a
/// display name only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRef {
    pub id: Option<String>,
    pub name: String,
}

impl FilterRef {
    pub fn synthetic(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
        }
    }
}

/// The most recent registry mutation, overwritten on every change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMutation {
    pub filter: FilterRef,
    pub action: FilterAction,
    pub scope: Option<ScopeId>,
    /// Ids dropped together when a whole filter set is removed
    pub removed_ids: Vec<String>,
}

/// Payload handed to every listener on a fire
#[derive(Debug, Clone)]
pub struct FiltersChanged {
    pub version: u64,
    pub mutation: Option<LastMutation>,
    pub fired_at: DateTime<Utc>,
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    listener: FilterListener,
}

struct NotifierState {
    active: Vec<Subscription>,
    persistent: Vec<Subscription>,
    version: u64,
    auto_commit: bool,
}

/// Listener lists taken under the lock, dispatched after it is released
pub(crate) struct PendingDispatch {
    version: u64,
    active: Vec<Subscription>,
    persistent: Vec<Subscription>,
}

impl PendingDispatch {
    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn dispatch(self, event: &FiltersChanged) {
        debug!(
            version = self.version,
            active = self.active.len(),
            persistent = self.persistent.len(),
            "dispatching filters changed"
        );
        for sub in self.active.iter().chain(self.persistent.iter()) {
            notify(sub, event);
        }
    }
}

fn notify(sub: &Subscription, event: &FiltersChanged) {
    match catch_unwind(AssertUnwindSafe(|| (sub.listener)(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(subscription = %sub.id, "filter listener failed: {e:?}"),
        Err(_) => error!(subscription = %sub.id, "filter listener panicked"),
    }
}

pub struct ChangeNotifier {
    state: Mutex<NotifierState>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ChangeNotifier {
    pub fn new(auto_commit: bool) -> Self {
        Self {
            state: Mutex::new(NotifierState {
                active: Vec::new(),
                persistent: Vec::new(),
                version: 0,
                auto_commit,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NotifierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a persistent listener at the end of the list
    pub fn add_listener(&self, listener: FilterListener) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.lock().persistent.push(Subscription { id, listener });
        id
    }

    /// Register a persistent listener ahead of all existing ones
    pub fn add_listener_first(&self, listener: FilterListener) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.lock().persistent.insert(0, Subscription { id, listener });
        id
    }

    /// Register a one-shot listener for the next fire only
    pub fn add_active_listener(&self, listener: FilterListener) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.lock().active.push(Subscription { id, listener });
        id
    }

    /// Remove a listener from whichever group holds it.
    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.active.len() + state.persistent.len();
        state.active.retain(|s| s.id != id);
        state.persistent.retain(|s| s.id != id);
        before != state.active.len() + state.persistent.len()
    }

    /// (active, persistent) listener counts
    pub fn listener_counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.active.len(), state.persistent.len())
    }

    pub fn set_auto_commit(&self, auto_commit: bool) {
        self.lock().auto_commit = auto_commit;
    }

    pub fn auto_commit(&self) -> bool {
        self.lock().auto_commit
    }

    pub fn current_version(&self) -> u64 {
        self.lock().version
    }

    /// Pass the auto-commit gate and claim the next version.
    ///
    /// Returns `None` when the fire is suppressed; nothing changes then, not
    /// even the version. A forced fire always passes.
    pub(crate) fn begin_fire(&self, force: bool) -> Option<PendingDispatch> {
        let mut state = self.lock();
        if !state.auto_commit && !force {
            return None;
        }
        state.version += 1;
        Some(PendingDispatch {
            version: state.version,
            active: std::mem::take(&mut state.active),
            persistent: state.persistent.clone(),
        })
    }

    /// Fire with no registry context, e.g. to force listeners to refresh.
    pub fn fire(&self, force: bool, mutation: Option<LastMutation>) -> Option<u64> {
        let pending = self.begin_fire(force)?;
        let version = pending.version();
        pending.dispatch(&FiltersChanged {
            version,
            mutation,
            fired_at: Utc::now(),
        });
        Some(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, FilterListener) {
        let hits = Arc::new(AtomicUsize::new(0));
        let inner = hits.clone();
        let listener = listener(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (hits, listener)
    }

    #[test]
    fn active_listener_fires_once() {
        let notifier = ChangeNotifier::default();
        let (hits, listener) = counter();
        notifier.add_active_listener(listener);

        notifier.fire(false, None);
        notifier.fire(false, None);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.listener_counts(), (0, 0));
    }

    #[test]
    fn active_listeners_run_before_persistent() {
        let notifier = ChangeNotifier::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        notifier.add_listener(listener(move |_| {
            o.lock().unwrap().push("persistent");
            Ok(())
        }));
        let o = order.clone();
        notifier.add_active_listener(listener(move |_| {
            o.lock().unwrap().push("active");
            Ok(())
        }));

        notifier.fire(false, None);
        assert_eq!(*order.lock().unwrap(), vec!["active", "persistent"]);
    }

    #[test]
    fn listener_added_first_runs_first() {
        let notifier = ChangeNotifier::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, first) in [("a", false), ("b", false), ("c", true)] {
            let o = order.clone();
            let listener = listener(move |_| {
                o.lock().unwrap().push(name);
                Ok(())
            });
            if first {
                notifier.add_listener_first(listener);
            } else {
                notifier.add_listener(listener);
            }
        }
        notifier.fire(false, None);
        assert_eq!(*order.lock().unwrap(), vec!["c", "a", "b"]);
    }

    #[test]
    fn failing_listeners_do_not_block_others() {
        let notifier = ChangeNotifier::default();
        notifier.add_listener(listener(|_| Err(eyre!("broken listener"))));
        notifier.add_listener(listener(|_| panic!("listener bug")));
        let (hits, listener) = counter();
        notifier.add_listener(listener);

        notifier.fire(false, None);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gate_suppresses_unforced_fires() {
        let notifier = ChangeNotifier::default();
        let (hits, listener) = counter();
        notifier.add_listener(listener);
        notifier.set_auto_commit(false);

        assert_eq!(notifier.fire(false, None), None);
        assert_eq!(notifier.current_version(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert_eq!(notifier.fire(true, None), Some(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_listener_is_not_notified() {
        let notifier = ChangeNotifier::default();
        let (hits, listener) = counter();
        let id = notifier.add_listener(listener);
        assert!(notifier.remove_listener(id));
        assert!(!notifier.remove_listener(id));
        notifier.fire(false, None);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_may_reregister_itself() {
        let notifier = Arc::new(ChangeNotifier::default());
        let hits = Arc::new(AtomicUsize::new(0));

        let n = notifier.clone();
        let h = hits.clone();
        let again = listener(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        notifier.add_active_listener(listener(move |event| {
            again(event)?;
            n.add_active_listener(again.clone());
            Ok(())
        }));

        notifier.fire(false, None);
        notifier.fire(false, None);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
