use crate::config::Settings;
use crate::core::filter::{Filter, VariantColumns};
use crate::core::state::{FilterState, FilterStateError};
use crate::core::types::{FilterAction, ScopeId, SubscriptionId};
use crate::services::compiler::ConditionCompiler;
use crate::services::count::{FilteredCountRefresher, QueryExecutor};
use crate::services::notifier::{ChangeNotifier, FilterListener, FilterRef, FiltersChanged, LastMutation};
use crate::sql::{Condition, ConditionMatrix};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tracing::debug;

pub const FILTER_SET_NAME: &str = "Filter Set";
pub const LOADED_SETS_NAME: &str = "Loaded filter sets";

type FilterMap = BTreeMap<ScopeId, BTreeMap<String, Filter>>;

#[derive(Default)]
struct RegistryState {
    filter_map: FilterMap,
    last: Option<LastMutation>,
}

impl RegistryState {
    fn record(&mut self, filter: FilterRef, action: FilterAction, scope: Option<ScopeId>) {
        self.last = Some(LastMutation {
            filter,
            action,
            scope,
            removed_ids: Vec::new(),
        });
    }
}

/// Authoritative store of the active filters of every scope.
///
/// Scopes and filters are kept in key order so compiled conditions come out
/// the same on every run. A scope never stays in the map once it has no
/// filters. All access goes through the entry points here; listeners are
/// always called with the lock released, so they may read or mutate the
/// registry themselves.
pub struct FilterRegistry {
    state: Mutex<RegistryState>,
    notifier: ChangeNotifier,
    compiler: ConditionCompiler,
    count_refresher: Option<FilteredCountRefresher>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new(VariantColumns::default())
    }
}

impl FilterRegistry {
    pub fn new(columns: VariantColumns) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            notifier: ChangeNotifier::default(),
            compiler: ConditionCompiler::new(columns),
            count_refresher: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let registry = Self::new(settings.columns());
        registry.notifier.set_auto_commit(settings.auto_commit);
        registry
    }

    /// Like [`from_settings`](Self::from_settings), counting with `executor`
    /// on `runtime` unless `count_refresh` is off.
    pub fn from_settings_with_executor(
        settings: &Settings,
        runtime: Handle,
        executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        let registry = Self::from_settings(settings);
        if !settings.count_refresh {
            debug!("filtered count refresh disabled");
            return registry;
        }
        registry.with_count_refresher(FilteredCountRefresher::new(runtime, executor))
    }

    /// Recompute the filtered count in the background after every fire.
    pub fn with_count_refresher(mut self, refresher: FilteredCountRefresher) -> Self {
        self.count_refresher = Some(refresher);
        self
    }

    pub fn count_refresher(&self) -> Option<&FilteredCountRefresher> {
        self.count_refresher.as_ref()
    }

    pub fn compiler(&self) -> &ConditionCompiler {
        &self.compiler
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `filter` into `scope`, replacing any filter with the same id.
    pub fn add_filter(&self, filter: Filter, scope: ScopeId) {
        {
            let mut state = self.lock();
            let filter_ref = FilterRef {
                id: Some(filter.id.clone()),
                name: filter.name.clone(),
            };
            let previous = state
                .filter_map
                .entry(scope)
                .or_default()
                .insert(filter.id.clone(), filter);
            let action = if previous.is_none() {
                FilterAction::Added
            } else {
                FilterAction::Modified
            };
            debug!(%scope, id = ?filter_ref.id, %action, "filter stored");
            state.record(filter_ref, action, Some(scope));
        }
        self.fire_filters_changed();
    }

    /// Remove one filter. Unknown scopes and ids are ignored.
    pub fn remove_filter(&self, filter_id: &str, scope: ScopeId) {
        {
            let mut state = self.lock();
            let Some(filters) = state.filter_map.get_mut(&scope) else {
                return;
            };
            let removed = filters.remove(filter_id);
            if filters.is_empty() {
                state.filter_map.remove(&scope);
            }
            let Some(removed) = removed else {
                return;
            };
            debug!(%scope, id = filter_id, "filter removed");
            state.record(
                FilterRef {
                    id: Some(removed.id),
                    name: removed.name,
                },
                FilterAction::Removed,
                Some(scope),
            );
        }
        self.fire_filters_changed();
    }

    /// Drop a whole scope. Nothing fires when the scope held no filters.
    pub fn remove_filter_set(&self, scope: ScopeId) {
        {
            let mut state = self.lock();
            let Some(filters) = state.filter_map.remove(&scope) else {
                return;
            };
            if filters.is_empty() {
                return;
            }
            let removed_ids: Vec<String> = filters.into_keys().collect();
            debug!(%scope, removed = removed_ids.len(), "filter set removed");
            state.last = Some(LastMutation {
                filter: FilterRef::synthetic(FILTER_SET_NAME),
                action: FilterAction::Removed,
                scope: Some(scope),
                removed_ids,
            });
        }
        self.fire_filters_changed();
    }

    /// Clear every scope without notifying anyone.
    ///
    /// Used when the session context changes; callers refresh their own views.
    pub fn remove_all_filters(&self) {
        self.lock().filter_map.clear();
        debug!("all filters cleared");
    }

    pub fn filter(&self, scope: ScopeId, filter_id: &str) -> Option<Filter> {
        self.lock()
            .filter_map
            .get(&scope)
            .and_then(|filters| filters.get(filter_id))
            .cloned()
    }

    pub fn has_filters_applied(&self) -> bool {
        self.lock().filter_map.values().any(|filters| !filters.is_empty())
    }

    pub fn is_filter_active(&self, scope: ScopeId, filter_id: &str) -> bool {
        self.lock()
            .filter_map
            .get(&scope)
            .is_some_and(|filters| filters.contains_key(filter_id))
    }

    /// Scopes that currently hold filters, in ascending order
    pub fn scopes(&self) -> Vec<ScopeId> {
        self.lock().filter_map.keys().copied().collect()
    }

    /// Query-capable filters of one scope with range filters merged.
    pub fn query_filters(&self, scope: ScopeId) -> Vec<Filter> {
        let state = self.lock();
        state
            .filter_map
            .get(&scope)
            .map(|filters| self.compiler.query_filters(filters))
            .unwrap_or_default()
    }

    pub fn query_filters_all(&self) -> Vec<Vec<Filter>> {
        let state = self.lock();
        state
            .filter_map
            .values()
            .map(|filters| self.compiler.query_filters(filters))
            .collect()
    }

    /// Compiled conditions of one scope, to be ANDed by the caller.
    pub fn query_filter_conditions(&self, scope: ScopeId) -> Vec<Condition> {
        let state = self.lock();
        state
            .filter_map
            .get(&scope)
            .map(|filters| self.compiler.compile(filters))
            .unwrap_or_default()
    }

    /// One compiled row per scope, in scope order.
    ///
    /// How rows combine is up to the consumer.
    pub fn query_filter_conditions_all(&self) -> ConditionMatrix {
        let state = self.lock();
        compile_all(&self.compiler, &state.filter_map)
    }

    pub fn set_auto_commit(&self, auto_commit: bool) {
        self.notifier.set_auto_commit(auto_commit);
    }

    pub fn auto_commit(&self) -> bool {
        self.notifier.auto_commit()
    }

    /// Force exactly one notification for a batch of mutations made with
    /// auto-commit off.
    pub fn commit(&self, name: &str, action: FilterAction) {
        self.lock().record(FilterRef::synthetic(name), action, None);
        self.fire(true);
    }

    /// Notify listeners unless auto-commit is off.
    pub fn fire_filters_changed(&self) {
        self.fire(false);
    }

    fn fire(&self, force: bool) {
        let Some(pending) = self.notifier.begin_fire(force) else {
            debug!("filters changed notification suppressed");
            return;
        };
        let version = pending.version();
        let (mutation, matrix) = {
            let state = self.lock();
            let matrix = self
                .count_refresher
                .as_ref()
                .map(|_| compile_all(&self.compiler, &state.filter_map));
            (state.last.clone(), matrix)
        };
        if let (Some(refresher), Some(matrix)) = (self.count_refresher.as_ref(), matrix) {
            // Fire-and-forget; the refresher logs its own failures.
            drop(refresher.refresh(version, matrix));
        }
        pending.dispatch(&FiltersChanged {
            version,
            mutation,
            fired_at: Utc::now(),
        });
    }

    pub fn last_mutation(&self) -> Option<LastMutation> {
        self.lock().last.clone()
    }

    pub fn last_filter(&self) -> Option<FilterRef> {
        self.lock().last.as_ref().map(|m| m.filter.clone())
    }

    pub fn last_action(&self) -> Option<FilterAction> {
        self.lock().last.as_ref().map(|m| m.action)
    }

    /// Display string for the last action, empty before any mutation
    pub fn last_action_string(&self) -> &'static str {
        self.last_action().map(|a| a.as_str()).unwrap_or("")
    }

    /// Monotonic filter-set version, bumped once per delivered notification
    pub fn current_filter_set_id(&self) -> u64 {
        self.notifier.current_version()
    }

    pub fn add_filter_listener(&self, listener: FilterListener) -> SubscriptionId {
        self.notifier.add_listener(listener)
    }

    pub fn add_filter_listener_first(&self, listener: FilterListener) -> SubscriptionId {
        self.notifier.add_listener_first(listener)
    }

    pub fn add_active_filter_listener(&self, listener: FilterListener) -> SubscriptionId {
        self.notifier.add_active_listener(listener)
    }

    pub fn remove_filter_listener(&self, id: SubscriptionId) -> bool {
        self.notifier.remove_listener(id)
    }

    /// Every scope as a saved set, in scope order
    pub fn to_filter_states(&self) -> Vec<Vec<FilterState>> {
        self.lock()
            .filter_map
            .values()
            .map(|filters| filters.values().map(FilterState::from).collect())
            .collect()
    }

    /// Restore saved sets, each into a fresh scope after the highest one in use.
    ///
    /// Every state is converted before anything is stored, so a bad set leaves
    /// the registry untouched. Empty sets are skipped. A successful load fires
    /// exactly once, regardless of auto-commit.
    pub fn load_filter_states(
        &self,
        sets: Vec<Vec<FilterState>>,
    ) -> Result<Vec<ScopeId>, FilterStateError> {
        let converted = sets
            .into_iter()
            .map(|set| {
                set.into_iter()
                    .map(Filter::try_from)
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let scopes = {
            let mut state = self.lock();
            // Every id is claimed before anything is stored, so running out
            // of ids leaves the registry untouched.
            let mut prev = state.filter_map.keys().next_back().copied();
            let mut planned = Vec::new();
            for filters in converted.into_iter().filter(|f| !f.is_empty()) {
                let scope = match prev {
                    Some(p) => p.next().ok_or(FilterStateError::ScopeExhausted(p))?,
                    None => ScopeId(0),
                };
                planned.push((scope, filters));
                prev = Some(scope);
            }
            let scopes: Vec<ScopeId> = planned
                .into_iter()
                .map(|(scope, filters)| {
                    let map = filters.into_iter().map(|f| (f.id.clone(), f)).collect();
                    state.filter_map.insert(scope, map);
                    scope
                })
                .collect();
            debug!(loaded = scopes.len(), "filter sets restored");
            scopes
        };
        if !scopes.is_empty() {
            self.commit(LOADED_SETS_NAME, FilterAction::Replaced);
        }
        Ok(scopes)
    }
}

fn compile_all(compiler: &ConditionCompiler, filter_map: &FilterMap) -> ConditionMatrix {
    filter_map
        .values()
        .map(|filters| compiler.compile(filters))
        .collect()
}
