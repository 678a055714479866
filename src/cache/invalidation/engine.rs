use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::{gauge, histogram};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::rules::{
    InvalidationRule, InvalidationStrategy, RuleContext, RuleTrigger, RuleUpdate, detect_cycle,
};
use crate::cache::config::InvalidationConfig;
use crate::cache::events::{EventKind, Notifier};
use crate::cache::lock::{mutex_lock, rw_read, rw_write};
use crate::cache::planner::{InvalidationPlan, PlanStep};
use crate::cache::task::BackgroundTask;
use crate::cache::traits::{CacheStore, CacheValueType};
use crate::error::{CacheError, CacheResult};

const SOURCE: &str = "cache::invalidation";

/// One or many invalidation targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Targets(Vec<String>);

impl Targets {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for Targets {
    fn from(target: &str) -> Self {
        Self(vec![target.to_string()])
    }
}

impl From<String> for Targets {
    fn from(target: String) -> Self {
        Self(vec![target])
    }
}

impl From<Vec<String>> for Targets {
    fn from(targets: Vec<String>) -> Self {
        Self(targets)
    }
}

impl From<&[String]> for Targets {
    fn from(targets: &[String]) -> Self {
        Self(targets.to_vec())
    }
}

impl From<Vec<&str>> for Targets {
    fn from(targets: Vec<&str>) -> Self {
        Self(targets.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Targets {
    fn from(targets: [&str; N]) -> Self {
        Self(targets.into_iter().map(str::to_string).collect())
    }
}

/// Per-call options for [`InvalidationEngine::invalidate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationOptions {
    /// Chunk size for the batch strategy. Defaults to the engine's configured size.
    pub batch_size: Option<NonZeroUsize>,
    /// Free-form reason, logged with the result.
    pub reason: Option<String>,
}

/// Outcome of one invalidation. Failures are reported here, not raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidationResult {
    pub success: bool,
    pub strategy: InvalidationStrategy,
    pub invalidated_keys: usize,
    pub invalidated_namespaces: usize,
    pub invalidated_tags: usize,
    pub execution_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Capability notes, e.g. a pattern the store could not enumerate.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    /// Dependency rules fired in cascade after this one.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cascaded: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl InvalidationResult {
    fn empty(strategy: InvalidationStrategy) -> Self {
        Self {
            success: true,
            strategy,
            invalidated_keys: 0,
            invalidated_namespaces: 0,
            invalidated_tags: 0,
            execution_time_ms: 0.0,
            error: None,
            notes: Vec::new(),
            rule_id: None,
            cascaded: Vec::new(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    fn skipped(rule: &InvalidationRule, reason: String) -> Self {
        Self {
            success: false,
            error: Some(reason),
            rule_id: Some(rule.id.clone()),
            ..Self::empty(rule.strategy)
        }
    }
}

/// Running engine statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidationStats {
    pub total_invalidations: u64,
    pub successful_invalidations: u64,
    pub failed_invalidations: u64,
    pub average_execution_time_ms: f64,
    pub total_keys_invalidated: u64,
    pub active_rules: usize,
    pub strategy_usage: BTreeMap<String, u64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_invalidation: Option<OffsetDateTime>,
}

#[derive(Default)]
struct StatsState {
    total: u64,
    successful: u64,
    failed: u64,
    total_time_ms: f64,
    total_keys: u64,
    strategy_usage: BTreeMap<String, u64>,
    last_invalidation: Option<OffsetDateTime>,
}

#[derive(Default)]
struct Outcome {
    keys: usize,
    namespaces: usize,
    tags: usize,
    attempted: usize,
    errors: Vec<String>,
    notes: Vec<String>,
}

impl Outcome {
    fn fail(&mut self, message: String) {
        self.errors.push(message);
    }
}

/// Resolves invalidation requests and rules into store operations.
pub struct InvalidationEngine<V> {
    config: InvalidationConfig,
    store: RwLock<Option<Arc<dyn CacheStore<V>>>>,
    rules: DashMap<String, InvalidationRule>,
    stats: Mutex<StatsState>,
    next_due: Mutex<HashMap<String, Instant>>,
    notifier: Arc<dyn Notifier>,
}

impl<V: CacheValueType> InvalidationEngine<V> {
    pub fn new(config: InvalidationConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            store: RwLock::new(None),
            rules: DashMap::new(),
            stats: Mutex::new(StatsState::default()),
            next_due: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    /// Attach the store invalidations run against. Replaces any previous store.
    pub fn bind_store(&self, store: Arc<dyn CacheStore<V>>) {
        info!(store = store.name(), "Invalidation engine bound to store");
        *rw_write(&self.store, SOURCE, "bind_store") = Some(store);
    }

    pub fn has_store(&self) -> bool {
        rw_read(&self.store, SOURCE, "has_store").is_some()
    }

    fn bound_store(&self) -> CacheResult<Arc<dyn CacheStore<V>>> {
        rw_read(&self.store, SOURCE, "bound_store")
            .clone()
            .ok_or(CacheError::NoStoreBound)
    }

    // ========================================================================
    // Ad-hoc invalidation
    // ========================================================================

    /// Invalidate `targets` under `strategy`.
    ///
    /// Only a missing store is an error. Store failures, unparsable targets
    /// and non-enumerable stores are reported in the result.
    #[instrument(skip_all, fields(strategy = %strategy))]
    pub async fn invalidate(
        &self,
        targets: impl Into<Targets>,
        strategy: InvalidationStrategy,
        options: InvalidationOptions,
    ) -> CacheResult<InvalidationResult> {
        let store = self.bound_store()?;
        let targets = targets.into();
        let started = std::time::Instant::now();

        let batch_size = options
            .batch_size
            .unwrap_or_else(|| self.config.batch_size_non_zero());
        let plan = InvalidationPlan::from_targets(targets.as_slice(), strategy, batch_size);
        let outcome = execute(store.as_ref(), &plan).await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let failed = outcome.errors.len();
        let result = InvalidationResult {
            success: failed == 0,
            invalidated_keys: outcome.keys,
            invalidated_namespaces: outcome.namespaces,
            invalidated_tags: outcome.tags,
            execution_time_ms: elapsed_ms,
            error: outcome.errors.first().map(|first| {
                format!(
                    "{failed} of {} operations failed; first error: {first}",
                    outcome.attempted
                )
            }),
            notes: outcome.notes,
            ..InvalidationResult::empty(strategy)
        };

        self.record(&result);
        histogram!("tiercache_invalidation_ms", "strategy" => strategy.as_str())
            .record(elapsed_ms);

        if result.success {
            info!(
                targets = targets.as_slice().len(),
                invalidated_keys = result.invalidated_keys,
                invalidated_namespaces = result.invalidated_namespaces,
                invalidated_tags = result.invalidated_tags,
                elapsed_ms,
                reason = options.reason.as_deref().unwrap_or("manual"),
                "Invalidation completed"
            );
            self.notifier.publish(EventKind::InvalidationCompleted {
                strategy: strategy.to_string(),
                invalidated_keys: result.invalidated_keys,
                invalidated_namespaces: result.invalidated_namespaces,
                invalidated_tags: result.invalidated_tags,
                elapsed_ms,
            });
        } else {
            let error = result.error.clone().unwrap_or_default();
            warn!(
                targets = targets.as_slice().len(),
                invalidated_keys = result.invalidated_keys,
                elapsed_ms,
                error = %error,
                "Invalidation partially failed"
            );
            self.notifier.publish(EventKind::InvalidationFailed {
                strategy: strategy.to_string(),
                error,
            });
        }
        Ok(result)
    }

    // ========================================================================
    // Rules
    // ========================================================================

    /// Register a rule, generating its id when empty. Returns the id.
    pub fn add_rule(&self, mut rule: InvalidationRule) -> CacheResult<String> {
        if rule.id.trim().is_empty() {
            rule.id = Uuid::new_v4().to_string();
        }
        rule.validate()?;
        self.check_dependencies(&rule)?;

        let now = OffsetDateTime::now_utc();
        rule.created_at = now;
        rule.updated_at = now;
        let id = rule.id.clone();
        let name = rule.name.clone();
        match self.rules.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(CacheError::invalid_rule(&id, "a rule with this id already exists"));
            }
            Entry::Vacant(slot) => {
                slot.insert(rule);
            }
        }
        self.refresh_active_gauge();

        info!(rule_id = %id, rule_name = %name, "Invalidation rule added");
        self.notifier.publish(EventKind::RuleAdded {
            rule_id: id.clone(),
            name,
        });
        Ok(id)
    }

    pub fn remove_rule(&self, rule_id: &str) -> CacheResult<InvalidationRule> {
        let (_, rule) = self
            .rules
            .remove(rule_id)
            .ok_or_else(|| CacheError::RuleNotFound(rule_id.to_string()))?;
        mutex_lock(&self.next_due, SOURCE, "remove_rule").remove(rule_id);
        self.refresh_active_gauge();

        info!(rule_id = %rule_id, "Invalidation rule removed");
        self.notifier.publish(EventKind::RuleRemoved {
            rule_id: rule_id.to_string(),
        });
        Ok(rule)
    }

    /// Apply `update` and bump `updated_at`. Returns the updated rule.
    pub fn update_rule(&self, rule_id: &str, update: RuleUpdate) -> CacheResult<InvalidationRule> {
        let mut next = self
            .get_rule(rule_id)
            .ok_or_else(|| CacheError::RuleNotFound(rule_id.to_string()))?;
        update.apply_to(&mut next);
        next.validate()?;
        self.check_dependencies(&next)?;
        next.updated_at = OffsetDateTime::now_utc().max(next.created_at);

        match self.rules.get_mut(rule_id) {
            Some(mut slot) => *slot = next.clone(),
            None => return Err(CacheError::RuleNotFound(rule_id.to_string())),
        }
        mutex_lock(&self.next_due, SOURCE, "update_rule").remove(rule_id);
        self.refresh_active_gauge();

        info!(rule_id = %rule_id, enabled = next.enabled, "Invalidation rule updated");
        self.notifier.publish(EventKind::RuleUpdated {
            rule_id: rule_id.to_string(),
        });
        Ok(next)
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<InvalidationRule> {
        self.rules.get(rule_id).map(|rule| rule.value().clone())
    }

    /// Rules by descending priority, then name.
    pub fn get_all_rules(&self, enabled_only: bool) -> Vec<InvalidationRule> {
        let mut rules: Vec<InvalidationRule> = self
            .rules
            .iter()
            .filter(|rule| !enabled_only || rule.enabled)
            .map(|rule| rule.value().clone())
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        rules
    }

    /// Fire one rule, then any dependency-triggered rules waiting on it.
    ///
    /// A disabled rule, a false condition, or a missing/disabled dependency
    /// yields an unsuccessful result without touching the store.
    #[instrument(skip(self, context))]
    pub async fn invalidate_by_rule(
        &self,
        rule_id: &str,
        context: Option<&RuleContext>,
    ) -> CacheResult<InvalidationResult> {
        let rule = self
            .get_rule(rule_id)
            .ok_or_else(|| CacheError::RuleNotFound(rule_id.to_string()))?;
        if let Some(reason) = self.gate(&rule, context) {
            return Ok(self.skip(&rule, reason));
        }

        let mut result = self.fire(&rule).await?;
        if result.success {
            result.cascaded = self.cascade(&rule.id, context).await?;
        }
        Ok(result)
    }

    /// Fire every enabled event rule listening for `event`.
    pub async fn handle_event(
        &self,
        event: &str,
        context: Option<&RuleContext>,
    ) -> CacheResult<Vec<InvalidationResult>> {
        let rule_ids: Vec<String> = self
            .get_all_rules(true)
            .into_iter()
            .filter(|rule| rule.trigger == RuleTrigger::Event && rule.event.as_deref() == Some(event))
            .map(|rule| rule.id)
            .collect();
        debug!(event, matched = rule_ids.len(), "Handling invalidation event");
        self.fire_all(&rule_ids, context).await
    }

    /// Fire every enabled conditional rule whose condition holds for `context`.
    pub async fn evaluate_conditional(
        &self,
        context: Option<&RuleContext>,
    ) -> CacheResult<Vec<InvalidationResult>> {
        let rule_ids: Vec<String> = self
            .get_all_rules(true)
            .into_iter()
            .filter(|rule| {
                rule.trigger == RuleTrigger::Conditional
                    && rule
                        .condition
                        .as_ref()
                        .is_none_or(|condition| condition.evaluate(context))
            })
            .map(|rule| rule.id)
            .collect();
        self.fire_all(&rule_ids, context).await
    }

    /// Fire scheduled rules whose period has elapsed.
    ///
    /// A rule first becomes due one period after the scheduler first sees it.
    pub async fn run_due_rules(&self) -> CacheResult<Vec<InvalidationResult>> {
        let now = Instant::now();
        let scheduled: Vec<InvalidationRule> = self
            .get_all_rules(true)
            .into_iter()
            .filter(|rule| rule.trigger == RuleTrigger::Scheduled)
            .collect();

        let due: Vec<String> = {
            let mut next_due = mutex_lock(&self.next_due, SOURCE, "run_due_rules");
            next_due.retain(|id, _| scheduled.iter().any(|rule| &rule.id == id));
            scheduled
                .iter()
                .filter_map(|rule| {
                    // Periods past the clock's range never come due.
                    let next = now.checked_add(rule.schedule?)?;
                    let slot = next_due.entry(rule.id.clone()).or_insert(next);
                    if *slot <= now {
                        *slot = next;
                        Some(rule.id.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };

        self.fire_all(&due, None).await
    }

    /// Spawn the scheduled-rule loop.
    pub fn start_scheduler(self: &Arc<Self>) -> BackgroundTask {
        let engine = Arc::downgrade(self);
        BackgroundTask::spawn("invalidation-scheduler", self.config.scheduler_tick(), move || {
            let engine = engine.clone();
            async move {
                let Some(engine) = engine.upgrade() else {
                    return ControlFlow::Break(());
                };
                if let Err(err) = engine.run_due_rules().await {
                    warn!(error = %err, "Scheduled invalidation skipped");
                }
                ControlFlow::Continue(())
            }
        })
    }

    /// Spawn the periodic stats monitor, if configured.
    pub fn start_monitor(self: &Arc<Self>) -> Option<BackgroundTask> {
        let period = self.config.monitor_interval()?;
        let engine = Arc::downgrade(self);
        Some(BackgroundTask::spawn("invalidation-monitor", period, move || {
            let engine = engine.clone();
            async move {
                let Some(engine) = engine.upgrade() else {
                    return ControlFlow::Break(());
                };
                engine.report_stats();
                ControlFlow::Continue(())
            }
        }))
    }

    pub fn get_stats(&self) -> InvalidationStats {
        let active_rules = self.active_rule_count();
        let state = mutex_lock(&self.stats, SOURCE, "get_stats");
        InvalidationStats {
            total_invalidations: state.total,
            successful_invalidations: state.successful,
            failed_invalidations: state.failed,
            average_execution_time_ms: if state.total == 0 {
                0.0
            } else {
                state.total_time_ms / state.total as f64
            },
            total_keys_invalidated: state.total_keys,
            active_rules,
            strategy_usage: state.strategy_usage.clone(),
            last_invalidation: state.last_invalidation,
        }
    }

    pub fn reset_stats(&self) {
        *mutex_lock(&self.stats, SOURCE, "reset_stats") = StatsState::default();
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn gate(&self, rule: &InvalidationRule, context: Option<&RuleContext>) -> Option<String> {
        if !rule.enabled {
            return Some("Rule is disabled".to_string());
        }
        if let Some(condition) = &rule.condition {
            if !condition.evaluate(context) {
                return Some("Rule condition not met".to_string());
            }
        }
        for dependency in &rule.dependencies {
            match self.rules.get(dependency) {
                None => return Some(format!("Dependency rule `{dependency}` not found")),
                Some(dep) if !dep.enabled => {
                    return Some(format!("Dependency rule `{dependency}` is disabled"));
                }
                Some(_) => {}
            }
        }
        None
    }

    fn skip(&self, rule: &InvalidationRule, reason: String) -> InvalidationResult {
        info!(rule_id = %rule.id, reason = %reason, "Invalidation rule skipped");
        self.notifier.publish(EventKind::RuleSkipped {
            rule_id: rule.id.clone(),
            reason: reason.clone(),
        });
        InvalidationResult::skipped(rule, reason)
    }

    async fn fire(&self, rule: &InvalidationRule) -> CacheResult<InvalidationResult> {
        let options = InvalidationOptions {
            batch_size: None,
            reason: Some(format!("rule {}", rule.name)),
        };
        let mut result = self
            .invalidate(rule.patterns.clone(), rule.strategy, options)
            .await?;
        result.rule_id = Some(rule.id.clone());
        Ok(result)
    }

    /// Breadth-first over dependency-triggered rules; each fires at most once.
    async fn cascade(
        &self,
        root: &str,
        context: Option<&RuleContext>,
    ) -> CacheResult<Vec<String>> {
        let mut fired = Vec::new();
        let mut visited = HashSet::from([root.to_string()]);
        let mut queue = VecDeque::from([root.to_string()]);

        while let Some(parent) = queue.pop_front() {
            let dependents: Vec<InvalidationRule> = self
                .get_all_rules(true)
                .into_iter()
                .filter(|rule| {
                    rule.trigger == RuleTrigger::Dependency && rule.dependencies.contains(&parent)
                })
                .collect();

            for rule in dependents {
                if !visited.insert(rule.id.clone()) {
                    continue;
                }
                if let Some(reason) = self.gate(&rule, context) {
                    self.skip(&rule, reason);
                    continue;
                }
                let result = self.fire(&rule).await?;
                if result.success {
                    debug!(parent = %parent, rule_id = %rule.id, "Dependent rule fired");
                    fired.push(rule.id.clone());
                    queue.push_back(rule.id);
                }
            }
        }
        Ok(fired)
    }

    async fn fire_all(
        &self,
        rule_ids: &[String],
        context: Option<&RuleContext>,
    ) -> CacheResult<Vec<InvalidationResult>> {
        let mut results = Vec::with_capacity(rule_ids.len());
        for rule_id in rule_ids {
            match self.invalidate_by_rule(rule_id, context).await {
                Ok(result) => results.push(result),
                // Removed between listing and firing.
                Err(CacheError::RuleNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(results)
    }

    fn check_dependencies(&self, rule: &InvalidationRule) -> CacheResult<()> {
        let mut edges: HashMap<String, Vec<String>> = self
            .rules
            .iter()
            .map(|existing| (existing.key().clone(), existing.dependencies.clone()))
            .collect();
        edges.insert(rule.id.clone(), rule.dependencies.clone());
        detect_cycle(&rule.id, &edges)
    }

    fn record(&self, result: &InvalidationResult) {
        let mut state = mutex_lock(&self.stats, SOURCE, "record");
        state.total += 1;
        if result.success {
            state.successful += 1;
        } else {
            state.failed += 1;
        }
        state.total_time_ms += result.execution_time_ms;
        state.total_keys += result.invalidated_keys as u64;
        *state
            .strategy_usage
            .entry(result.strategy.to_string())
            .or_insert(0) += 1;
        state.last_invalidation = Some(result.timestamp);
    }

    fn active_rule_count(&self) -> usize {
        self.rules.iter().filter(|rule| rule.enabled).count()
    }

    fn refresh_active_gauge(&self) {
        gauge!("tiercache_active_rules").set(self.active_rule_count() as f64);
    }

    fn report_stats(&self) {
        let stats = self.get_stats();
        gauge!("tiercache_active_rules").set(stats.active_rules as f64);
        info!(
            total = stats.total_invalidations,
            successful = stats.successful_invalidations,
            failed = stats.failed_invalidations,
            average_ms = stats.average_execution_time_ms,
            keys = stats.total_keys_invalidated,
            active_rules = stats.active_rules,
            "Invalidation stats"
        );
        self.notifier.publish(EventKind::InvalidationStats {
            total: stats.total_invalidations,
            successful: stats.successful_invalidations,
            failed: stats.failed_invalidations,
            active_rules: stats.active_rules,
            average_time_ms: stats.average_execution_time_ms,
        });
    }
}

async fn execute<V: CacheValueType>(
    store: &dyn CacheStore<V>,
    plan: &InvalidationPlan,
) -> Outcome {
    let mut outcome = Outcome::default();

    for step in &plan.steps {
        match step {
            PlanStep::Delete(keys) => {
                for key in keys {
                    outcome.attempted += 1;
                    match store.delete(key).await {
                        Ok(true) => outcome.keys += 1,
                        Ok(false) => {}
                        Err(err) => outcome.fail(format!("delete `{key}`: {err}")),
                    }
                }
            }
            PlanStep::ClearNamespace(namespace) => {
                outcome.attempted += 1;
                match store.clear(Some(namespace)).await {
                    Ok(true) => outcome.namespaces += 1,
                    Ok(false) => {
                        outcome.fail(format!("clear of namespace `{namespace}` was not accepted"))
                    }
                    Err(err) => outcome.fail(format!("clear `{namespace}`: {err}")),
                }
            }
            PlanStep::InvalidateTags(tags) => {
                outcome.attempted += 1;
                match store.invalidate_tags(tags).await {
                    Ok(removed) => {
                        outcome.tags += tags.len();
                        outcome.keys += removed;
                    }
                    Err(err) => outcome.fail(format!("invalidate tags: {err}")),
                }
            }
            PlanStep::Enumerate(pattern) => {
                outcome.attempted += 1;
                match store.list_keys(pattern).await {
                    Ok(None) => outcome.notes.push(format!(
                        "store `{}` cannot enumerate keys; {pattern} invalidated nothing",
                        store.name()
                    )),
                    Ok(Some(keys)) => {
                        for key in keys {
                            outcome.attempted += 1;
                            match store.delete(&key).await {
                                Ok(true) => outcome.keys += 1,
                                Ok(false) => {}
                                Err(err) => outcome.fail(format!("delete `{key}`: {err}")),
                            }
                        }
                    }
                    Err(err) => outcome.fail(format!("list keys for {pattern}: {err}")),
                }
            }
        }
    }

    for rejected in &plan.rejected {
        outcome.attempted += 1;
        outcome.fail(rejected.clone());
    }
    outcome
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::cache::config::StoreConfig;
    use crate::cache::events::{EventQueue, NoopNotifier};
    use crate::cache::invalidation::rules::RuleCondition;
    use crate::cache::keys::{CacheKey, KeyOptions};
    use crate::cache::memory::MemoryStore;
    use crate::cache::types::{CacheHealth, CacheStats, SetOptions};

    /// Memory store without key enumeration that counts calls and can fail.
    struct OpaqueStore {
        inner: MemoryStore<String>,
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    impl OpaqueStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(StoreConfig::named("opaque"), Arc::new(NoopNotifier)),
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            }
        }

        fn touch(&self) -> CacheResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(CacheError::store("opaque", "scripted failure"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CacheStore<String> for OpaqueStore {
        fn name(&self) -> &str {
            "opaque"
        }

        async fn get(&self, key: &CacheKey) -> CacheResult<Option<String>> {
            self.touch()?;
            self.inner.get(key).await
        }

        async fn set(&self, key: &CacheKey, value: String, options: SetOptions) -> CacheResult<bool> {
            self.touch()?;
            self.inner.set(key, value, options).await
        }

        async fn delete(&self, key: &CacheKey) -> CacheResult<bool> {
            self.touch()?;
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &CacheKey) -> CacheResult<bool> {
            self.touch()?;
            self.inner.exists(key).await
        }

        async fn clear(&self, namespace: Option<&str>) -> CacheResult<bool> {
            self.touch()?;
            self.inner.clear(namespace).await
        }

        async fn stats(&self) -> CacheStats {
            self.inner.stats().await
        }

        async fn health(&self) -> CacheHealth {
            self.inner.health().await
        }

        async fn reset_stats(&self) {
            self.inner.reset_stats().await
        }
    }

    fn memory() -> Arc<MemoryStore<String>> {
        Arc::new(MemoryStore::new(
            StoreConfig::named("memory").with_max_size(100),
            Arc::new(NoopNotifier),
        ))
    }

    fn engine_with(store: Arc<dyn CacheStore<String>>) -> InvalidationEngine<String> {
        let engine = InvalidationEngine::<String>::new(InvalidationConfig::default(), Arc::new(NoopNotifier));
        engine.bind_store(store);
        engine
    }

    fn ns_key(namespace: &str, name: &str) -> CacheKey {
        CacheKey::new(name, &KeyOptions::new().namespace(namespace)).expect("valid key")
    }

    async fn seed(store: &MemoryStore<String>, keys: &[CacheKey]) {
        for key in keys {
            store
                .set(key, key.to_canonical(), SetOptions::default())
                .await
                .expect("set");
        }
    }

    fn context(value: serde_json::Value) -> RuleContext {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn namespace_rule(name: &str, namespace: &str) -> InvalidationRule {
        InvalidationRule::new(name, InvalidationStrategy::Namespace, vec![namespace.to_string()])
    }

    #[tokio::test]
    async fn namespace_invalidation_removes_only_that_namespace() {
        let store = memory();
        let (a, b, c) = (ns_key("ns1", "a"), ns_key("ns1", "b"), ns_key("ns2", "c"));
        seed(&store, &[a.clone(), b.clone(), c.clone()]).await;
        let engine = engine_with(store.clone());

        let result = engine
            .invalidate("ns1", InvalidationStrategy::Namespace, InvalidationOptions::default())
            .await
            .expect("invalidate");

        assert!(result.success);
        assert_eq!(result.invalidated_namespaces, 1);
        assert!(store.peek(&a).is_none());
        assert!(store.peek(&b).is_none());
        assert!(store.peek(&c).is_some());
    }

    #[tokio::test]
    async fn exact_invalidation_ignores_missing_keys() {
        let store = memory();
        let present = ns_key("app", "present");
        seed(&store, &[present.clone()]).await;
        let engine = engine_with(store.clone());

        let result = engine
            .invalidate(
                ["app:present", "app:missing"],
                InvalidationStrategy::Exact,
                InvalidationOptions::default(),
            )
            .await
            .expect("invalidate");

        assert!(result.success);
        assert_eq!(result.invalidated_keys, 1);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn batch_invalidation_uses_requested_chunks() {
        let store = memory();
        let keys: Vec<CacheKey> = (0..5).map(|i| ns_key("batch", &format!("k{i}"))).collect();
        seed(&store, &keys).await;
        let engine = engine_with(store.clone());

        let targets: Vec<String> = keys.iter().map(CacheKey::to_canonical).collect();
        let result = engine
            .invalidate(
                targets,
                InvalidationStrategy::Batch,
                InvalidationOptions {
                    batch_size: NonZeroUsize::new(2),
                    reason: Some("test".to_string()),
                },
            )
            .await
            .expect("invalidate");

        assert_eq!(result.invalidated_keys, 5);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn tag_invalidation_counts_tags_and_keys() {
        let store = memory();
        let engine = engine_with(store.clone());
        store
            .set(&ns_key("app", "a"), "a".to_string(), SetOptions::default().tag("hot"))
            .await
            .expect("set");
        store
            .set(&ns_key("app", "b"), "b".to_string(), SetOptions::default())
            .await
            .expect("set");

        let result = engine
            .invalidate(["hot", "cold"], InvalidationStrategy::Tag, InvalidationOptions::default())
            .await
            .expect("invalidate");

        assert_eq!(result.invalidated_tags, 2);
        assert_eq!(result.invalidated_keys, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn pattern_strategies_enumerate_keys() {
        let store = memory();
        seed(
            &store,
            &[
                ns_key("users", "1_profile"),
                ns_key("users", "2_profile"),
                ns_key("users", "2_settings"),
                ns_key("orders", "9"),
            ],
        )
        .await;
        let engine = engine_with(store.clone());

        let suffix = engine
            .invalidate("_profile", InvalidationStrategy::Suffix, InvalidationOptions::default())
            .await
            .expect("suffix");
        assert_eq!(suffix.invalidated_keys, 2);

        let wildcard = engine
            .invalidate("users:*", InvalidationStrategy::Wildcard, InvalidationOptions::default())
            .await
            .expect("wildcard");
        assert_eq!(wildcard.invalidated_keys, 1);

        let regex = engine
            .invalidate(r"^orders:\d+$", InvalidationStrategy::Regex, InvalidationOptions::default())
            .await
            .expect("regex");
        assert_eq!(regex.invalidated_keys, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn non_enumerable_store_reports_a_note() {
        let engine = engine_with(Arc::new(OpaqueStore::new()));

        let result = engine
            .invalidate("users:*", InvalidationStrategy::Wildcard, InvalidationOptions::default())
            .await
            .expect("invalidate");

        assert!(result.success);
        assert_eq!(result.invalidated_keys, 0);
        assert_eq!(result.notes.len(), 1);
        assert!(result.notes[0].contains("cannot enumerate"));
    }

    #[tokio::test]
    async fn invalid_regex_fails_the_result() {
        let engine = engine_with(memory());

        let result = engine
            .invalidate(["(", "^ok$"], InvalidationStrategy::Regex, InvalidationOptions::default())
            .await
            .expect("invalidate");

        assert!(!result.success);
        assert!(result.error.as_deref().is_some_and(|e| e.starts_with("1 of 2")));
        assert_eq!(engine.get_stats().failed_invalidations, 1);
    }

    #[tokio::test]
    async fn store_failures_are_reported_not_raised() {
        let store = Arc::new(OpaqueStore::new());
        store.failing.store(true, Ordering::SeqCst);
        let queue = Arc::new(EventQueue::new(NonZeroUsize::new(16).expect("non-zero")));
        let engine = InvalidationEngine::<String>::new(InvalidationConfig::default(), queue.clone());
        engine.bind_store(store);

        let result = engine
            .invalidate("ns1", InvalidationStrategy::Namespace, InvalidationOptions::default())
            .await
            .expect("invalidate");

        assert!(!result.success);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("scripted failure")));
        let names: Vec<_> = queue.drain(16).iter().map(|event| event.name()).collect();
        assert!(names.contains(&"invalidation.failed"));
    }

    #[tokio::test]
    async fn unbound_engine_refuses_to_invalidate() {
        let engine: InvalidationEngine<String> =
            InvalidationEngine::<String>::new(InvalidationConfig::default(), Arc::new(NoopNotifier));
        assert!(!engine.has_store());

        let err = engine
            .invalidate("ns1", InvalidationStrategy::Namespace, InvalidationOptions::default())
            .await
            .expect_err("no store");
        assert_eq!(err, CacheError::NoStoreBound);
    }

    #[tokio::test]
    async fn add_rule_generates_id_and_rejects_cycles() {
        let engine = engine_with(memory());

        let first = engine.add_rule(namespace_rule("first", "ns1")).expect("add");
        assert!(Uuid::parse_str(&first).is_ok());

        let second = engine
            .add_rule(namespace_rule("second", "ns2").with_id("second").depends_on(first.clone()))
            .expect("add");

        let cycle = engine.update_rule(&first, RuleUpdate {
            dependencies: Some(vec![second.clone()]),
            ..RuleUpdate::default()
        });
        assert!(matches!(cycle, Err(CacheError::InvalidRule { .. })));

        let duplicate = engine.add_rule(namespace_rule("again", "ns3").with_id("second"));
        assert!(matches!(duplicate, Err(CacheError::InvalidRule { .. })));
    }

    #[tokio::test]
    async fn concurrent_adds_with_one_id_keep_the_first_rule() {
        let engine = engine_with(memory());
        let barrier = std::sync::Barrier::new(8);

        let outcomes: Vec<CacheResult<String>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|n| {
                    let (engine, barrier) = (&engine, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        engine.add_rule(
                            namespace_rule(&format!("racer-{n}"), "ns1").with_id("shared"),
                        )
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("thread"))
                .collect()
        });

        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert_eq!(engine.get_all_rules(false).len(), 1);
        assert_eq!(engine.get_stats().active_rules, 1);
    }

    #[tokio::test]
    async fn update_and_remove_rules() {
        let engine = engine_with(memory());
        let id = engine.add_rule(namespace_rule("rule", "ns1")).expect("add");
        let created = engine.get_rule(&id).expect("rule");

        let updated = engine.update_rule(&id, RuleUpdate::enabled(false)).expect("update");
        assert!(!updated.enabled);
        assert!(updated.updated_at >= created.updated_at);
        assert_eq!(engine.get_stats().active_rules, 0);

        engine.remove_rule(&id).expect("remove");
        assert!(engine.get_rule(&id).is_none());
        assert_eq!(
            engine.remove_rule(&id).expect_err("gone"),
            CacheError::RuleNotFound(id.clone())
        );
        assert!(matches!(
            engine.update_rule(&id, RuleUpdate::enabled(true)),
            Err(CacheError::RuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rules_are_listed_by_priority_then_name() {
        let engine = engine_with(memory());
        engine.add_rule(namespace_rule("b", "ns").priority(1)).expect("add");
        engine.add_rule(namespace_rule("a", "ns").priority(1)).expect("add");
        engine.add_rule(namespace_rule("top", "ns").priority(9)).expect("add");
        engine.add_rule(namespace_rule("off", "ns").priority(5).disabled()).expect("add");

        let names: Vec<_> = engine.get_all_rules(false).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["top", "off", "a", "b"]);

        let enabled: Vec<_> = engine.get_all_rules(true).into_iter().map(|r| r.name).collect();
        assert_eq!(enabled, vec!["top", "a", "b"]);
    }

    #[tokio::test]
    async fn disabled_rule_never_touches_the_store() {
        let store = Arc::new(OpaqueStore::new());
        let engine = engine_with(store.clone());
        let id = engine.add_rule(namespace_rule("off", "ns1").disabled()).expect("add");

        let result = engine.invalidate_by_rule(&id, None).await.expect("by rule");

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Rule is disabled"));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.get_stats().total_invalidations, 0);
    }

    #[tokio::test]
    async fn rule_conditions_and_dependencies_gate_execution() {
        let engine = engine_with(memory());
        let guarded = engine
            .add_rule(namespace_rule("guarded", "ns1").when(RuleCondition::equals("env", "prod")))
            .expect("add");

        let skipped = engine
            .invalidate_by_rule(&guarded, Some(&context(json!({"env": "dev"}))))
            .await
            .expect("by rule");
        assert_eq!(skipped.error.as_deref(), Some("Rule condition not met"));

        let fired = engine
            .invalidate_by_rule(&guarded, Some(&context(json!({"env": "prod"}))))
            .await
            .expect("by rule");
        assert!(fired.success);
        assert_eq!(fired.rule_id.as_deref(), Some(guarded.as_str()));

        let parent = engine
            .add_rule(namespace_rule("parent", "ns2").disabled())
            .expect("add");
        let child = engine
            .add_rule(namespace_rule("child", "ns3").depends_on(parent.clone()))
            .expect("add");
        let blocked = engine.invalidate_by_rule(&child, None).await.expect("by rule");
        assert!(blocked.error.as_deref().is_some_and(|e| e.contains("is disabled")));

        engine.remove_rule(&parent).expect("remove");
        let orphaned = engine.invalidate_by_rule(&child, None).await.expect("by rule");
        assert!(orphaned.error.as_deref().is_some_and(|e| e.contains("not found")));

        assert!(matches!(
            engine.invalidate_by_rule("nope", None).await,
            Err(CacheError::RuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn dependency_rules_cascade_once() {
        let store = memory();
        seed(&store, &[ns_key("a", "1"), ns_key("b", "1"), ns_key("c", "1")]).await;
        let engine = engine_with(store.clone());

        let root = engine.add_rule(namespace_rule("root", "a").with_id("root")).expect("add");
        engine
            .add_rule(namespace_rule("mid", "b").with_id("mid").after("root"))
            .expect("add");
        engine
            .add_rule(
                namespace_rule("leaf", "c")
                    .with_id("leaf")
                    .after("mid")
                    .depends_on("root"),
            )
            .expect("add");

        let result = engine.invalidate_by_rule(&root, None).await.expect("by rule");

        assert!(result.success);
        assert_eq!(result.cascaded.len(), 2);
        assert!(result.cascaded.contains(&"mid".to_string()));
        assert!(result.cascaded.contains(&"leaf".to_string()));
        assert!(store.is_empty());
        assert_eq!(engine.get_stats().total_invalidations, 3);
    }

    #[tokio::test]
    async fn events_fire_matching_rules() {
        let store = memory();
        seed(&store, &[ns_key("users", "1"), ns_key("orders", "1")]).await;
        let engine = engine_with(store.clone());
        engine
            .add_rule(namespace_rule("on-user", "users").on_event("user.updated"))
            .expect("add");
        engine
            .add_rule(namespace_rule("on-order", "orders").on_event("order.updated"))
            .expect("add");

        let results = engine.handle_event("user.updated", None).await.expect("event");

        assert_eq!(results.len(), 1);
        assert!(store.peek(&ns_key("users", "1")).is_none());
        assert!(store.peek(&ns_key("orders", "1")).is_some());
        assert!(engine.handle_event("unknown", None).await.expect("event").is_empty());
    }

    #[tokio::test]
    async fn conditional_rules_fire_when_condition_holds() {
        let engine = engine_with(memory());
        engine
            .add_rule(
                namespace_rule("low-memory", "ns1")
                    .conditional(RuleCondition::equals("memory.pressure", "high")),
            )
            .expect("add");

        let calm = engine
            .evaluate_conditional(Some(&context(json!({"memory": {"pressure": "low"}}))))
            .await
            .expect("conditional");
        assert!(calm.is_empty());

        let pressured = engine
            .evaluate_conditional(Some(&context(json!({"memory": {"pressure": "high"}}))))
            .await
            .expect("conditional");
        assert_eq!(pressured.len(), 1);
        assert!(pressured[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_rules_fire_after_their_period() {
        let engine = engine_with(memory());
        engine
            .add_rule(namespace_rule("hourly", "ns1").every(Duration::from_secs(60)))
            .expect("add");

        assert!(engine.run_due_rules().await.expect("run").is_empty());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(engine.run_due_rules().await.expect("run").is_empty());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(engine.run_due_rules().await.expect("run").len(), 1);
        assert!(engine.run_due_rules().await.expect("run").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_schedule_never_fires() {
        let engine = engine_with(memory());
        engine
            .add_rule(namespace_rule("never", "ns1").every(Duration::MAX))
            .expect("add");

        assert!(engine.run_due_rules().await.expect("run").is_empty());
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(engine.run_due_rules().await.expect("run").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_task_drives_scheduled_rules() {
        let config = InvalidationConfig {
            scheduler_tick_ms: 1000,
            ..InvalidationConfig::default()
        };
        let engine = Arc::new(InvalidationEngine::<String>::new(config, Arc::new(NoopNotifier)));
        engine.bind_store(memory());
        engine
            .add_rule(namespace_rule("tick", "ns1").every(Duration::from_secs(2)))
            .expect("add");

        let task = engine.start_scheduler();
        tokio::time::sleep(Duration::from_millis(5500)).await;
        task.stop().await;

        assert!(engine.get_stats().total_invalidations >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_publishes_stats() {
        let queue = Arc::new(EventQueue::new(NonZeroUsize::new(16).expect("non-zero")));
        let config = InvalidationConfig {
            monitor_interval_ms: 1000,
            ..InvalidationConfig::default()
        };
        let engine = Arc::new(InvalidationEngine::<String>::new(config, queue.clone()));

        let task = engine.start_monitor().expect("monitor configured");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        task.stop().await;

        let names: Vec<_> = queue.drain(16).iter().map(|event| event.name()).collect();
        assert!(names.contains(&"invalidation.stats"));
    }

    #[tokio::test]
    async fn stats_track_outcomes_and_reset() {
        let engine = engine_with(memory());
        engine
            .invalidate("ns1", InvalidationStrategy::Namespace, InvalidationOptions::default())
            .await
            .expect("invalidate");
        engine
            .invalidate("(", InvalidationStrategy::Regex, InvalidationOptions::default())
            .await
            .expect("invalidate");

        let stats = engine.get_stats();
        assert_eq!(stats.total_invalidations, 2);
        assert_eq!(stats.successful_invalidations, 1);
        assert_eq!(stats.failed_invalidations, 1);
        assert_eq!(stats.strategy_usage.get("namespace"), Some(&1));
        assert_eq!(stats.strategy_usage.get("regex"), Some(&1));
        assert!(stats.last_invalidation.is_some());

        engine.reset_stats();
        let stats = engine.get_stats();
        assert_eq!(stats.total_invalidations, 0);
        assert_eq!(stats.average_execution_time_ms, 0.0);
    }

    #[test]
    fn no_monitor_without_interval() {
        let engine = Arc::new(InvalidationEngine::<String>::new(
            InvalidationConfig::default(),
            Arc::new(NoopNotifier),
        ));
        assert!(engine.start_monitor().is_none());
    }

    #[test]
    fn targets_accept_many_shapes() {
        assert_eq!(Targets::from("a"), Targets::from(vec!["a".to_string()]));
        assert_eq!(Targets::from(vec!["a", "b"]).as_slice().len(), 2);
        assert_eq!(Targets::from(["a", "b", "c"]).as_slice().len(), 3);
        let owned = vec!["x".to_string()];
        assert_eq!(Targets::from(owned.as_slice()), Targets::from(owned));
    }
}
