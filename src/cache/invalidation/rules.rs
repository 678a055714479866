//! Invalidation rules, triggers and declarative conditions.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::error::{CacheError, CacheResult};

/// Caller-supplied facts a rule condition is evaluated against.
pub type RuleContext = Map<String, Value>;

/// How targets are resolved into store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationStrategy {
    /// Targets are canonical key strings, deleted one by one.
    Exact,
    /// Targets are namespaces, cleared through the store.
    Prefix,
    /// Targets are key suffixes; needs an enumerable store.
    Suffix,
    /// Targets are globs; needs an enumerable store.
    Wildcard,
    /// Targets are regular expressions; needs an enumerable store.
    Regex,
    /// Targets are tag names, cleared through the store.
    Tag,
    /// Targets are namespaces, cleared through the store.
    Namespace,
    /// Exact keys, processed in fixed-size chunks.
    Batch,
}

impl InvalidationStrategy {
    pub const ALL: [InvalidationStrategy; 8] = [
        Self::Exact,
        Self::Prefix,
        Self::Suffix,
        Self::Wildcard,
        Self::Regex,
        Self::Tag,
        Self::Namespace,
        Self::Batch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Prefix => "prefix",
            Self::Suffix => "suffix",
            Self::Wildcard => "wildcard",
            Self::Regex => "regex",
            Self::Tag => "tag",
            Self::Namespace => "namespace",
            Self::Batch => "batch",
        }
    }
}

impl fmt::Display for InvalidationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvalidationStrategy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == wanted)
            .ok_or(CacheError::UnsupportedStrategy(wanted))
    }
}

/// What makes a rule fire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTrigger {
    /// Only through `invalidate_by_rule`.
    #[default]
    Manual,
    /// Periodically, every `schedule`.
    Scheduled,
    /// When a named event is handled.
    Event,
    /// When `evaluate_conditional` finds the condition true.
    Conditional,
    /// After one of its dependencies fires successfully.
    Dependency,
}

/// Declarative predicate over a [`RuleContext`].
///
/// Field names may be dotted paths into nested objects (`user.role`).
/// Without a context every lookup is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RuleCondition {
    Always,
    Equals { field: String, value: Value },
    NotEquals { field: String, value: Value },
    Exists { field: String },
    All { conditions: Vec<RuleCondition> },
    Any { conditions: Vec<RuleCondition> },
    Not { condition: Box<RuleCondition> },
}

impl RuleCondition {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists {
            field: field.into(),
        }
    }

    pub fn evaluate(&self, context: Option<&RuleContext>) -> bool {
        match self {
            Self::Always => true,
            Self::Equals { field, value } => lookup(context, field) == Some(value),
            Self::NotEquals { field, value } => lookup(context, field) != Some(value),
            Self::Exists { field } => lookup(context, field).is_some_and(|v| !v.is_null()),
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(context)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(context)),
            Self::Not { condition } => !condition.evaluate(context),
        }
    }
}

fn lookup<'a>(context: Option<&'a RuleContext>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = context?.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// A named, declarative invalidation instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidationRule {
    /// Generated on `add_rule` when empty.
    pub id: String,
    pub name: String,
    pub strategy: InvalidationStrategy,
    /// Targets handed to `invalidate`.
    pub patterns: Vec<String>,
    pub trigger: RuleTrigger,
    pub enabled: bool,
    /// Higher fires first when several rules match.
    pub priority: i32,
    pub condition: Option<RuleCondition>,
    /// Rule ids that must exist and be enabled for this rule to fire.
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
    /// Period for scheduled rules.
    #[serde(with = "duration_ms")]
    pub schedule: Option<Duration>,
    /// Event name for event-triggered rules.
    pub event: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl InvalidationRule {
    pub fn new(
        name: impl Into<String>,
        strategy: InvalidationStrategy,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: String::new(),
            name: name.into(),
            strategy,
            patterns: patterns.into_iter().map(Into::into).collect(),
            trigger: RuleTrigger::Manual,
            enabled: true,
            priority: 0,
            condition: None,
            dependencies: Vec::new(),
            tags: Vec::new(),
            schedule: None,
            event: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn when(mut self, condition: RuleCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn conditional(mut self, condition: RuleCondition) -> Self {
        self.trigger = RuleTrigger::Conditional;
        self.condition = Some(condition);
        self
    }

    pub fn depends_on(mut self, rule_id: impl Into<String>) -> Self {
        self.dependencies.push(rule_id.into());
        self
    }

    /// Fire in cascade after `rule_id` fires.
    pub fn after(mut self, rule_id: impl Into<String>) -> Self {
        self.trigger = RuleTrigger::Dependency;
        self.dependencies.push(rule_id.into());
        self
    }

    pub fn every(mut self, period: Duration) -> Self {
        self.trigger = RuleTrigger::Scheduled;
        self.schedule = Some(period);
        self
    }

    pub fn on_event(mut self, event: impl Into<String>) -> Self {
        self.trigger = RuleTrigger::Event;
        self.event = Some(event.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Shape checks that do not depend on other rules.
    pub(crate) fn validate(&self) -> CacheResult<()> {
        if self.name.trim().is_empty() {
            return Err(CacheError::invalid_rule(&self.id, "name is empty"));
        }
        if self.patterns.is_empty() || self.patterns.iter().any(|p| p.trim().is_empty()) {
            return Err(CacheError::invalid_rule(
                &self.id,
                "patterns must be non-empty",
            ));
        }
        if self.dependencies.iter().any(|dep| dep == &self.id) {
            return Err(CacheError::invalid_rule(&self.id, "rule depends on itself"));
        }
        match self.trigger {
            RuleTrigger::Scheduled if self.schedule.is_none_or(|p| p.is_zero()) => Err(
                CacheError::invalid_rule(&self.id, "scheduled rule needs a non-zero schedule"),
            ),
            RuleTrigger::Event if self.event.as_deref().is_none_or(|e| e.trim().is_empty()) => {
                Err(CacheError::invalid_rule(&self.id, "event rule needs an event name"))
            }
            RuleTrigger::Dependency if self.dependencies.is_empty() => Err(
                CacheError::invalid_rule(&self.id, "dependency rule needs at least one dependency"),
            ),
            _ => Ok(()),
        }
    }
}

/// Partial update applied by `update_rule`. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub strategy: Option<InvalidationStrategy>,
    pub patterns: Option<Vec<String>>,
    pub trigger: Option<RuleTrigger>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
    pub condition: Option<Option<RuleCondition>>,
    pub dependencies: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub schedule: Option<Option<Duration>>,
    pub event: Option<Option<String>>,
}

impl RuleUpdate {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }

    pub(crate) fn apply_to(self, rule: &mut InvalidationRule) {
        if let Some(name) = self.name {
            rule.name = name;
        }
        if let Some(strategy) = self.strategy {
            rule.strategy = strategy;
        }
        if let Some(patterns) = self.patterns {
            rule.patterns = patterns;
        }
        if let Some(trigger) = self.trigger {
            rule.trigger = trigger;
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
        if let Some(priority) = self.priority {
            rule.priority = priority;
        }
        if let Some(condition) = self.condition {
            rule.condition = condition;
        }
        if let Some(dependencies) = self.dependencies {
            rule.dependencies = dependencies;
        }
        if let Some(tags) = self.tags {
            rule.tags = tags;
        }
        if let Some(schedule) = self.schedule {
            rule.schedule = schedule;
        }
        if let Some(event) = self.event {
            rule.event = event;
        }
    }
}

/// Fails when following `dependencies` edges from `start` leads back to it.
///
/// `edges` maps rule id to the ids it depends on. Unknown ids are leaves.
pub(crate) fn detect_cycle(start: &str, edges: &HashMap<String, Vec<String>>) -> CacheResult<()> {
    let mut stack: Vec<&str> = edges
        .get(start)
        .map(|deps| deps.iter().map(String::as_str).collect())
        .unwrap_or_default();
    let mut seen = HashSet::new();

    while let Some(current) = stack.pop() {
        if current == start {
            return Err(CacheError::invalid_rule(start, "dependency cycle detected"));
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(deps) = edges.get(current) {
            stack.extend(deps.iter().map(String::as_str));
        }
    }
    Ok(())
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }
}
