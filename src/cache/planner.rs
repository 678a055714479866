//! Invalidation plan generation.
//!
//! Turns raw targets and a strategy into the concrete store operations the
//! engine executes. Planning is pure; nothing here touches a store.

use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroUsize;

use tracing::debug;

use super::invalidation::InvalidationStrategy;
use super::keys::{CacheKey, KeyPattern, sanitize_key, sanitize_tags};

/// One store-level operation.
#[derive(Debug, Clone)]
pub enum PlanStep {
    /// Delete each key. One step per batch.
    Delete(Vec<CacheKey>),
    /// `clear(Some(namespace))`.
    ClearNamespace(String),
    /// `invalidate_tags(tags)`.
    InvalidateTags(Vec<String>),
    /// `list_keys(pattern)` then delete what it returns.
    Enumerate(KeyPattern),
}

/// Operations for one `invalidate` call.
#[derive(Debug)]
pub struct InvalidationPlan {
    pub strategy: InvalidationStrategy,
    pub steps: Vec<PlanStep>,
    /// Targets that could not be turned into an operation.
    pub rejected: Vec<String>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (mut keys, mut namespaces, mut tags, mut patterns) = (0, 0, 0, 0);
        for step in &self.steps {
            match step {
                PlanStep::Delete(batch) => keys += batch.len(),
                PlanStep::ClearNamespace(_) => namespaces += 1,
                PlanStep::InvalidateTags(t) => tags += t.len(),
                PlanStep::Enumerate(_) => patterns += 1,
            }
        }
        write!(
            f,
            "InvalidationPlan {{ strategy: {}, steps: {}, keys: {keys}, namespaces: {namespaces}, \
             tags: {tags}, patterns: {patterns}, rejected: {} }}",
            self.strategy,
            self.steps.len(),
            self.rejected.len(),
        )
    }
}

impl InvalidationPlan {
    /// Build the plan.
    ///
    /// - Trims targets, drops blanks and duplicates (first occurrence wins)
    /// - Exact and batch targets that do not parse as keys are skipped
    /// - Invalid regular expressions are recorded in `rejected`
    pub fn from_targets(
        targets: &[String],
        strategy: InvalidationStrategy,
        batch_size: NonZeroUsize,
    ) -> Self {
        let mut seen = HashSet::new();
        let targets: Vec<&str> = targets
            .iter()
            .map(|target| target.trim())
            .filter(|target| !target.is_empty() && seen.insert(*target))
            .collect();

        let mut plan = Self {
            strategy,
            steps: Vec::new(),
            rejected: Vec::new(),
        };

        match strategy {
            InvalidationStrategy::Exact => {
                let keys = parse_keys(&targets);
                if !keys.is_empty() {
                    plan.steps.push(PlanStep::Delete(keys));
                }
            }
            InvalidationStrategy::Batch => {
                let keys = parse_keys(&targets);
                plan.steps.extend(
                    keys.chunks(batch_size.get())
                        .map(|chunk| PlanStep::Delete(chunk.to_vec())),
                );
            }
            InvalidationStrategy::Prefix | InvalidationStrategy::Namespace => {
                let mut namespaces = HashSet::new();
                for target in &targets {
                    let namespace = sanitize_key(target);
                    if namespaces.insert(namespace.clone()) {
                        plan.steps.push(PlanStep::ClearNamespace(namespace));
                    }
                }
            }
            InvalidationStrategy::Tag => {
                let tags = sanitize_tags(&targets);
                if !tags.is_empty() {
                    plan.steps.push(PlanStep::InvalidateTags(tags));
                }
            }
            InvalidationStrategy::Wildcard => {
                plan.steps.extend(
                    targets
                        .iter()
                        .map(|target| PlanStep::Enumerate(KeyPattern::Glob(target.to_string()))),
                );
            }
            InvalidationStrategy::Suffix => {
                plan.steps.extend(
                    targets
                        .iter()
                        .map(|target| PlanStep::Enumerate(KeyPattern::Glob(format!("*{target}")))),
                );
            }
            InvalidationStrategy::Regex => {
                for target in &targets {
                    match KeyPattern::regex(target) {
                        Ok(pattern) => plan.steps.push(PlanStep::Enumerate(pattern)),
                        Err(err) => plan.rejected.push(err.to_string()),
                    }
                }
            }
        }

        debug!(plan = %plan, "Invalidation plan built");
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.rejected.is_empty()
    }
}

fn parse_keys(targets: &[&str]) -> Vec<CacheKey> {
    targets
        .iter()
        .filter_map(|target| match CacheKey::parse(target) {
            Ok(key) => Some(key),
            Err(err) => {
                debug!(target = %target, error = %err, "Skipping unparsable invalidation target");
                None
            }
        })
        .collect()
}
