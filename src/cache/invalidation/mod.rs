//! Rule-driven cache invalidation.

mod engine;
mod rules;

pub use engine::{
    InvalidationEngine, InvalidationOptions, InvalidationResult, InvalidationStats, Targets,
};
pub use rules::{
    InvalidationRule, InvalidationStrategy, RuleCondition, RuleContext, RuleTrigger, RuleUpdate,
};
