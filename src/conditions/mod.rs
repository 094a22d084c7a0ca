//! Condition model and evaluation.

pub(crate) mod evaluator;
mod external;
mod guard;
mod types;

pub use evaluator::{ConditionEvaluator, MAX_GROUP_DEPTH};
pub use external::{evaluate_script, DefaultExternalChecks, ExternalChecks};
pub use guard::Guard;
pub use types::{Condition, ConditionGroup, ConditionKind, ConditionRef, Context, Logic, Operator};
