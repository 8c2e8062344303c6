//! Configuration snapshot types
//!
//! Contains the immutable description consumed by the codecs, the policy
//! engine and the orchestrator.

mod config;

pub use config::{
    ActionKind, Combinator, Comparison, Config, DaemonAction, HintMode, HintRule, LoadCapture,
    PowerCondition, PowerLimitSpec, PowerTerm, Predicate, UndervoltTarget,
};
