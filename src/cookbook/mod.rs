//! Cookbook replay and learning: the cache half of the execution engine.

pub mod executor;
pub mod trace;

pub use executor::{CookbookExecutor, ReplayOutcome};
pub use trace::{TraceRecorder, TracedAction, url_pattern_for};
