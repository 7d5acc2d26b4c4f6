//! FormPilot: a job execution orchestrator for automated web-form
//! completion.
//!
//! Jobs move through a persisted lifecycle (pending, queued, running,
//! paused, and the terminal states) while an executor drives a browser
//! adapter against the target site. Execution is replay-first: a cached
//! step manual learned from an earlier successful run is tried before
//! falling back to model-driven form filling, and every successful
//! fallback run records a new manual. Blockers such as captchas pause the
//! job and escalate to a human, whose resolution payload is consumed
//! atomically and never kept at rest.

pub mod adapter;
pub mod blocker;
pub mod budget;
pub mod config;
pub mod cookbook;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod hitl;
pub mod job;
pub mod manual;
pub mod notify;
pub mod signal;
pub mod store;
pub mod worker;

pub use error::{Error, Result};
