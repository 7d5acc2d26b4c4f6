//! Durable persistence behind async traits.
//!
//! The orchestrator core only sees [`JobStore`] and [`ManualStore`];
//! the libSQL backend is the one concrete implementation.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{JobEvent, JobInteraction, JobStore, ManualStore};
