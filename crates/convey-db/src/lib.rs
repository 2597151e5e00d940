//! Catalog repository for the convey sync engine.
//!
//! Owns the persistent side of the engine: datasources, data interfaces,
//! sync tasks, per-run executions, and the (task, interface) join rows.
//! All access goes through the query functions in [`queries`]; status
//! changes go through the optimistic-locking transition functions so the
//! task state machine is enforced at the SQL layer.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
