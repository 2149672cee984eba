//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod intent;
pub mod ledger;
pub mod path;
pub mod plan;
pub mod policy;
pub mod queue;
pub mod trace;
pub mod types;
