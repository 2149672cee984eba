//! Autonomous execution engine for multi-phase code generation.
//!
//! A persisted state token (`PLAN` → `IMPLEMENT` → `VERIFY` → `DONE`/`FAIL`)
//! drives one worker at a time. The crate is split the same way throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (queue ordering, plan and intent
//!   codecs, requirement deltas, budget arithmetic, policy analysis, path
//!   resolution). No I/O.
//! - **[`io`]**: Side-effecting operations (control documents, lease file,
//!   checkpoints, file transactions, git, the LLM subprocess).
//!
//! [`engine`] coordinates both: it watches the state store, queues
//! transitions, and runs the registered [`agents`] under the lease.

pub mod agents;
pub mod cancel;
pub mod chat;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod recovery;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
