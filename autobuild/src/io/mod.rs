//! Filesystem and subprocess side effects.

pub mod atomic;
pub mod audit;
pub mod budget;
pub mod checkpoint;
pub mod checks;
pub mod config;
pub mod context;
pub mod documents;
pub mod git;
pub mod init;
pub mod llm;
pub mod lock;
pub mod process;
pub mod prompt;
pub mod questions;
pub mod report;
pub mod state_store;
pub mod transaction;
