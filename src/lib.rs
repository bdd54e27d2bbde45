//! autodev: drive a persisted feature backlog through AI coding-agent runs.
//!
//! The engine repeatedly selects the next unfinished work item from
//! `.autodev/features.json`, launches an agent subprocess for it, follows
//! the agent's line-delimited JSON output, and records the outcome back to
//! the file. External consumers go through [`api::Orchestrator`].

pub mod api;
pub mod authz;
pub mod cmd;
pub mod config;
pub mod errors;
pub mod events;
pub mod model;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod stream;
