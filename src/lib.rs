//! Worker-side runtime for distributed task orchestration.
//!
//! Receives actions from an orchestration engine, runs them under a bounded
//! slot model, supervises cancellation and reports lifecycle events back.

pub mod action;
pub mod cancellation;
pub mod config;
pub mod durable;
pub mod engine;
pub mod error;
pub mod health;
pub mod listener;
pub mod runner;
pub mod tasks;
pub mod worker;

pub use action::{Action, ActionEvent, ActionEventType, ActionKey, ActionType};
pub use cancellation::{CancellationReason, CancellationToken};
pub use config::WorkerConfig;
pub use error::{Error, Result, TaskError};
pub use runner::Context;
pub use tasks::{FnTask, Task, TaskOutput};
pub use worker::{Worker, WorkerHandle};
