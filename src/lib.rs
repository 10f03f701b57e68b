//! # task_engine
//!
//! Runs tool-using conversations with a language model and orchestrates them as nested tasks.
//!
//! A [`task::Task`] drives one conversation: it sends the history to a [`llm::ModelClient`],
//! parses tool invocations out of the streamed response, executes them and loops until the
//! model calls `attempt_completion`. Tasks can delegate to subtasks through `new_task`; the
//! [`manager::TaskEngine`] pauses the parent, runs the child and hands its result back.
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────────────┐
//!        │               TaskEngine                 │
//!        │  user stack (serial)   agent pool (||)   │
//!        └──────────┬───────────────────┬───────────┘
//!                   │ TaskSignal        │ TaskSignal
//!                   ▼                   ▼
//!              ┌─────────┐        ┌─────────┐
//!              │  Task   │  ...   │  Task   │
//!              └────┬────┘        └────┬────┘
//!                   │ ModelClient      │
//!                   ▼                  ▼
//!              streaming chat completions
//! ```
//!
//! ## Modules
//! - `task`: the conversation loop, ask/say, retries, abort and persistence
//! - `manager`: user stack, agent pool and lifecycle routing
//! - `llm`: model client trait, message types and the OpenRouter client
//! - `tools`: tool registry, XML tool-call parser and the built-in tools
//! - `messages`: the display log and ask/say vocabulary
//! - `store`: persisted history, display log and history records
//! - `condense`: context-window management
//! - `approval`, `checkpoint`, `cost`, `config`: supporting services

pub mod approval;
pub mod checkpoint;
pub mod condense;
pub mod config;
pub mod cost;
pub mod llm;
pub mod manager;
pub mod messages;
pub mod store;
pub mod task;
pub mod tools;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use manager::{EngineError, NewTaskRequest, TaskEngine};
pub use task::{EngineContext, Task, TaskId};
