//! Task module - one execution of the conversation loop.
//!
//! A [`Task`] owns a conversation history and a display log, talks to its caller through
//! ask/say messages, and reports lifecycle transitions to its owner over a typed channel.
//!
//! # Invariants
//! - History and display log only grow during normal operation; condensation replaces the
//!   history wholesale through one rewrite.
//! - The mode is resolved once, before the first request, and never changes afterwards.
//! - Within one task, requests are strictly sequential.

mod api_request;
mod context;
mod conversation;
mod environment;
mod error;
mod events;
mod resources;
mod retry;
#[allow(clippy::module_inception)]
mod task;
mod types;

pub use context::EngineContext;
pub use environment::EnvironmentDetails;
pub use error::TaskError;
pub use events::{AbortReason, EngineEvent, TaskEvent, TaskSignal};
pub use resources::{Disposable, TaskResources};
pub use retry::{backoff_delay, retry_delay, RequestPacer, MAX_BACKOFF_SECS};
pub use task::{RestoredState, Task, TaskExit, TaskOptions, TaskStart};
pub use types::{
    BackgroundContext, HistoryItem, HistoryStatus, InstanceId, Mode, ModeState, TaskId,
    TaskSource, ToolStats, ToolUsage,
};
