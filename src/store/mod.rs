//! Task persistence.
//!
//! A [`TaskStore`] keeps three documents per task: the conversation history sent to the
//! model, the display log shown to the caller, and the [`HistoryItem`] summary. Every write
//! replaces the whole document, so writing the same snapshot twice is harmless.

mod file;
mod memory;

pub use file::FileTaskStore;
pub use memory::InMemoryTaskStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::ApiMessage;
use crate::messages::DisplayMessage;
use crate::task::{HistoryItem, TaskId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to (de)serialize {what}: {source}")]
    Serialization {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    fn is_persistent(&self) -> bool;

    /// Conversation history of a task; empty when nothing was written yet.
    async fn read_history(&self, task_id: TaskId) -> Result<Vec<ApiMessage>, StoreError>;

    async fn write_history(&self, task_id: TaskId, messages: &[ApiMessage])
        -> Result<(), StoreError>;

    /// Display log of a task; empty when nothing was written yet.
    async fn read_display_messages(&self, task_id: TaskId)
        -> Result<Vec<DisplayMessage>, StoreError>;

    async fn write_display_messages(
        &self,
        task_id: TaskId,
        messages: &[DisplayMessage],
    ) -> Result<(), StoreError>;

    async fn get_history_item(&self, task_id: TaskId) -> Result<Option<HistoryItem>, StoreError>;

    async fn save_history_item(&self, item: &HistoryItem) -> Result<(), StoreError>;

    /// History items, most recently updated first.
    async fn list_history_items(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HistoryItem>, StoreError>;

    /// Remove every document of a task. Missing tasks are not an error.
    async fn delete_task(&self, task_id: TaskId) -> Result<(), StoreError>;
}

fn sort_and_page(mut items: Vec<HistoryItem>, limit: usize, offset: usize) -> Vec<HistoryItem> {
    items.sort_by(|a, b| b.updated_ts.cmp(&a.updated_ts));
    items.into_iter().skip(offset).take(limit).collect()
}
