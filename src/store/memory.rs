//! In-memory task store for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{sort_and_page, StoreError, TaskStore};
use crate::llm::ApiMessage;
use crate::messages::DisplayMessage;
use crate::task::{HistoryItem, TaskId};

#[derive(Default)]
struct TaskDocuments {
    history: Vec<ApiMessage>,
    display: Vec<DisplayMessage>,
    item: Option<HistoryItem>,
}

#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<TaskId, TaskDocuments>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn read_history(&self, task_id: TaskId) -> Result<Vec<ApiMessage>, StoreError> {
        Ok(self
            .tasks
            .read()
            .await
            .get(&task_id)
            .map(|docs| docs.history.clone())
            .unwrap_or_default())
    }

    async fn write_history(
        &self,
        task_id: TaskId,
        messages: &[ApiMessage],
    ) -> Result<(), StoreError> {
        self.tasks.write().await.entry(task_id).or_default().history = messages.to_vec();
        Ok(())
    }

    async fn read_display_messages(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<DisplayMessage>, StoreError> {
        Ok(self
            .tasks
            .read()
            .await
            .get(&task_id)
            .map(|docs| docs.display.clone())
            .unwrap_or_default())
    }

    async fn write_display_messages(
        &self,
        task_id: TaskId,
        messages: &[DisplayMessage],
    ) -> Result<(), StoreError> {
        self.tasks.write().await.entry(task_id).or_default().display = messages.to_vec();
        Ok(())
    }

    async fn get_history_item(&self, task_id: TaskId) -> Result<Option<HistoryItem>, StoreError> {
        Ok(self
            .tasks
            .read()
            .await
            .get(&task_id)
            .and_then(|docs| docs.item.clone()))
    }

    async fn save_history_item(&self, item: &HistoryItem) -> Result<(), StoreError> {
        self.tasks.write().await.entry(item.id).or_default().item = Some(item.clone());
        Ok(())
    }

    async fn list_history_items(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HistoryItem>, StoreError> {
        let items = self
            .tasks
            .read()
            .await
            .values()
            .filter_map(|docs| docs.item.clone())
            .collect();
        Ok(sort_and_page(items, limit, offset))
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.tasks.write().await.remove(&task_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_round_trip() {
        let store = InMemoryTaskStore::new();
        let id = TaskId::new();
        let history = vec![
            ApiMessage::user_text("hello"),
            ApiMessage::assistant_text("hi"),
        ];

        store.write_history(id, &history).await.expect("write");
        store.write_history(id, &history).await.expect("rewrite");
        assert_eq!(store.read_history(id).await.expect("read"), history);
        assert!(!store.is_persistent());

        store.delete_task(id).await.expect("delete");
        assert!(store.read_history(id).await.expect("read").is_empty());
    }
}
