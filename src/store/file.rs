//! JSON file-based task store.
//!
//! Layout: `<base>/tasks/<task_id>/{api_conversation_history,ui_messages,history_item}.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;

use super::{sort_and_page, StoreError, TaskStore};
use crate::llm::ApiMessage;
use crate::messages::DisplayMessage;
use crate::task::{HistoryItem, TaskId};

const HISTORY_FILE: &str = "api_conversation_history.json";
const DISPLAY_FILE: &str = "ui_messages.json";
const ITEM_FILE: &str = "history_item.json";

#[derive(Clone)]
pub struct FileTaskStore {
    tasks_dir: PathBuf,
    persist_lock: Arc<Mutex<()>>,
}

impl FileTaskStore {
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let tasks_dir = base_dir.into().join("tasks");
        fs::create_dir_all(&tasks_dir)
            .await
            .map_err(|source| io_error(&tasks_dir, source))?;
        Ok(Self {
            tasks_dir,
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    fn task_dir(&self, task_id: TaskId) -> PathBuf {
        self.tasks_dir.join(task_id.to_string())
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Serialization {
                    what: path.display().to_string(),
                    source,
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(path, err)),
        }
    }

    /// Write via a temp file and rename, so readers never see a torn document.
    async fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialization {
            what: path.display().to_string(),
            source,
        })?;

        let _guard = self.persist_lock.lock().await;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error(parent, source))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, data)
            .await
            .map_err(|source| io_error(&tmp_path, source))?;
        fs::rename(&tmp_path, path)
            .await
            .map_err(|source| io_error(path, source))?;
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn read_history(&self, task_id: TaskId) -> Result<Vec<ApiMessage>, StoreError> {
        let path = self.task_dir(task_id).join(HISTORY_FILE);
        Ok(self.read_json(&path).await?.unwrap_or_default())
    }

    async fn write_history(
        &self,
        task_id: TaskId,
        messages: &[ApiMessage],
    ) -> Result<(), StoreError> {
        let path = self.task_dir(task_id).join(HISTORY_FILE);
        self.write_json(&path, messages).await
    }

    async fn read_display_messages(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<DisplayMessage>, StoreError> {
        let path = self.task_dir(task_id).join(DISPLAY_FILE);
        Ok(self.read_json(&path).await?.unwrap_or_default())
    }

    async fn write_display_messages(
        &self,
        task_id: TaskId,
        messages: &[DisplayMessage],
    ) -> Result<(), StoreError> {
        let path = self.task_dir(task_id).join(DISPLAY_FILE);
        self.write_json(&path, messages).await
    }

    async fn get_history_item(&self, task_id: TaskId) -> Result<Option<HistoryItem>, StoreError> {
        let path = self.task_dir(task_id).join(ITEM_FILE);
        self.read_json(&path).await
    }

    async fn save_history_item(&self, item: &HistoryItem) -> Result<(), StoreError> {
        let path = self.task_dir(item.id).join(ITEM_FILE);
        self.write_json(&path, item).await
    }

    async fn list_history_items(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HistoryItem>, StoreError> {
        let mut entries = fs::read_dir(&self.tasks_dir)
            .await
            .map_err(|source| io_error(&self.tasks_dir, source))?;

        let mut items = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| io_error(&self.tasks_dir, source))?
        {
            let path = entry.path().join(ITEM_FILE);
            match self.read_json::<HistoryItem>(&path).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable history item {}: {}", path.display(), e),
            }
        }
        Ok(sort_and_page(items, limit, offset))
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<(), StoreError> {
        let dir = self.task_dir(task_id);
        let _guard = self.persist_lock.lock().await;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&dir, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ContentBlock;
    use crate::messages::{MessageContent, MessageKind, MessageLog, SayKind};
    use crate::task::{HistoryStatus, Mode, TaskSource};
    use serde_json::json;
    use tokio_test::assert_ok;

    fn sample_history() -> Vec<ApiMessage> {
        vec![
            ApiMessage::user_text("<task>\nfix the bug\n</task>"),
            ApiMessage::assistant(vec![
                ContentBlock::text("Let me look."),
                ContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "read_file".to_string(),
                    input: json!({ "path": "src/lib.rs", "start_line": "1" }),
                },
            ]),
            ApiMessage::user(vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_1".to_string(),
                content: "fn main() {}".to_string(),
                is_error: false,
            }]),
        ]
    }

    fn sample_item(id: TaskId, updated_ts: i64) -> HistoryItem {
        HistoryItem {
            id,
            number: 1,
            ts: 1,
            updated_ts,
            task: "fix the bug".to_string(),
            tokens_in: 0,
            tokens_out: 0,
            cache_writes: 0,
            cache_reads: 0,
            total_cost: 0.0,
            mode: Mode::default(),
            parent_id: None,
            root_id: Some(id),
            source: TaskSource::User,
            status: HistoryStatus::Active,
        }
    }

    #[tokio::test]
    async fn test_history_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileTaskStore::new(dir.path()).await.expect("store");
        let id = TaskId::new();
        let history = sample_history();

        assert_ok!(store.write_history(id, &history).await);
        let read = store.read_history(id).await.expect("read");
        assert_eq!(read, history);
    }

    #[tokio::test]
    async fn test_writes_are_idempotent_overwrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileTaskStore::new(dir.path()).await.expect("store");
        let id = TaskId::new();
        let mut log = MessageLog::new();
        log.apply(MessageKind::Say(SayKind::Text), MessageContent::text("hi"), None);

        store.write_display_messages(id, log.messages()).await.expect("first");
        store.write_display_messages(id, log.messages()).await.expect("second");
        let read = store.read_display_messages(id).await.expect("read");
        assert_eq!(read.len(), 1);
        assert!(!dir
            .path()
            .join("tasks")
            .join(id.to_string())
            .join("ui_messages.json.tmp")
            .exists());
    }

    #[tokio::test]
    async fn test_missing_task_reads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileTaskStore::new(dir.path()).await.expect("store");
        let id = TaskId::new();

        assert!(store.read_history(id).await.expect("history").is_empty());
        assert!(store.get_history_item(id).await.expect("item").is_none());
        assert_ok!(store.delete_task(id).await);
    }

    #[tokio::test]
    async fn test_list_history_items_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileTaskStore::new(dir.path()).await.expect("store");
        let older = sample_item(TaskId::new(), 10);
        let newer = sample_item(TaskId::new(), 20);
        store.save_history_item(&older).await.expect("save older");
        store.save_history_item(&newer).await.expect("save newer");

        let items = store.list_history_items(10, 0).await.expect("list");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, newer.id);

        let page = store.list_history_items(1, 1).await.expect("page");
        assert_eq!(page[0].id, older.id);

        store.delete_task(newer.id).await.expect("delete");
        assert_eq!(store.list_history_items(10, 0).await.expect("list").len(), 1);
    }
}
