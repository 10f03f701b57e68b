//! Test doubles shared by unit tests across the crate.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::llm::{ApiChunk, ApiMessage, ApiStream, LlmError, ModelClient, ModelInfo, RequestMetadata};
use crate::store::InMemoryTaskStore;
use crate::task::{EngineContext, EngineEvent, TaskEvent};

/// What the scripted client does for one request.
#[derive(Debug, Clone)]
pub enum Step {
    /// Stream these chunks, then end
    Chunks(Vec<ApiChunk>),
    /// Fail before any chunk
    FailFirst(LlmError),
    /// Stream these chunks, then fail
    FailMidStream { chunks: Vec<ApiChunk>, error: LlmError },
    /// Stream these chunks, then never end
    Hang(Vec<ApiChunk>),
}

/// A [`ModelClient`] that plays back queued steps.
///
/// A step can be bound to requests whose first history message contains a marker, so
/// concurrent tasks each consume their own script. Requests with no matching step get a
/// stream that never yields.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    steps: Mutex<VecDeque<(Option<String>, Step)>>,
    requests: Mutex<Vec<Vec<ApiMessage>>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunks(&self, chunks: Vec<ApiChunk>) {
        self.push_step(Step::Chunks(chunks));
    }

    pub fn push_step(&self, step: Step) {
        self.steps.lock().unwrap().push_back((None, step));
    }

    /// Queue a step for requests whose first message contains `marker`.
    pub fn push_for(&self, marker: &str, step: Step) {
        self.steps
            .lock()
            .unwrap()
            .push_back((Some(marker.to_string()), step));
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// The history sent with every request so far.
    pub fn requests(&self) -> Vec<Vec<ApiMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn create_message(
        &self,
        _system_prompt: &str,
        history: &[ApiMessage],
        _metadata: &RequestMetadata,
    ) -> Result<ApiStream, LlmError> {
        let first = history.first().map(|m| m.render_text()).unwrap_or_default();
        self.requests.lock().unwrap().push(history.to_vec());

        let step = {
            let mut steps = self.steps.lock().unwrap();
            steps
                .iter()
                .position(|(marker, _)| marker.as_deref().map_or(true, |m| first.contains(m)))
                .and_then(|index| steps.remove(index))
                .map(|(_, step)| step)
        };

        let stream: ApiStream = match step {
            None => Box::pin(stream::pending()),
            Some(Step::FailFirst(error)) => return Err(error),
            Some(Step::Chunks(chunks)) => Box::pin(stream::iter(chunks.into_iter().map(Ok))),
            Some(Step::FailMidStream { chunks, error }) => Box::pin(stream::iter(
                chunks.into_iter().map(Ok).chain(std::iter::once(Err(error))),
            )),
            Some(Step::Hang(chunks)) => {
                use futures::StreamExt;
                Box::pin(stream::iter(chunks.into_iter().map(Ok)).chain(stream::pending()))
            }
        };
        Ok(stream)
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            id: "scripted/model".to_string(),
            context_window: 200_000,
            max_output_tokens: 8_192,
        }
    }
}

/// Engine context over a scripted client and an in-memory store.
///
/// The workspace points at a directory that does not exist, so environment listings are empty
/// and file reads fail deterministically.
pub fn test_context(client: ScriptedClient) -> (EngineContext, Arc<ScriptedClient>) {
    let client = Arc::new(client);
    let config = Config {
        working_dir: PathBuf::from("/nonexistent/task-engine-workspace"),
        mode_switch_settle: Duration::from_millis(10),
        ..Config::default()
    };
    let ctx = EngineContext::new(config, client.clone(), Arc::new(InMemoryTaskStore::new()));
    (ctx, client)
}

pub fn completion_response(result: &str) -> Vec<ApiChunk> {
    vec![
        ApiChunk::Text("Finishing up.\n".to_string()),
        ApiChunk::Text(format!(
            "<attempt_completion>\n<result>{}</result>\n</attempt_completion>",
            result
        )),
    ]
}

pub fn new_task_response(mode: &str, message: &str) -> Vec<ApiChunk> {
    vec![ApiChunk::Text(format!(
        "<new_task>\n<mode>{}</mode>\n<message>{}</message>\n</new_task>",
        mode, message
    ))]
}

/// Wait for the first event matching `predicate`, failing the test after ten seconds.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<EngineEvent>,
    mut predicate: impl FnMut(&EngineEvent) -> bool,
) -> EngineEvent {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
    result.expect("timed out waiting for event")
}

/// Wait until the task with `task_id` reports completion and return its result.
pub async fn wait_for_completion(
    events: &mut broadcast::Receiver<EngineEvent>,
    task_id: crate::task::TaskId,
) -> String {
    let event = wait_for_event(events, |e| {
        e.task_id == task_id && matches!(e.event, TaskEvent::Completed { .. })
    })
    .await;
    match event.event {
        TaskEvent::Completed { result, .. } => result,
        _ => unreachable!(),
    }
}
