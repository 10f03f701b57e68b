//! Task orchestration.
//!
//! The [`TaskEngine`] owns two kinds of containers:
//!
//! - the **user stack** ([`TaskStackManager`]): serial, interactive work where only the top
//!   task is active and every ask waits for the caller;
//! - the **agent pool** ([`AgentTaskPool`]): background lineages that run in parallel, each with
//!   its own stack and mode state, answering asks through a responder.
//!
//! Every task reports to the engine over its own signal channel. The engine reacts to
//! lifecycle transitions (completion hands a result to the paused parent, a broken stream
//! rebuilds the task from its persisted history) and re-broadcasts each event to subscribers.

mod agent_pool;
mod stack;
mod user_stack;

pub use agent_pool::{AgentRootGroup, AgentTaskPool};
pub use stack::{StackEntry, StackError, TaskStack};
pub use user_stack::TaskStackManager;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::messages::{AskReply, AskResponder};
use crate::store::StoreError;
use crate::task::{
    AbortReason, BackgroundContext, EngineContext, EngineEvent, InstanceId, Mode, ModeState,
    RestoredState, Task, TaskError, TaskEvent, TaskId, TaskOptions, TaskSignal, TaskStart,
};

const EVENT_CAPACITY: usize = 1024;

/// How long a cancel waits for an in-flight stream to wind down before rebuilding.
const STREAM_SETTLE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("Task {0} has no pending question")]
    NoPendingAsk(TaskId),

    #[error("Task {0} is not the active task")]
    NotActive(TaskId),

    #[error("Background tasks need a responder for their questions")]
    MissingResponder,

    #[error(transparent)]
    Stack(#[from] StackError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Parameters for [`TaskEngine::new_task`].
pub struct NewTaskRequest {
    pub text: String,
    pub images: Vec<String>,
    pub mode: Option<Mode>,
    pub background: Option<BackgroundContext>,
    pub responder: Option<Arc<dyn AskResponder>>,
}

impl NewTaskRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
            mode: None,
            background: None,
            responder: None,
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Run in the agent pool instead of on the user stack.
    pub fn in_background(mut self, background: BackgroundContext) -> Self {
        self.background = Some(background);
        self
    }

    pub fn with_responder(mut self, responder: Arc<dyn AskResponder>) -> Self {
        self.responder = Some(responder);
        self
    }
}

pub struct TaskEngine {
    ctx: Arc<EngineContext>,
    user: TaskStackManager,
    pool: AgentTaskPool,
    events: broadcast::Sender<EngineEvent>,
    /// Instances stopped by `cancel_task`; their abort is followed by a rebuild, not a detach.
    rehydrating: Mutex<HashSet<InstanceId>>,
}

impl TaskEngine {
    pub fn new(ctx: EngineContext) -> Arc<Self> {
        let mode_state = Arc::new(ModeState::new(ctx.config.default_mode.clone()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            ctx: Arc::new(ctx),
            user: TaskStackManager::new(mode_state),
            pool: AgentTaskPool::new(),
            events,
            rehydrating: Mutex::new(HashSet::new()),
        })
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Every task event, tagged with the task and instance that produced it.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------------
    // Starting tasks
    // ------------------------------------------------------------------------

    /// Start a root task.
    ///
    /// A foreground task replaces whatever was on the user stack. A background task opens a
    /// new lineage in the agent pool and requires a responder.
    pub async fn new_task(self: &Arc<Self>, request: NewTaskRequest) -> Result<Arc<Task>, EngineError> {
        let NewTaskRequest {
            text,
            images,
            mode,
            background,
            responder,
        } = request;

        let task = match background {
            Some(background) => {
                let responder = responder.ok_or(EngineError::MissingResponder)?;
                let mode = mode.unwrap_or_else(|| self.ctx.config.default_mode.clone());
                let mode_state = Arc::new(ModeState::new(mode.clone()));
                let options = TaskOptions::new(Arc::clone(&mode_state))
                    .with_background(background)
                    .with_mode(mode)
                    .with_responder(responder);
                let task = self.create_task(options);
                self.pool.push_root(Arc::clone(&task), mode_state).await;
                task
            }
            None => {
                self.abandon_user_stack().await;
                let mut options = TaskOptions::new(self.user.mode_state());
                if let Some(mode) = mode {
                    options = options.with_mode(mode);
                }
                if let Some(responder) = responder {
                    options = options.with_responder(responder);
                }
                let task = self.create_task(options);
                self.user.push(Arc::clone(&task));
                task.emit(TaskEvent::Focused);
                task
            }
        };

        info!(task_id = %task.id(), background = task.is_background(), "New task created");
        self.spawn_runner(Arc::clone(&task), TaskStart::New { text, images });
        Ok(task)
    }

    /// Bring a task back from the store and continue it.
    ///
    /// A task that is already resident is returned as is. A resumed task is a root of its
    /// container even if it was once a subtask.
    pub async fn resume_task(
        self: &Arc<Self>,
        task_id: TaskId,
        background: Option<BackgroundContext>,
        responder: Option<Arc<dyn AskResponder>>,
    ) -> Result<Arc<Task>, EngineError> {
        if let Some(task) = self.find_task(task_id).await {
            return Ok(task);
        }
        let restored = self.load_restored(task_id).await?;
        let mode = restored.item.mode.clone();
        let number = restored.item.number;

        let task = match background {
            Some(background) => {
                let responder = responder.ok_or(EngineError::MissingResponder)?;
                let mode_state = Arc::new(ModeState::new(mode.clone()));
                let options = TaskOptions::new(Arc::clone(&mode_state))
                    .with_background(background)
                    .with_responder(responder)
                    .with_number(number)
                    .with_restored(restored);
                let task = self.create_task(options);
                self.pool.push_root(Arc::clone(&task), mode_state).await;
                task
            }
            None => {
                self.abandon_user_stack().await;
                let mut options = TaskOptions::new(self.user.mode_state())
                    .with_number(number)
                    .with_restored(restored);
                if let Some(responder) = responder {
                    options = options.with_responder(responder);
                }
                let task = self.create_task(options);
                self.user.push(Arc::clone(&task));
                task.emit(TaskEvent::Focused);
                task
            }
        };

        info!(task_id = %task_id, mode = %mode, "Task resumed from history");
        self.spawn_runner(Arc::clone(&task), TaskStart::Resume);
        Ok(task)
    }

    async fn abandon_user_stack(&self) {
        for task in self.user.clear() {
            debug!(task_id = %task.id(), "Abandoning task on user stack");
            task.abort_task(true).await;
        }
    }

    fn create_task(self: &Arc<Self>, options: TaskOptions) -> Arc<Task> {
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let task = Task::new(Arc::clone(&self.ctx), options, signals);
        self.spawn_listener(&task, signals_rx);
        task
    }

    fn spawn_runner(&self, task: Arc<Task>, start: TaskStart) {
        tokio::spawn(async move {
            let task_id = task.id();
            let exit = task.run(start).await;
            debug!(task_id = %task_id, ?exit, "Task runner finished");
        });
    }

    // ------------------------------------------------------------------------
    // Caller actions
    // ------------------------------------------------------------------------

    /// Answer the pending question of a task.
    ///
    /// Foreground tasks only accept answers while they are the active task.
    pub async fn deliver_ask_response(&self, task_id: TaskId, reply: AskReply) -> Result<(), EngineError> {
        let task = self
            .find_task(task_id)
            .await
            .ok_or(EngineError::TaskNotFound(task_id))?;
        if !task.is_background() && self.user.current().map(|t| t.id()) != Some(task_id) {
            return Err(EngineError::NotActive(task_id));
        }
        if !task.handle_ask_response(reply) {
            return Err(EngineError::NoPendingAsk(task_id));
        }
        Ok(())
    }

    /// Stop a task and rebuild it from its persisted history.
    ///
    /// The new instance keeps the id and immediately asks whether to resume.
    pub async fn cancel_task(self: &Arc<Self>, task_id: TaskId) -> Result<Arc<Task>, EngineError> {
        let task = self
            .find_task(task_id)
            .await
            .ok_or(EngineError::TaskNotFound(task_id))?;
        info!(task_id = %task_id, "Cancelling task");

        if !task.is_aborted() {
            self.rehydrating
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(task.instance_id());
        }
        task.abort_task(false).await;
        if !task.wait_until_not_streaming(STREAM_SETTLE_TIMEOUT).await {
            warn!(task_id = %task_id, "Task still streaming after cancel, rebuilding anyway");
        }
        self.rehydrate(&task).await
    }

    /// Discard the active foreground task. A paused parent resumes with a notice.
    pub async fn clear_task(&self) -> Result<(), EngineError> {
        let task = self.user.pop().ok_or(StackError::Empty)?;
        info!(task_id = %task.id(), "Clearing task");
        task.abort_task(true).await;

        if let Some(parent) = task.parent() {
            parent.emit(TaskEvent::Focused);
            parent.resume_paused_task(format!(
                "Subtask {} was cleared by the user before completing.",
                task.id()
            ));
        }
        Ok(())
    }

    /// Change the caller's mode for tasks that start from now on.
    pub fn switch_mode(&self, mode: Mode) {
        info!(mode = %mode, "Switching mode");
        self.user.mode_state().set(mode);
    }

    /// Abandon every resident task.
    pub async fn shutdown(&self) {
        let mut tasks = self.user.clear();
        tasks.extend(self.pool.drain().await);
        let count = tasks.len();
        for task in tasks {
            task.abort_task(true).await;
        }
        info!(count, "Task engine shut down");
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// The active foreground task.
    pub fn current_task(&self) -> Option<Arc<Task>> {
        self.user.current()
    }

    pub async fn find_task(&self, task_id: TaskId) -> Option<Arc<Task>> {
        match self.user.find(task_id) {
            Some(task) => Some(task),
            None => self.pool.find(task_id).await,
        }
    }

    pub fn user_stack_depth(&self) -> usize {
        self.user.depth()
    }

    pub async fn agent_stack_depth(&self, root_id: TaskId) -> usize {
        self.pool.depth(root_id).await
    }

    pub async fn agent_roots(&self) -> Vec<TaskId> {
        self.pool.roots().await
    }

    // ------------------------------------------------------------------------
    // Lifecycle routing
    // ------------------------------------------------------------------------

    fn spawn_listener(self: &Arc<Self>, task: &Arc<Task>, mut signals: mpsc::UnboundedReceiver<TaskSignal>) {
        let engine: Weak<Self> = Arc::downgrade(self);
        let weak_task = Arc::downgrade(task);
        let (task_id, instance_id) = (task.id(), task.instance_id());

        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match signal {
                    TaskSignal::Event(event) => {
                        if let Some(task) = weak_task.upgrade() {
                            engine.on_task_event(&task, &event).await;
                        }
                        // no subscribers is fine
                        let _ = engine.events.send(EngineEvent {
                            task_id,
                            instance_id,
                            event,
                        });
                    }
                    TaskSignal::SpawnSubtask { message, mode, reply } => {
                        let result = match weak_task.upgrade() {
                            Some(parent) => engine
                                .create_subtask(&parent, message, mode)
                                .await
                                .map_err(|e| TaskError::SubtaskSpawn(e.to_string())),
                            None => Err(TaskError::ManagerUnavailable),
                        };
                        if reply.send(result).is_err() {
                            debug!(task_id = %task_id, "Subtask requester went away");
                        }
                    }
                }
            }
            tracing::trace!(task_id = %task_id, instance_id = %instance_id, "Task listener stopped");
        });
    }

    async fn on_task_event(self: &Arc<Self>, task: &Arc<Task>, event: &TaskEvent) {
        match event {
            TaskEvent::Completed { result, .. } => self.on_task_completed(task, result).await,
            TaskEvent::Aborted { reason } => self.on_task_aborted(task, *reason).await,
            _ => {}
        }
    }

    async fn on_task_completed(&self, task: &Arc<Task>, result: &str) {
        task.persist().await;
        if self.detach(task).await {
            task.dispose();
        }
        if let Some(parent) = task.parent() {
            parent.emit(TaskEvent::Focused);
            parent.resume_paused_task(result);
        }
    }

    async fn on_task_aborted(self: &Arc<Self>, task: &Arc<Task>, reason: AbortReason) {
        match reason {
            AbortReason::StreamingFailed => {
                // the stream turn persists before it lets go of the streaming flag
                task.wait_until_not_streaming(STREAM_SETTLE_TIMEOUT).await;
                if let Err(e) = self.rehydrate(task).await {
                    warn!(task_id = %task.id(), "Failed to rebuild task after stream failure: {}", e);
                }
            }
            AbortReason::UserCancelled if self.take_rehydrating(task) => {}
            AbortReason::UserCancelled | AbortReason::Failed => {
                if self.detach(task).await {
                    task.dispose();
                }
                if let Some(parent) = task.parent() {
                    parent.emit(TaskEvent::Focused);
                    parent.resume_paused_task(format!(
                        "Subtask {} was aborted before completing.",
                        task.id()
                    ));
                }
            }
            AbortReason::Abandoned => {}
        }
    }

    fn take_rehydrating(&self, task: &Task) -> bool {
        self.rehydrating
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task.instance_id())
    }

    /// Take a finished task out of its container. Foreground roots stay resident so the
    /// caller can keep talking to them; returns whether the task was let go.
    async fn detach(&self, task: &Arc<Task>) -> bool {
        if task.is_background() {
            if let Err(e) = self.pool.remove(task.root_id(), task.id()).await {
                debug!(task_id = %task.id(), "Task already gone from agent pool: {}", e);
            }
            true
        } else if task.has_parent() {
            if let Err(e) = self.user.remove(task.id()) {
                debug!(task_id = %task.id(), "Task already gone from user stack: {}", e);
            }
            true
        } else {
            false
        }
    }

    async fn create_subtask(
        self: &Arc<Self>,
        parent: &Arc<Task>,
        message: String,
        mode: Option<Mode>,
    ) -> Result<TaskId, EngineError> {
        let mode = match mode {
            Some(mode) => mode,
            None => parent.mode()?,
        };
        let mode_state = parent.mode_state();
        let depth = if parent.is_background() {
            self.pool.depth(parent.root_id()).await
        } else {
            self.user.depth()
        };

        let mut options = TaskOptions::new(Arc::clone(&mode_state))
            .with_parent(Arc::clone(parent))
            .with_mode(mode.clone())
            .with_number(depth as u32 + 1);
        if let Some(background) = parent.background() {
            options = options.with_background(background.clone());
        }
        if let Some(responder) = parent.responder() {
            options = options.with_responder(responder);
        }

        let child = self.create_task(options);
        if child.is_background() {
            self.pool.push(Arc::clone(&child)).await?;
        } else {
            self.user.push(Arc::clone(&child));
        }

        parent.mark_paused();
        mode_state.set(mode.clone());
        parent.emit(TaskEvent::Unfocused);
        parent.emit(TaskEvent::Spawned { child_id: child.id() });
        child.emit(TaskEvent::Focused);

        info!(
            parent_id = %parent.id(),
            child_id = %child.id(),
            mode = %mode,
            "Subtask started"
        );
        self.spawn_runner(
            Arc::clone(&child),
            TaskStart::New {
                text: message,
                images: Vec::new(),
            },
        );
        Ok(child.id())
    }

    async fn load_restored(&self, task_id: TaskId) -> Result<RestoredState, EngineError> {
        let item = self
            .ctx
            .store
            .get_history_item(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        let history = self.ctx.store.read_history(task_id).await?;
        let messages = self.ctx.store.read_display_messages(task_id).await?;
        Ok(RestoredState {
            item,
            history,
            messages,
        })
    }

    /// Replace `old` in its container with a fresh instance built from the store.
    async fn rehydrate(self: &Arc<Self>, old: &Arc<Task>) -> Result<Arc<Task>, EngineError> {
        let restored = self.load_restored(old.id()).await?;

        let mut options = TaskOptions::new(old.mode_state())
            .with_number(old.task_number())
            .with_restored(restored);
        if let Some(parent) = old.parent() {
            options = options.with_parent(parent);
        }
        if let Some(background) = old.background() {
            options = options.with_background(background.clone());
        }
        if let Some(responder) = old.responder() {
            options = options.with_responder(responder);
        }

        let task = self.create_task(options);
        if old.is_background() {
            self.pool
                .replace(old.root_id(), old.id(), Arc::clone(&task))
                .await?;
        } else {
            self.user.replace(old.id(), Arc::clone(&task))?;
        }
        old.abort_task(true).await;

        info!(
            task_id = %task.id(),
            instance_id = %task.instance_id(),
            "Task rebuilt from history"
        );
        self.spawn_runner(Arc::clone(&task), TaskStart::Resume);
        Ok(task)
    }
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("user_stack", &self.user.ids())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::TokenUsage;
    use crate::llm::ApiChunk;
    use crate::messages::{AskKind, AutoResponder, MessageKind, SayKind};
    use crate::testing::{
        completion_response, new_task_response, test_context, wait_for_completion, wait_for_event,
        ScriptedClient, Step,
    };

    fn history_contains(history: &[crate::llm::ApiMessage], needle: &str) -> bool {
        history.iter().any(|m| m.render_text().contains(needle))
    }

    #[tokio::test]
    async fn test_subtask_result_resumes_parent() {
        let (ctx, client) = test_context(ScriptedClient::new());
        client.push_for("parent job", Step::Chunks(new_task_response("ask", "child job")));
        client.push_for("child job", Step::Chunks(completion_response("done")));
        client.push_for("parent job", Step::Chunks(completion_response("all done")));

        let engine = TaskEngine::new(ctx);
        let mut events = engine.subscribe();
        let parent = engine
            .new_task(
                NewTaskRequest::new("parent job").with_responder(Arc::new(AutoResponder::new())),
            )
            .await
            .unwrap();
        let parent_mode = parent.resolve_mode().await;

        let spawned = wait_for_event(&mut events, |e| {
            e.task_id == parent.id() && matches!(e.event, TaskEvent::Spawned { .. })
        })
        .await;
        let TaskEvent::Spawned { child_id } = spawned.event else {
            unreachable!()
        };
        assert_eq!(wait_for_completion(&mut events, child_id).await, "done");
        assert_eq!(wait_for_completion(&mut events, parent.id()).await, "all done");

        assert!(!parent.is_paused());
        assert!(history_contains(
            &parent.history().await,
            "[new_task completed] Result: done"
        ));
        assert_eq!(parent.mode_state().get(), parent_mode);
        assert_eq!(engine.user_stack_depth(), 1);
        assert!(engine.find_task(child_id).await.is_none());
    }

    #[tokio::test]
    async fn test_agent_roots_run_independently() {
        let (ctx, client) = test_context(ScriptedClient::new());
        for name in ["alpha", "beta"] {
            let root = format!("{}-root", name);
            let child = format!("{}-child", name);
            client.push_for(&root, Step::Chunks(new_task_response("code", &child)));
            client.push_for(&child, Step::Chunks(completion_response(&format!("{} child done", name))));
            client.push_for(&root, Step::Chunks(completion_response(&format!("{} done", name))));
        }

        let engine = TaskEngine::new(ctx);
        let mut events = engine.subscribe();
        let mut roots = Vec::new();
        for name in ["alpha", "beta"] {
            let task = engine
                .new_task(
                    NewTaskRequest::new(format!("{}-root", name))
                        .in_background(BackgroundContext::new("test"))
                        .with_responder(Arc::new(AutoResponder::new())),
                )
                .await
                .unwrap();
            roots.push(task);
        }
        assert_eq!(engine.agent_roots().await.len(), 2);
        assert_eq!(engine.user_stack_depth(), 0);

        let mut finished = Vec::new();
        while finished.len() < 2 {
            let event = wait_for_event(&mut events, |e| {
                roots.iter().any(|r| r.id() == e.task_id)
                    && matches!(e.event, TaskEvent::Completed { .. })
            })
            .await;
            if let TaskEvent::Completed { result, .. } = event.event {
                finished.push(result);
            }
        }
        finished.sort();
        assert_eq!(finished, vec!["alpha done", "beta done"]);

        for root in &roots {
            assert!(history_contains(&root.history().await, "child done"));
        }
        assert!(engine.agent_roots().await.is_empty());
    }

    #[tokio::test]
    async fn test_background_task_requires_responder() {
        let (ctx, _) = test_context(ScriptedClient::new());
        let engine = TaskEngine::new(ctx);
        let result = engine
            .new_task(NewTaskRequest::new("unattended").in_background(BackgroundContext::new("test")))
            .await;
        assert!(matches!(result, Err(EngineError::MissingResponder)));
    }

    #[tokio::test]
    async fn test_cancel_rebuilds_task_from_history() {
        let (ctx, client) = test_context(ScriptedClient::new());
        client.push_step(Step::Hang(vec![ApiChunk::Text("Working on it".to_string())]));
        client.push_chunks(completion_response("resumed fine"));

        let engine = TaskEngine::new(ctx);
        let mut events = engine.subscribe();
        let old = engine.new_task(NewTaskRequest::new("long job")).await.unwrap();
        wait_for_event(&mut events, |e| {
            e.task_id == old.id() && matches!(&e.event, TaskEvent::Message { message } if message.kind == MessageKind::Say(SayKind::Text))
        })
        .await;

        let task = engine.cancel_task(old.id()).await.unwrap();
        assert_eq!(task.id(), old.id());
        assert_ne!(task.instance_id(), old.instance_id());
        assert!(old.is_abandoned());
        assert_eq!(engine.user_stack_depth(), 1);
        assert_eq!(
            engine.current_task().map(|t| t.instance_id()),
            Some(task.instance_id())
        );

        wait_for_event(&mut events, |e| {
            e.instance_id == task.instance_id()
                && matches!(&e.event, TaskEvent::Message { message } if message.kind == MessageKind::Ask(AskKind::ResumeTask))
        })
        .await;
        engine
            .deliver_ask_response(task.id(), AskReply::yes())
            .await
            .unwrap();

        wait_for_event(&mut events, |e| {
            e.instance_id == task.instance_id()
                && matches!(&e.event, TaskEvent::Message { message } if message.kind == MessageKind::Ask(AskKind::CompletionResult))
        })
        .await;
        engine
            .deliver_ask_response(task.id(), AskReply::yes())
            .await
            .unwrap();
        assert_eq!(wait_for_completion(&mut events, task.id()).await, "resumed fine");

        let resumed_request = client.requests().pop().unwrap();
        assert!(history_contains(&resumed_request, "[Response interrupted by user]"));
        assert!(history_contains(&resumed_request, "[TASK RESUMPTION]"));
    }

    async fn spawn_background_lineage(
        engine: &Arc<TaskEngine>,
        events: &mut broadcast::Receiver<EngineEvent>,
        root_text: &str,
    ) -> (Arc<Task>, Arc<Task>) {
        let root = engine
            .new_task(
                NewTaskRequest::new(root_text)
                    .in_background(BackgroundContext::new("test"))
                    .with_responder(Arc::new(AutoResponder::new())),
            )
            .await
            .unwrap();
        let spawned = wait_for_event(events, |e| {
            e.task_id == root.id() && matches!(e.event, TaskEvent::Spawned { .. })
        })
        .await;
        let TaskEvent::Spawned { child_id } = spawned.event else {
            unreachable!()
        };
        let child = engine.find_task(child_id).await.unwrap();
        (root, child)
    }

    #[tokio::test]
    async fn test_user_abort_of_subtask_resumes_parent() {
        let (ctx, client) = test_context(ScriptedClient::new());
        client.push_for("gamma-root", Step::Chunks(new_task_response("code", "gamma-child")));
        client.push_for("gamma-root", Step::Chunks(completion_response("gamma done")));

        let engine = TaskEngine::new(ctx);
        let mut events = engine.subscribe();
        let (root, child) = spawn_background_lineage(&engine, &mut events, "gamma-root").await;
        assert_eq!(engine.agent_stack_depth(root.id()).await, 2);

        child.abort_task(false).await;
        assert_eq!(wait_for_completion(&mut events, root.id()).await, "gamma done");
        assert!(history_contains(&root.history().await, "was aborted before completing"));
        assert!(engine.find_task(child.id()).await.is_none());
        assert!(engine.agent_roots().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_keeps_rebuilt_subtask_on_its_stack() {
        let (ctx, client) = test_context(ScriptedClient::new());
        client.push_for("delta-root", Step::Chunks(new_task_response("code", "delta-child")));

        let engine = TaskEngine::new(ctx);
        let mut events = engine.subscribe();
        let (root, child) = spawn_background_lineage(&engine, &mut events, "delta-root").await;

        let rebuilt = engine.cancel_task(child.id()).await.unwrap();
        wait_for_event(&mut events, |e| {
            e.instance_id == child.instance_id() && matches!(e.event, TaskEvent::Aborted { .. })
        })
        .await;

        assert_eq!(engine.agent_stack_depth(root.id()).await, 2);
        assert_eq!(
            engine.find_task(child.id()).await.map(|t| t.instance_id()),
            Some(rebuilt.instance_id())
        );
        assert!(root.is_paused());
    }

    #[tokio::test]
    async fn test_final_turn_usage_reaches_completion_and_history() {
        let (ctx, client) = test_context(ScriptedClient::new());
        let mut chunks = completion_response("counted");
        chunks.push(ApiChunk::Usage(TokenUsage::new(120, 30)));
        client.push_chunks(chunks);

        let engine = TaskEngine::new(ctx);
        let mut events = engine.subscribe();
        let task = engine
            .new_task(
                NewTaskRequest::new("count tokens")
                    .in_background(BackgroundContext::new("test"))
                    .with_responder(Arc::new(AutoResponder::new())),
            )
            .await
            .unwrap();

        let completed = wait_for_event(&mut events, |e| {
            e.task_id == task.id() && matches!(e.event, TaskEvent::Completed { .. })
        })
        .await;
        let TaskEvent::Completed { token_usage, .. } = completed.event else {
            unreachable!()
        };
        assert_eq!(token_usage.input_tokens, 120);

        let item = engine.context().store.get_history_item(task.id()).await.unwrap().unwrap();
        assert_eq!((item.tokens_in, item.tokens_out), (120, 30));
    }

    #[tokio::test]
    async fn test_clear_task_resumes_parent_with_notice() {
        let (ctx, client) = test_context(ScriptedClient::new());
        client.push_for("outer job", Step::Chunks(new_task_response("code", "inner job")));
        client.push_for("outer job", Step::Chunks(completion_response("outer done")));

        let engine = TaskEngine::new(ctx);
        let mut events = engine.subscribe();
        let parent = engine
            .new_task(NewTaskRequest::new("outer job").with_responder(Arc::new(AutoResponder::new())))
            .await
            .unwrap();
        let spawned = wait_for_event(&mut events, |e| {
            e.task_id == parent.id() && matches!(e.event, TaskEvent::Spawned { .. })
        })
        .await;
        let TaskEvent::Spawned { child_id } = spawned.event else {
            unreachable!()
        };
        let child = engine.find_task(child_id).await.unwrap();
        assert_eq!(engine.user_stack_depth(), 2);

        engine.clear_task().await.unwrap();
        assert!(child.is_abandoned());
        assert_eq!(wait_for_completion(&mut events, parent.id()).await, "outer done");
        assert!(history_contains(&parent.history().await, "was cleared by the user"));
        assert_eq!(engine.user_stack_depth(), 1);
    }

    #[tokio::test]
    async fn test_answers_go_only_to_the_active_task() {
        let (ctx, _) = test_context(ScriptedClient::new());
        let engine = TaskEngine::new(ctx);

        let missing = TaskId::new();
        assert!(matches!(
            engine.deliver_ask_response(missing, AskReply::yes()).await,
            Err(EngineError::TaskNotFound(id)) if id == missing
        ));

        // the first request never answers, so nothing is waiting on an ask
        let task = engine.new_task(NewTaskRequest::new("quiet")).await.unwrap();
        assert!(matches!(
            engine.deliver_ask_response(task.id(), AskReply::yes()).await,
            Err(EngineError::NoPendingAsk(_))
        ));
        assert!(matches!(engine.clear_task().await, Ok(())));
        assert!(matches!(
            engine.clear_task().await,
            Err(EngineError::Stack(StackError::Empty))
        ));
    }
}
