//! The task itself: identity, ask/say, pause, abort and persistence.
//!
//! The conversation loop lives in `conversation.rs` and the request/retry logic in
//! `api_request.rs`; both are further `impl Task` blocks over the state defined here.
//!
//! # Invariants
//! - At most one ask is pending; a newer ask supersedes it and the older waiter fails.
//! - `abort` is set at most once; everything after the first abort is a no-op.
//! - Once `abandoned` is set, no write from this instance reaches the store or the owner.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, OnceCell};
use tokio_util::sync::CancellationToken;

use super::{
    AbortReason, BackgroundContext, EngineContext, HistoryItem, HistoryStatus, InstanceId, Mode,
    ModeState, TaskError, TaskEvent, TaskId, TaskResources, TaskSignal, TaskSource, ToolUsage,
};
use crate::approval::AutoApprovalGate;
use crate::cost::TokenUsage;
use crate::llm::{ApiMessage, ContentBlock};
use crate::messages::{
    AskKind, AskReply, AskResponder, AskResponse, DisplayMessage, MessageContent, MessageKind,
    MessageLog, SayKind,
};
use crate::tools::ToolRepetitionDetector;

/// Persisted state a task is rebuilt from.
#[derive(Debug, Clone)]
pub struct RestoredState {
    pub item: HistoryItem,
    pub history: Vec<ApiMessage>,
    pub messages: Vec<DisplayMessage>,
}

/// How a task is constructed.
pub struct TaskOptions {
    /// Position in the owning stack (1-based)
    pub task_number: u32,
    pub parent: Option<Arc<Task>>,
    /// Present for tasks owned by the agent pool
    pub background: Option<BackgroundContext>,
    /// Explicit mode; when absent the mode is taken from `mode_state` on first use
    pub mode: Option<Mode>,
    /// The caller-side mode this task inherits from and restores after a pause
    pub mode_state: Arc<ModeState>,
    /// Answers asks without a caller; required for unattended tasks
    pub responder: Option<Arc<dyn AskResponder>>,
    pub restored: Option<RestoredState>,
}

impl TaskOptions {
    pub fn new(mode_state: Arc<ModeState>) -> Self {
        Self {
            task_number: 1,
            parent: None,
            background: None,
            mode: None,
            mode_state,
            responder: None,
            restored: None,
        }
    }

    pub fn with_number(mut self, task_number: u32) -> Self {
        self.task_number = task_number;
        self
    }

    pub fn with_parent(mut self, parent: Arc<Task>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_background(mut self, background: BackgroundContext) -> Self {
        self.background = Some(background);
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_responder(mut self, responder: Arc<dyn AskResponder>) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn with_restored(mut self, restored: RestoredState) -> Self {
        self.restored = Some(restored);
        self
    }
}

/// How [`Task::run`] enters the loop.
#[derive(Debug, Clone)]
pub enum TaskStart {
    New { text: String, images: Vec<String> },
    Resume,
}

/// How [`Task::run`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskExit {
    Completed(String),
    Aborted(AbortReason),
    Failed(String),
}

struct PendingAsk {
    ts: i64,
    reply: oneshot::Sender<AskReply>,
}

#[derive(Default)]
struct TaskStats {
    usage: TokenUsage,
    tool_usage: ToolUsage,
    mistakes: u32,
    /// Context size reported for the most recent request
    last_context_tokens: u64,
}

pub struct Task {
    id: TaskId,
    instance_id: InstanceId,
    task_number: u32,
    created_ts: i64,
    parent: Option<Weak<Task>>,
    parent_id: Option<TaskId>,
    root_id: Option<TaskId>,
    background: Option<BackgroundContext>,

    pub(super) ctx: Arc<EngineContext>,
    mode: OnceCell<Mode>,
    mode_state: Arc<ModeState>,
    task_text: Mutex<Option<String>>,

    history: tokio::sync::Mutex<Vec<ApiMessage>>,
    messages: Mutex<MessageLog>,
    pending_ask: Mutex<Option<PendingAsk>>,
    stats: Mutex<TaskStats>,
    status: Mutex<HistoryStatus>,

    abort: AtomicBool,
    abandoned: AtomicBool,
    abort_reason: Mutex<Option<AbortReason>>,
    paused: AtomicBool,
    resume_tx: Mutex<Option<oneshot::Sender<String>>>,
    resume_rx: Mutex<Option<oneshot::Receiver<String>>>,
    paused_mode: Mutex<Option<Mode>>,
    pub(super) cancel: CancellationToken,
    streaming: watch::Sender<bool>,
    resources: TaskResources,
    usage_drains: Mutex<Vec<oneshot::Receiver<()>>>,

    signals: mpsc::UnboundedSender<TaskSignal>,
    responder: Option<Arc<dyn AskResponder>>,
    gate: Mutex<AutoApprovalGate>,
    repetition: Mutex<ToolRepetitionDetector>,
    tool_counter: AtomicU32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Task {
    pub fn new(
        ctx: Arc<EngineContext>,
        options: TaskOptions,
        signals: mpsc::UnboundedSender<TaskSignal>,
    ) -> Arc<Self> {
        let TaskOptions {
            task_number,
            parent,
            background,
            mode,
            mode_state,
            responder,
            restored,
        } = options;

        let parent_id = parent.as_ref().map(|p| p.id());
        let root_from_parent = parent.as_ref().map(|p| p.root_id());

        let (id, created_ts, task_text, mode, parent_id, root_id, usage, history, messages) =
            match restored {
                Some(restored) => (
                    restored.item.id,
                    restored.item.ts,
                    Some(restored.item.task.clone()),
                    mode.or(Some(restored.item.mode.clone())),
                    parent_id.or(restored.item.parent_id),
                    root_from_parent.or(restored.item.root_id),
                    restored.item.usage(),
                    restored.history,
                    restored.messages,
                ),
                None => (
                    TaskId::new(),
                    chrono::Utc::now().timestamp_millis(),
                    None,
                    mode,
                    parent_id,
                    root_from_parent,
                    TokenUsage::default(),
                    Vec::new(),
                    Vec::new(),
                ),
            };

        let tool_uses = history
            .iter()
            .flat_map(|m| m.content.iter())
            .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
            .count() as u32;
        let (streaming, _) = watch::channel(false);
        let gate = AutoApprovalGate::new(ctx.config.approval.clone());

        Arc::new(Self {
            id,
            instance_id: InstanceId::new(),
            task_number,
            created_ts,
            parent: parent.as_ref().map(Arc::downgrade),
            parent_id,
            root_id,
            background,
            ctx,
            mode: OnceCell::new_with(mode),
            mode_state,
            task_text: Mutex::new(task_text),
            history: tokio::sync::Mutex::new(history),
            messages: Mutex::new(MessageLog::from_messages(messages)),
            pending_ask: Mutex::new(None),
            stats: Mutex::new(TaskStats {
                usage,
                ..TaskStats::default()
            }),
            status: Mutex::new(HistoryStatus::Active),
            abort: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            paused: AtomicBool::new(false),
            resume_tx: Mutex::new(None),
            resume_rx: Mutex::new(None),
            paused_mode: Mutex::new(None),
            cancel: CancellationToken::new(),
            streaming,
            resources: TaskResources::new(),
            usage_drains: Mutex::new(Vec::new()),
            signals,
            responder,
            gate: Mutex::new(gate),
            repetition: Mutex::new(ToolRepetitionDetector::default()),
            tool_counter: AtomicU32::new(tool_uses),
        })
    }

    // ------------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------------

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn task_number(&self) -> u32 {
        self.task_number
    }

    /// The parent task, if it is still alive.
    pub fn parent(&self) -> Option<Arc<Task>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Whether a live parent waits for this task's result.
    pub fn has_parent(&self) -> bool {
        self.parent().is_some()
    }

    pub fn parent_id(&self) -> Option<TaskId> {
        self.parent_id
    }

    /// The top of this task's nesting chain; a root task is its own root.
    pub fn root_id(&self) -> TaskId {
        self.root_id.unwrap_or(self.id)
    }

    pub fn background(&self) -> Option<&BackgroundContext> {
        self.background.as_ref()
    }

    pub fn is_background(&self) -> bool {
        self.background.is_some()
    }

    pub fn responder(&self) -> Option<Arc<dyn AskResponder>> {
        self.responder.clone()
    }

    pub fn mode_state(&self) -> Arc<ModeState> {
        Arc::clone(&self.mode_state)
    }

    pub fn task_text(&self) -> Option<String> {
        lock(&self.task_text).clone()
    }

    // ------------------------------------------------------------------------
    // Mode
    // ------------------------------------------------------------------------

    /// Resolve the mode, inheriting the caller's current mode if none was given.
    ///
    /// Concurrent callers all wait for the same resolution.
    pub async fn resolve_mode(&self) -> Mode {
        self.mode
            .get_or_init(|| async { self.mode_state.get() })
            .await
            .clone()
    }

    /// The resolved mode.
    ///
    /// # Errors
    /// `TaskError::ModeNotInitialized` if called before [`Task::resolve_mode`].
    pub fn mode(&self) -> Result<Mode, TaskError> {
        self.mode.get().cloned().ok_or(TaskError::ModeNotInitialized)
    }

    // ------------------------------------------------------------------------
    // State inspection
    // ------------------------------------------------------------------------

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        *lock(&self.abort_reason)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        *self.streaming.borrow()
    }

    pub fn status(&self) -> HistoryStatus {
        *lock(&self.status)
    }

    pub fn has_pending_ask(&self) -> bool {
        lock(&self.pending_ask).is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.resources.is_disposed()
    }

    pub fn resources(&self) -> &TaskResources {
        &self.resources
    }

    pub async fn history(&self) -> Vec<ApiMessage> {
        self.history.lock().await.clone()
    }

    pub fn messages(&self) -> Vec<DisplayMessage> {
        lock(&self.messages).snapshot()
    }

    pub fn token_usage(&self) -> TokenUsage {
        lock(&self.stats).usage.clone()
    }

    pub fn tool_usage(&self) -> ToolUsage {
        lock(&self.stats).tool_usage.clone()
    }

    pub fn consecutive_mistakes(&self) -> u32 {
        lock(&self.stats).mistakes
    }

    pub(super) fn last_context_tokens(&self) -> u64 {
        lock(&self.stats).last_context_tokens
    }

    pub(super) fn ensure_running(&self) -> Result<(), TaskError> {
        if self.is_abandoned() {
            Err(TaskError::Abandoned(self.id))
        } else if self.is_aborted() {
            Err(TaskError::Aborted(self.id))
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------------
    // Owner notifications
    // ------------------------------------------------------------------------

    /// Send a lifecycle event to the owner. Abandoned instances stay silent.
    pub(crate) fn emit(&self, event: TaskEvent) {
        if self.is_abandoned() {
            return;
        }
        if self.signals.send(TaskSignal::Event(event)).is_err() {
            tracing::trace!(task_id = %self.id, "Task owner is gone, dropping event");
        }
    }

    // ------------------------------------------------------------------------
    // Ask / say
    // ------------------------------------------------------------------------

    /// Apply a message to the display log, returning its timestamp and the message as it now
    /// stands. The caller emits it.
    fn apply_message(
        &self,
        kind: MessageKind,
        content: MessageContent,
        partial: Option<bool>,
    ) -> (i64, Option<DisplayMessage>) {
        let mut log = lock(&self.messages);
        let (ts, _) = log.apply(kind, content, partial);
        (ts, log.last().cloned())
    }

    fn emit_message(&self, message: Option<DisplayMessage>) {
        if let Some(message) = message {
            self.emit(TaskEvent::Message { message });
        }
    }

    /// Emit progress. Never waits for the caller.
    ///
    /// Returns the timestamp of the affected message.
    pub async fn say(
        &self,
        kind: SayKind,
        content: MessageContent,
        partial: Option<bool>,
    ) -> Result<i64, TaskError> {
        if self.is_abandoned() {
            return Err(TaskError::Abandoned(self.id));
        }
        let (ts, message) = self.apply_message(MessageKind::Say(kind), content, partial);
        self.emit_message(message);
        if partial != Some(true) {
            self.save_messages().await;
        }
        Ok(ts)
    }

    /// Request input and wait for it.
    ///
    /// A partial ask only updates the display and returns `TaskError::AskIgnored`. A complete
    /// ask waits until a response is delivered, a newer ask supersedes it
    /// (`TaskError::AskSuperseded`), or the task is aborted.
    pub async fn ask(
        &self,
        kind: AskKind,
        text: Option<String>,
        partial: Option<bool>,
    ) -> Result<AskReply, TaskError> {
        self.ensure_running()?;

        let (ts, message) =
            self.apply_message(MessageKind::Ask(kind), MessageContent::from(text.clone()), partial);
        if partial == Some(true) {
            self.emit_message(message);
            return Err(TaskError::AskIgnored);
        }

        // registered before the message goes out, so an answer to it always finds a waiter
        let (reply_tx, reply_rx) = oneshot::channel();
        if lock(&self.pending_ask)
            .replace(PendingAsk { ts, reply: reply_tx })
            .is_some()
        {
            tracing::debug!(task_id = %self.id, "Pending ask superseded");
        }
        self.emit_message(message);
        self.save_messages().await;

        if kind.is_blocking() {
            self.emit(TaskEvent::Idle);
        }

        if let Some(responder) = &self.responder {
            let reply = responder.respond(kind, text.as_deref()).await;
            self.resolve_ask(Some(ts), reply);
        }

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(TaskError::Aborted(self.id)),
            reply = reply_rx => reply.map_err(|_| TaskError::AskSuperseded),
        };

        {
            let mut pending = lock(&self.pending_ask);
            if pending.as_ref().map(|p| p.ts) == Some(ts) {
                pending.take();
            }
        }

        if kind.is_blocking() && result.is_ok() {
            self.emit(TaskEvent::Active);
        }
        result
    }

    /// Deliver the caller's answer to the pending ask.
    ///
    /// Returns `false` when nothing was waiting.
    pub fn handle_ask_response(&self, reply: AskReply) -> bool {
        self.resolve_ask(None, reply)
    }

    fn resolve_ask(&self, ts: Option<i64>, reply: AskReply) -> bool {
        let pending = {
            let mut pending = lock(&self.pending_ask);
            match (pending.as_ref(), ts) {
                (Some(p), Some(ts)) if p.ts != ts => None,
                _ => pending.take(),
            }
        };
        match pending {
            Some(pending) => pending.reply.send(reply).is_ok(),
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Subtasks and pausing
    // ------------------------------------------------------------------------

    /// Ask the owner to start a subtask under this task.
    ///
    /// On success this task is paused; the loop waits for the subtask's result before the
    /// next request.
    pub async fn spawn_subtask(&self, message: String, mode: Option<Mode>) -> Result<TaskId, TaskError> {
        self.ensure_running()?;
        let (reply, reply_rx) = oneshot::channel();
        self.signals
            .send(TaskSignal::SpawnSubtask {
                message,
                mode,
                reply,
            })
            .map_err(|_| TaskError::ManagerUnavailable)?;
        reply_rx.await.map_err(|_| TaskError::ManagerUnavailable)?
    }

    /// Mark the task paused while a subtask runs. Called by the owner.
    pub(crate) fn mark_paused(&self) {
        let (tx, rx) = oneshot::channel();
        *lock(&self.resume_tx) = Some(tx);
        *lock(&self.resume_rx) = Some(rx);
        *lock(&self.paused_mode) = Some(self.mode_state.get());
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!(task_id = %self.id, "Task paused for subtask");
        self.emit(TaskEvent::Paused);
    }

    /// Resume after a subtask finished, handing its result to the loop.
    ///
    /// Returns `false` if the task was not paused.
    pub fn resume_paused_task(&self, result: impl Into<String>) -> bool {
        let Some(tx) = lock(&self.resume_tx).take() else {
            return false;
        };
        self.paused.store(false, Ordering::SeqCst);
        let delivered = tx.send(result.into()).is_ok();
        tracing::info!(task_id = %self.id, delivered, "Task resumed after subtask");
        self.emit(TaskEvent::Unpaused);
        delivered
    }

    /// Block until a running subtask hands back its result.
    ///
    /// If the caller switched modes while the subtask ran, the mode active before pausing is
    /// restored and the loop waits a short settle delay.
    pub(super) async fn wait_for_resume(&self) -> Result<Option<String>, TaskError> {
        let Some(resume) = lock(&self.resume_rx).take() else {
            return Ok(None);
        };
        tracing::debug!(task_id = %self.id, "Waiting for subtask to finish");

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TaskError::Aborted(self.id)),
            result = resume => result.map_err(|_| TaskError::ManagerUnavailable)?,
        };

        let paused_mode = lock(&self.paused_mode).take();
        if let Some(mode) = paused_mode {
            if self.mode_state.get() != mode {
                tracing::info!(task_id = %self.id, mode = %mode, "Restoring mode after subtask");
                self.mode_state.set(mode);
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(TaskError::Aborted(self.id)),
                    _ = tokio::time::sleep(self.ctx.config.mode_switch_settle) => {}
                }
            }
        }
        Ok(Some(result))
    }

    // ------------------------------------------------------------------------
    // Abort and disposal
    // ------------------------------------------------------------------------

    /// Abort the task. Idempotent.
    ///
    /// An abandoned task has been replaced; its in-flight work becomes a no-op.
    pub async fn abort_task(&self, is_abandoned: bool) {
        let reason = if is_abandoned {
            AbortReason::Abandoned
        } else {
            AbortReason::UserCancelled
        };
        self.abort_with(reason).await;
    }

    pub async fn abort_with(&self, reason: AbortReason) {
        if self.abort.swap(true, Ordering::SeqCst) {
            if reason == AbortReason::Abandoned {
                self.abandoned.store(true, Ordering::SeqCst);
            }
            return;
        }

        tracing::info!(task_id = %self.id, instance_id = %self.instance_id, ?reason, "Aborting task");
        *lock(&self.abort_reason) = Some(reason);
        *lock(&self.status) = HistoryStatus::Aborted;
        self.cancel.cancel();
        lock(&self.pending_ask).take();

        self.emit(TaskEvent::Aborted { reason });
        self.dispose();
        self.persist().await;

        if reason == AbortReason::Abandoned {
            self.abandoned.store(true, Ordering::SeqCst);
        }
    }

    /// Release everything the task holds. Idempotent.
    pub fn dispose(&self) {
        self.cancel.cancel();
        if self.resources.dispose_all() {
            tracing::debug!(task_id = %self.id, "Task resources released");
        }
    }

    // ------------------------------------------------------------------------
    // Streaming flag
    // ------------------------------------------------------------------------

    pub(super) fn streaming_guard(&self) -> StreamingGuard<'_> {
        self.streaming.send_replace(true);
        StreamingGuard { task: self }
    }

    /// Wait until no response is being streamed. Returns `false` on timeout.
    pub async fn wait_until_not_streaming(&self, timeout: Duration) -> bool {
        let mut rx = self.streaming.subscribe();
        let done = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|streaming| !*streaming)).await,
            Ok(Ok(_))
        );
        done
    }

    // ------------------------------------------------------------------------
    // History and statistics
    // ------------------------------------------------------------------------

    pub(super) async fn add_to_history(&self, message: ApiMessage) -> Result<(), TaskError> {
        if self.is_abandoned() {
            return Err(TaskError::Abandoned(self.id));
        }
        self.history.lock().await.push(message);
        self.save_history().await;
        Ok(())
    }

    /// Replace the whole history in one step.
    pub async fn overwrite_history(&self, messages: Vec<ApiMessage>) -> Result<(), TaskError> {
        if self.is_abandoned() {
            return Err(TaskError::Abandoned(self.id));
        }
        *self.history.lock().await = messages;
        self.save_history().await;
        Ok(())
    }

    pub(super) fn set_task_text(&self, text: &str) {
        *lock(&self.task_text) = Some(text.to_string());
    }

    pub(super) fn set_status(&self, status: HistoryStatus) {
        *lock(&self.status) = status;
    }

    pub(super) fn next_tool_use_id(&self) -> String {
        format!("toolu_{}", self.tool_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub(super) fn increment_mistakes(&self) -> u32 {
        let mut stats = lock(&self.stats);
        stats.mistakes += 1;
        stats.mistakes
    }

    pub(super) fn reset_mistakes(&self) {
        lock(&self.stats).mistakes = 0;
    }

    pub(super) fn record_tool_attempt(&self, tool: &str) {
        lock(&self.stats)
            .tool_usage
            .entry(tool.to_string())
            .or_default()
            .attempts += 1;
    }

    pub(super) fn record_tool_failure(&self, tool: &str) {
        lock(&self.stats)
            .tool_usage
            .entry(tool.to_string())
            .or_default()
            .failures += 1;
    }

    pub(super) fn set_last_context_tokens(&self, tokens: u64) {
        lock(&self.stats).last_context_tokens = tokens;
    }

    /// Fold one request's usage into the task totals.
    pub(super) fn add_usage(&self, usage: &TokenUsage) {
        let total = {
            let mut stats = lock(&self.stats);
            stats.usage.add(usage);
            if usage.context_tokens() > 0 {
                stats.last_context_tokens = usage.context_tokens();
            }
            stats.usage.clone()
        };
        self.emit(TaskEvent::TokenUsageUpdated { usage: total });
    }

    pub(super) fn with_gate<R>(&self, f: impl FnOnce(&mut AutoApprovalGate) -> R) -> R {
        f(&mut lock(&self.gate))
    }

    pub(super) fn with_repetition<R>(&self, f: impl FnOnce(&mut ToolRepetitionDetector) -> R) -> R {
        f(&mut lock(&self.repetition))
    }

    pub(super) fn with_messages<R>(&self, f: impl FnOnce(&mut MessageLog) -> R) -> R {
        f(&mut lock(&self.messages))
    }

    /// Summary record of the task as it stands.
    ///
    /// # Errors
    /// `TaskError::ModeNotInitialized` before the mode is resolved.
    pub fn history_item(&self) -> Result<HistoryItem, TaskError> {
        let mode = self.mode()?;
        let usage = self.token_usage();
        Ok(HistoryItem {
            id: self.id,
            number: self.task_number,
            ts: self.created_ts,
            updated_ts: chrono::Utc::now().timestamp_millis(),
            task: self.task_text().unwrap_or_default(),
            tokens_in: usage.input_tokens,
            tokens_out: usage.output_tokens,
            cache_writes: usage.cache_write_tokens,
            cache_reads: usage.cache_read_tokens,
            total_cost: usage.total_cost,
            mode,
            parent_id: self.parent_id,
            root_id: self.root_id,
            source: if self.is_background() {
                TaskSource::Agent
            } else {
                TaskSource::User
            },
            status: self.status(),
        })
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Write history, display log and history record. Failures are logged, not raised.
    pub async fn persist(&self) {
        self.save_history().await;
        self.save_messages().await;
        self.save_history_item().await;
    }

    async fn save_history(&self) {
        if self.is_abandoned() {
            return;
        }
        let snapshot = self.history.lock().await.clone();
        if let Err(e) = self.ctx.store.write_history(self.id, &snapshot).await {
            tracing::warn!(task_id = %self.id, "Failed to save conversation history: {}", e);
        }
    }

    pub(super) async fn save_messages(&self) {
        if self.is_abandoned() {
            return;
        }
        let snapshot = self.messages();
        if let Err(e) = self.ctx.store.write_display_messages(self.id, &snapshot).await {
            tracing::warn!(task_id = %self.id, "Failed to save display messages: {}", e);
        }
    }

    pub(super) async fn save_history_item(&self) {
        if self.is_abandoned() {
            return;
        }
        match self.history_item() {
            Ok(item) => {
                if let Err(e) = self.ctx.store.save_history_item(&item).await {
                    tracing::warn!(task_id = %self.id, "Failed to save history item: {}", e);
                }
            }
            Err(e) => tracing::debug!(task_id = %self.id, "History item not saved: {}", e),
        }
    }

    pub(super) fn track_usage_drain(&self, done: oneshot::Receiver<()>) {
        lock(&self.usage_drains).push(done);
    }

    /// Wait for every background usage drain started so far.
    async fn settle_usage_drains(&self) {
        let pending = std::mem::take(&mut *lock(&self.usage_drains));
        for done in pending {
            let _ = done.await;
        }
    }

    // ------------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------------

    /// Drive the task to its end and report how it ended.
    ///
    /// Completion emits `TaskEvent::Completed`; any other failure aborts the task.
    pub async fn run(self: Arc<Self>, start: TaskStart) -> TaskExit {
        let result = match start {
            TaskStart::New { text, images } => self.start(text, images).await,
            TaskStart::Resume => self.resume_from_history().await,
        };

        match result {
            Ok(result) => {
                self.settle_usage_drains().await;
                self.set_status(HistoryStatus::Completed);
                self.persist().await;
                tracing::info!(task_id = %self.id, "Task completed");
                self.emit(TaskEvent::Completed {
                    result: result.clone(),
                    token_usage: self.token_usage(),
                    tool_usage: self.tool_usage(),
                });
                TaskExit::Completed(result)
            }
            Err(e) if e.is_abort() || self.is_aborted() => {
                tracing::debug!(task_id = %self.id, "Task loop stopped: {}", e);
                TaskExit::Aborted(self.abort_reason().unwrap_or(AbortReason::Failed))
            }
            Err(e) => {
                tracing::error!(task_id = %self.id, "Task failed: {}", e);
                if let Err(say_error) = self
                    .say(SayKind::Error, MessageContent::text(e.to_string()), None)
                    .await
                {
                    tracing::debug!(task_id = %self.id, "Could not report failure: {}", say_error);
                }
                self.abort_with(AbortReason::Failed).await;
                TaskExit::Failed(e.to_string())
            }
        }
    }

    /// Seed the history with the task text and enter the loop.
    pub async fn start(self: &Arc<Self>, text: String, images: Vec<String>) -> Result<String, TaskError> {
        let mode = self.resolve_mode().await;
        self.set_task_text(&text);
        self.emit(TaskEvent::Started);
        tracing::info!(task_id = %self.id, mode = %mode, "Task started");

        self.say(
            SayKind::Task,
            MessageContent::text(text.clone()).with_images(images.clone()),
            None,
        )
        .await?;

        let mut content = vec![ContentBlock::text(format!("<task>\n{}\n</task>", text))];
        content.extend(images.iter().filter_map(|url| ContentBlock::image_from_data_url(url)));
        self.run_loop(content).await
    }

    /// Reconcile a persisted history and continue where it stopped.
    pub async fn resume_from_history(self: &Arc<Self>) -> Result<String, TaskError> {
        let mode = self.resolve_mode().await;
        self.emit(TaskEvent::Started);
        tracing::info!(task_id = %self.id, mode = %mode, "Resuming task from history");

        let was_completed = self.with_messages(|log| {
            log.pop_trailing_while(|m| {
                matches!(
                    m.kind,
                    MessageKind::Ask(AskKind::ResumeTask) | MessageKind::Ask(AskKind::ResumeCompletedTask)
                ) || m.is_partial()
            });
            log.last().map(|m| {
                matches!(
                    m.kind,
                    MessageKind::Say(SayKind::CompletionResult) | MessageKind::Ask(AskKind::CompletionResult)
                )
            })
        });
        let kind = if was_completed.unwrap_or(false) {
            AskKind::ResumeCompletedTask
        } else {
            AskKind::ResumeTask
        };

        let reply = self.ask(kind, None, None).await?;
        if reply.response == AskResponse::NoButtonClicked {
            return Err(TaskError::Declined("resume declined".to_string()));
        }

        let (history, mut content) = super::conversation::reconcile_history(self.history().await);
        self.overwrite_history(history).await?;
        self.set_status(HistoryStatus::Active);

        content.push(ContentBlock::text(super::conversation::RESUMPTION_NOTICE));
        if let Some(feedback) = reply.feedback() {
            self.say(
                SayKind::UserFeedback,
                MessageContent::text(feedback).with_images(reply.images.clone()),
                None,
            )
            .await?;
            content.push(ContentBlock::text(format!(
                "\n\nNew instructions for task continuation:\n<user_message>\n{}\n</user_message>",
                feedback
            )));
            content.extend(reply.images.iter().filter_map(|url| ContentBlock::image_from_data_url(url)));
        }

        self.run_loop(content).await
    }
}

/// Marks the task as streaming for as long as it lives.
pub(super) struct StreamingGuard<'a> {
    task: &'a Task,
}

impl Drop for StreamingGuard<'_> {
    fn drop(&mut self) {
        self.task.streaming.send_replace(false);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("task_number", &self.task_number)
            .field("parent_id", &self.parent_id)
            .field("root_id", &self.root_id())
            .field("aborted", &self.is_aborted())
            .field("paused", &self.is_paused())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::AutoResponder;
    use crate::testing::{test_context, ScriptedClient};

    fn new_task(responder: bool) -> (Arc<Task>, mpsc::UnboundedReceiver<TaskSignal>) {
        let (ctx, _) = test_context(ScriptedClient::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut options = TaskOptions::new(Arc::new(ModeState::new(Mode::default())));
        if responder {
            options = options.with_responder(Arc::new(AutoResponder::new()));
        }
        (Task::new(Arc::new(ctx), options, tx), rx)
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<TaskSignal>) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Ok(TaskSignal::Event(event)) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_abort_twice_matches_abort_once() {
        let (task, mut rx) = new_task(false);
        task.resolve_mode().await;
        task.say(SayKind::Text, MessageContent::text("working"), None)
            .await
            .unwrap();

        task.abort_task(false).await;
        let after_once = (
            task.is_aborted(),
            task.is_abandoned(),
            task.abort_reason(),
            task.status(),
            task.messages(),
            task.history().await,
            task.is_disposed(),
        );
        let first_events = drain_events(&mut rx);

        task.abort_task(false).await;
        let after_twice = (
            task.is_aborted(),
            task.is_abandoned(),
            task.abort_reason(),
            task.status(),
            task.messages(),
            task.history().await,
            task.is_disposed(),
        );

        assert_eq!(after_once, after_twice);
        assert!(drain_events(&mut rx).is_empty());
        assert_eq!(
            first_events
                .iter()
                .filter(|e| matches!(e, TaskEvent::Aborted { .. }))
                .count(),
            1
        );
        assert_eq!(after_once.2, Some(AbortReason::UserCancelled));
    }

    #[tokio::test]
    async fn test_abandoned_task_stops_writing() {
        let (task, _rx) = new_task(false);
        task.abort_task(true).await;
        assert!(task.is_abandoned());
        assert!(matches!(
            task.say(SayKind::Text, MessageContent::text("late"), None).await,
            Err(TaskError::Abandoned(_))
        ));
        assert!(task
            .overwrite_history(vec![ApiMessage::user_text("stale")])
            .await
            .is_err());
        assert!(task.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_newer_ask_supersedes_pending_one() {
        let (task, _rx) = new_task(false);
        let first = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.ask(AskKind::Followup, Some("first?".into()), None).await })
        };
        while !task.has_pending_ask() {
            tokio::task::yield_now().await;
        }

        let second = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.ask(AskKind::Followup, Some("second?".into()), None).await })
        };

        assert!(matches!(first.await.unwrap(), Err(TaskError::AskSuperseded)));
        while !task.has_pending_ask() {
            tokio::task::yield_now().await;
        }
        assert!(task.handle_ask_response(AskReply::message("answer")));
        let reply = second.await.unwrap().unwrap();
        assert_eq!(reply.text.as_deref(), Some("answer"));
        assert!(!task.handle_ask_response(AskReply::yes()));
    }

    #[tokio::test]
    async fn test_partial_ask_does_not_wait() {
        let (task, _rx) = new_task(false);
        let result = task.ask(AskKind::Tool, Some("{}".into()), Some(true)).await;
        assert!(matches!(result, Err(TaskError::AskIgnored)));
        assert!(task.messages()[0].is_partial());
        assert!(!task.has_pending_ask());
    }

    #[tokio::test]
    async fn test_blocking_ask_reports_idle_then_active() {
        let (task, mut rx) = new_task(true);
        let reply = task
            .ask(AskKind::CompletionResult, Some(String::new()), None)
            .await
            .unwrap();
        assert_eq!(reply.response, AskResponse::YesButtonClicked);

        let events = drain_events(&mut rx);
        let idle = events.iter().position(|e| matches!(e, TaskEvent::Idle));
        let active = events.iter().position(|e| matches!(e, TaskEvent::Active));
        assert!(idle.is_some() && active.is_some() && idle < active);

        task.ask(AskKind::Tool, Some("{}".into()), None).await.unwrap();
        assert!(!drain_events(&mut rx)
            .iter()
            .any(|e| matches!(e, TaskEvent::Idle)));
    }

    #[tokio::test]
    async fn test_mode_is_unset_until_resolved() {
        let (task, _rx) = new_task(false);
        assert!(matches!(task.mode(), Err(TaskError::ModeNotInitialized)));
        assert!(matches!(task.history_item(), Err(TaskError::ModeNotInitialized)));

        task.mode_state().set(Mode::new("architect"));
        assert_eq!(task.resolve_mode().await, Mode::new("architect"));
        task.mode_state().set(Mode::new("code"));
        assert_eq!(task.mode().unwrap(), Mode::new("architect"));
    }

    #[tokio::test]
    async fn test_resume_delivers_subtask_result() {
        let (task, mut rx) = new_task(false);
        task.mark_paused();
        assert!(task.is_paused());
        assert!(task.resume_paused_task("done"));
        assert!(!task.is_paused());
        assert_eq!(task.wait_for_resume().await.unwrap().as_deref(), Some("done"));
        assert!(!task.resume_paused_task("again"));

        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| matches!(e, TaskEvent::Paused)));
        assert!(events.iter().any(|e| matches!(e, TaskEvent::Unpaused)));
    }
}
