//! The serial stack for interactive work.
//!
//! Exactly one task, the top, is active. Pushing a subtask pauses its caller; completing it
//! pops it and hands the result back.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::stack::{StackError, TaskStack};
use crate::task::{ModeState, Task, TaskId};

#[derive(Debug)]
pub struct TaskStackManager {
    stack: Mutex<TaskStack>,
    mode_state: Arc<ModeState>,
}

impl TaskStackManager {
    pub fn new(mode_state: Arc<ModeState>) -> Self {
        Self {
            stack: Mutex::new(TaskStack::new()),
            mode_state,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskStack> {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The caller's current mode, shared by every task on this stack.
    pub fn mode_state(&self) -> Arc<ModeState> {
        Arc::clone(&self.mode_state)
    }

    pub fn push(&self, task: Arc<Task>) -> usize {
        let depth = self.lock().push(task);
        tracing::debug!(depth, "Pushed task onto user stack");
        depth
    }

    pub fn pop(&self) -> Option<Arc<Task>> {
        self.lock().pop()
    }

    /// The active task.
    pub fn current(&self) -> Option<Arc<Task>> {
        self.lock().top().cloned()
    }

    pub fn depth(&self) -> usize {
        self.lock().len()
    }

    pub fn find(&self, id: TaskId) -> Option<Arc<Task>> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: TaskId) -> Result<Arc<Task>, StackError> {
        self.lock().remove(id)
    }

    pub fn replace(&self, id: TaskId, task: Arc<Task>) -> Result<Arc<Task>, StackError> {
        self.lock().replace(id, task)
    }

    /// Take every task off the stack, top first.
    pub fn clear(&self) -> Vec<Arc<Task>> {
        self.lock().drain()
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.lock().ids()
    }
}
