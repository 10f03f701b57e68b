//! LIFO stack of tasks.

use std::sync::Arc;

use thiserror::Error;

use crate::task::{Task, TaskId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StackError {
    #[error("Task {0} is not on the stack")]
    NotFound(TaskId),

    #[error("Task stack is empty")]
    Empty,
}

/// Anything that can sit on a [`TaskStack`].
pub trait StackEntry {
    fn entry_id(&self) -> TaskId;
}

impl StackEntry for Arc<Task> {
    fn entry_id(&self) -> TaskId {
        self.id()
    }
}

/// Tasks in nesting order; the top is the most recently pushed subtask.
#[derive(Debug)]
pub struct TaskStack<T: StackEntry = Arc<Task>> {
    entries: Vec<T>,
}

impl<T: StackEntry> Default for TaskStack<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: StackEntry> TaskStack<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an entry and return its 1-based position.
    pub fn push(&mut self, entry: T) -> usize {
        self.entries.push(entry);
        self.entries.len()
    }

    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop()
    }

    pub fn top(&self) -> Option<&T> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self, id: TaskId) -> Option<usize> {
        self.entries.iter().position(|e| e.entry_id() == id)
    }

    pub fn get(&self, id: TaskId) -> Option<&T> {
        self.entries.iter().find(|e| e.entry_id() == id)
    }

    /// Remove the entry at its actual position, which need not be the top.
    pub fn remove(&mut self, id: TaskId) -> Result<T, StackError> {
        let index = self.position(id).ok_or(StackError::NotFound(id))?;
        Ok(self.entries.remove(index))
    }

    /// Swap the entry with `id` for `entry` in place, returning the old one.
    pub fn replace(&mut self, id: TaskId, entry: T) -> Result<T, StackError> {
        let index = self.position(id).ok_or(StackError::NotFound(id))?;
        Ok(std::mem::replace(&mut self.entries[index], entry))
    }

    /// Ids from bottom to top.
    pub fn ids(&self) -> Vec<TaskId> {
        self.entries.iter().map(StackEntry::entry_id).collect()
    }

    /// Take every entry, top first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut entries = std::mem::take(&mut self.entries);
        entries.reverse();
        entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}
