//! Independent stacks for background work, one per root task.
//!
//! # Invariants
//! - The pool holds a group for a root id iff at least one task of that lineage is resident.
//! - Removal works under the map read lock. Only a removal that empties its group takes the
//!   write lock, and it deletes the group only if it is still empty and still mapped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::RwLock;

use super::stack::{StackError, TaskStack};
use crate::task::{ModeState, Task, TaskId};

/// One lineage: a root task and its nested subtasks.
#[derive(Debug)]
pub struct AgentRootGroup {
    root_id: TaskId,
    mode_state: Arc<ModeState>,
    stack: Mutex<TaskStack>,
}

impl AgentRootGroup {
    fn new(root_id: TaskId, mode_state: Arc<ModeState>) -> Self {
        Self {
            root_id,
            mode_state,
            stack: Mutex::new(TaskStack::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskStack> {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root_id(&self) -> TaskId {
        self.root_id
    }

    /// The mode state this lineage's tasks inherit from.
    pub fn mode_state(&self) -> Arc<ModeState> {
        Arc::clone(&self.mode_state)
    }

    pub fn depth(&self) -> usize {
        self.lock().len()
    }

    pub fn top(&self) -> Option<Arc<Task>> {
        self.lock().top().cloned()
    }
}

#[derive(Debug, Default)]
pub struct AgentTaskPool {
    groups: RwLock<HashMap<TaskId, Arc<AgentRootGroup>>>,
}

impl AgentTaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new lineage with `task` at the bottom.
    ///
    /// The group is keyed by the task's root id. A resumed subtask whose lineage is still
    /// resident joins that group instead.
    pub async fn push_root(&self, task: Arc<Task>, mode_state: Arc<ModeState>) {
        let root_id = task.root_id();
        let mut groups = self.groups.write().await;
        let group = groups.entry(root_id).or_insert_with(|| {
            tracing::debug!(root_id = %root_id, "Agent root group created");
            Arc::new(AgentRootGroup::new(root_id, mode_state))
        });
        group.lock().push(task);
    }

    /// Push a subtask onto its lineage's stack. Returns the new depth.
    pub async fn push(&self, task: Arc<Task>) -> Result<usize, StackError> {
        let root_id = task.root_id();
        let groups = self.groups.read().await;
        let group = groups.get(&root_id).ok_or(StackError::NotFound(root_id))?;
        let depth = group.lock().push(task);
        Ok(depth)
    }

    /// Remove a task at its actual position, deleting the group once it is empty.
    pub async fn remove(&self, root_id: TaskId, id: TaskId) -> Result<Arc<Task>, StackError> {
        let (task, emptied) = {
            let groups = self.groups.read().await;
            let group = groups.get(&root_id).ok_or(StackError::NotFound(id))?;
            let mut stack = group.lock();
            let task = stack.remove(id)?;
            let emptied = stack.is_empty().then(|| Arc::clone(group));
            (task, emptied)
        };

        if let Some(emptied) = emptied {
            let mut groups = self.groups.write().await;
            let still_empty = groups
                .get(&root_id)
                .is_some_and(|group| Arc::ptr_eq(group, &emptied) && group.depth() == 0);
            if still_empty {
                groups.remove(&root_id);
                tracing::debug!(root_id = %root_id, "Agent root group deleted");
            }
        }
        Ok(task)
    }

    pub async fn replace(&self, root_id: TaskId, id: TaskId, task: Arc<Task>) -> Result<Arc<Task>, StackError> {
        let groups = self.groups.read().await;
        let group = groups.get(&root_id).ok_or(StackError::NotFound(id))?;
        let old = group.lock().replace(id, task)?;
        Ok(old)
    }

    pub async fn group(&self, root_id: TaskId) -> Option<Arc<AgentRootGroup>> {
        self.groups.read().await.get(&root_id).cloned()
    }

    pub async fn find(&self, id: TaskId) -> Option<Arc<Task>> {
        let groups = self.groups.read().await;
        groups.values().find_map(|group| group.lock().get(id).cloned())
    }

    pub async fn depth(&self, root_id: TaskId) -> usize {
        self.groups
            .read()
            .await
            .get(&root_id)
            .map(|group| group.depth())
            .unwrap_or(0)
    }

    pub async fn roots(&self) -> Vec<TaskId> {
        self.groups.read().await.keys().copied().collect()
    }

    /// Take every task out of the pool, deepest first within each lineage.
    pub async fn drain(&self) -> Vec<Arc<Task>> {
        let groups = std::mem::take(&mut *self.groups.write().await);
        let mut tasks = Vec::new();
        for group in groups.into_values() {
            tasks.extend(group.lock().drain());
        }
        tasks
    }
}
