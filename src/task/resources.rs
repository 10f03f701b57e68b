//! Handles a task holds on to and releases exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::task::JoinHandle;

/// Something released when its task is disposed.
pub trait Disposable: Send {
    fn dispose(self: Box<Self>);
}

/// Background work tied to a task is stopped on disposal.
impl Disposable for JoinHandle<()> {
    fn dispose(self: Box<Self>) {
        self.abort();
    }
}

/// Resources owned by one task.
///
/// # Invariants
/// - Every registered resource is disposed exactly once.
/// - Resources registered after disposal are disposed immediately.
#[derive(Default)]
pub struct TaskResources {
    disposed: AtomicBool,
    items: Mutex<Vec<Box<dyn Disposable>>>,
}

impl TaskResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, item: Box<dyn Disposable>) {
        if self.disposed.load(Ordering::SeqCst) {
            item.dispose();
            return;
        }
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        // Disposal may have started while waiting for the lock.
        if self.disposed.load(Ordering::SeqCst) {
            drop(items);
            item.dispose();
        } else {
            items.push(item);
        }
    }

    /// Release everything. Returns `false` if this already happened.
    pub fn dispose_all(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let items = std::mem::take(&mut *self.items.lock().unwrap_or_else(|e| e.into_inner()));
        for item in items {
            item.dispose();
        }
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Counter(Arc<AtomicUsize>);

    impl Disposable for Counter {
        fn dispose(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dispose_runs_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let resources = TaskResources::new();
        resources.register(Box::new(Counter(count.clone())));
        resources.register(Box::new(Counter(count.clone())));

        assert!(resources.dispose_all());
        assert!(!resources.dispose_all());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(resources.is_empty());

        resources.register(Box::new(Counter(count.clone())));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_join_handles_are_aborted() {
        let resources = TaskResources::new();
        let (guard, dropped) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await
        });
        resources.register(Box::new(handle));
        resources.dispose_all();
        assert!(dropped.await.is_err());
    }
}
