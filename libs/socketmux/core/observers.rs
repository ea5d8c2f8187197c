//! Explicit observer registries
//!
//! Handlers are invoked synchronously, in registration order, on the task
//! that raised the event. The handler list is snapshotted before invocation
//! so a handler may add or remove handlers (including itself) without
//! deadlocking.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by [`ObserverRegistry::add`], used to remove the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct ObserverRegistry<E> {
    handlers: RwLock<Vec<(ObserverId, Handler<E>)>>,
    next_id: AtomicU64,
}

impl<E> ObserverRegistry<E> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add<F>(&self, handler: F) -> ObserverId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Returns `true` if the handler was registered
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in snapshot {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for ObserverRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}
