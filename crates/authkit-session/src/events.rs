//! Typed publish/subscribe channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Error descriptor published on the error channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub message: String,
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Registry<E> = Mutex<Vec<(u64, Handler<E>)>>;

/// Typed observer registry with synchronous, ordered fan-out.
pub struct Publisher<E: 'static> {
    registry: Arc<Registry<E>>,
    next_id: AtomicU64,
}

impl<E: 'static> Publisher<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a handler. The returned [`Subscription`] deregisters only
    /// through its explicit `unsubscribe` call; dropping it leaves the
    /// handler in place.
    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.registry.lock().unwrap().push((id, Arc::new(handler)));
        Subscription::new(id, Arc::downgrade(&self.registry))
    }

    /// Invoke all current handlers in subscription order.
    ///
    /// Handlers are snapshotted before the first invocation, so a handler
    /// that unsubscribes another (or itself) affects later emissions only.
    pub fn publish(&self, event: &E) {
        let handlers: Vec<Handler<E>> = {
            let registry = self.registry.lock().unwrap();
            registry.iter().map(|(_, handler)| handler.clone()).collect()
        };

        for handler in handlers {
            handler(event);
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }
}

impl<E: 'static> Default for Publisher<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Deregistration handle returned by [`Publisher::subscribe`].
pub struct Subscription {
    cancel: Box<dyn FnOnce() + Send>,
}

impl Subscription {
    fn new<E: 'static>(id: u64, registry: Weak<Registry<E>>) -> Self {
        Subscription {
            cancel: Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.lock().unwrap().retain(|(sid, _)| *sid != id);
                }
            }),
        }
    }

    /// Remove the handler from the registry. Safe to call while an
    /// emission is in flight; the current emission is unaffected.
    pub fn unsubscribe(self) {
        (self.cancel)();
    }
}
