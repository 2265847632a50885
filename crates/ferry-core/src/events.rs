//! Minimal typed event emitter.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

type Listener<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Identifies a registered listener so it can be removed with
/// [`EventEmitter::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry<T> {
    id: ListenerId,
    once: bool,
    listener: Listener<T>,
}

/// Synchronous fan-out of one event type to registered listeners.
///
/// Listeners run on the emitting task in registration order. They are
/// called without the registry lock held, so a listener may register or
/// remove listeners itself.
pub struct EventEmitter<T> {
    listeners: Arc<Mutex<Vec<Entry<T>>>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl<T: Clone + Send + 'static> EventEmitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.register(Arc::new(listener), false)
    }

    /// Register a listener that is removed after its first event.
    pub fn once<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.register(Arc::new(listener), true)
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let Ok(mut listeners) = self.listeners.lock() else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    /// Deliver an event to every listener; returns how many were called.
    pub fn emit(&self, event: T) -> usize {
        let snapshot: Vec<Listener<T>> = match self.listeners.lock() {
            Ok(mut listeners) => {
                let snapshot = listeners.iter().map(|e| e.listener.clone()).collect();
                listeners.retain(|entry| !entry.once);
                snapshot
            }
            Err(_) => {
                warn!("Event listener registry poisoned; dropping event");
                return 0;
            }
        };

        for listener in &snapshot {
            listener(event.clone());
        }
        snapshot.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn register(&self, listener: Listener<T>, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Entry { id, once, listener });
        }
        id
    }
}

impl<T> fmt::Debug for EventEmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.listeners.lock().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("EventEmitter")
            .field("listeners", &count)
            .finish()
    }
}
