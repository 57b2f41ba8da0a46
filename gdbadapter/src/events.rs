/// Async event dispatch for the GDB controller
///
/// Async records (`*stopped`, `=thread-created`, ...) are routed by class name
/// to at most one registered callback each. Dispatch runs on a single task, so
/// callbacks are invoked one at a time in arrival order.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use crate::types::{AsyncRecord, Payload};

/// Callback invoked with the payload of a matching async record
pub type AsyncCallback = Arc<dyn Fn(&Payload) + Send + Sync>;

/// Class name → callback, shared between the caller and the dispatch task
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: Arc<Mutex<HashMap<String, AsyncCallback>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the callback for `class`
    pub fn register<F>(&self, class: &str, callback: F)
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        let replaced = self
            .lock()
            .insert(class.to_string(), Arc::new(callback))
            .is_some();
        log::debug!("Registered callback for '{}' (replaced: {})", class, replaced);
    }

    /// Remove the callback for `class`, returning whether one was installed
    pub fn unregister(&self, class: &str) -> bool {
        self.lock().remove(class).is_some()
    }

    pub fn get(&self, class: &str) -> Option<AsyncCallback> {
        self.lock().get(class).cloned()
    }

    /// Invoke the callback registered for this record's class, if any
    ///
    /// The lock is released before the callback runs, so callbacks may
    /// register or replace callbacks themselves. A panicking callback is
    /// logged and does not stop later dispatches.
    pub fn dispatch(&self, record: &AsyncRecord) -> bool {
        let Some(callback) = self.get(&record.class) else {
            return false;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| callback(&record.payload))).is_err() {
            log::error!("ASYNC: callback for '{}' panicked", record.class);
        }
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AsyncCallback>> {
        // a panicking callback never holds this lock, so poisoning is benign
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Run the dispatch loop until the event queue closes or shutdown is signalled
pub async fn run_dispatch(
    registry: CallbackRegistry,
    mut events: mpsc::UnboundedReceiver<AsyncRecord>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::debug!("GDB event dispatcher started");

    loop {
        let record = tokio::select! {
            record = events.recv() => match record {
                Some(record) => record,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        if registry.dispatch(&record) {
            log::debug!("ASYNC: class={} dispatched", record.class);
        } else {
            log::trace!("ASYNC: class={} has no callback", record.class);
        }
    }

    log::debug!("GDB event dispatcher stopped");
}
