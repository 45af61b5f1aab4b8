use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

struct EventState {
    id: u64,
    done: Mutex<bool>,
    cond: Condvar,
}

/// Completion signal of a submitted operation. Clones observe the same signal.
#[derive(Clone)]
pub struct Event {
    state: Arc<EventState>,
}

impl Event {
    pub fn new(set: bool) -> Self {
        Self {
            state: Arc::new(EventState {
                id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
                done: Mutex::new(set),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn completed() -> Self {
        Self::new(true)
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn is_set(&self) -> bool {
        *self.state.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self) {
        let mut done = self.state.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.state.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut done = self.state.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self.state.cond.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("id", &self.id()).field("set", &self.is_set()).finish()
    }
}
