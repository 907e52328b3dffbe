use crate::error::StorageError;
use crate::id::OperationUnitId;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Named reader/writer locks protecting components such as trees.
///
/// The exclusive side is owned by an atomic operation, reentrant for it, and held until the
/// operation ends. The shared side is taken by readers for a short batch of reads.
pub struct ComponentLocks {
    timeout: Duration,
    state: Mutex<HashMap<String, LockState>>,
    cond: Condvar,
}

#[derive(Default)]
struct LockState {
    owner: Option<OperationUnitId>,
    depth: usize,
    readers: usize,
}

impl LockState {
    fn is_free(&self) -> bool {
        self.owner.is_none() && self.readers == 0
    }
}

impl ComponentLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn timed_out(&self, component: &str) -> anyhow::Error {
        StorageError::LockTimeout {
            resource: format!("component {component}"),
            waited: self.timeout,
        }
        .into()
    }

    /// Returns true when this call took the lock, false when `unit` already held it.
    pub fn acquire_exclusive(
        &self,
        component: &str,
        unit: OperationUnitId,
    ) -> anyhow::Result<bool> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();
        loop {
            let lock = state.entry(component.to_string()).or_default();
            if lock.owner == Some(unit) {
                lock.depth += 1;
                return Ok(false);
            }
            if lock.is_free() {
                lock.owner = Some(unit);
                lock.depth = 1;
                log::trace!("component_locked component={component} unit={unit}");
                return Ok(true);
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                state.retain(|_, lock| !lock.is_free());
                return Err(self.timed_out(component));
            }
        }
    }

    /// Drops every exclusive lock owned by `unit`, whatever its depth.
    pub fn release_all(&self, unit: OperationUnitId) {
        let mut state = self.state.lock();
        let mut released = false;
        state.retain(|_, lock| {
            if lock.owner == Some(unit) {
                lock.owner = None;
                lock.depth = 0;
                released = true;
            }
            !lock.is_free()
        });
        drop(state);
        if released {
            self.cond.notify_all();
        }
    }

    pub fn acquire_shared(self: &Arc<Self>, component: &str) -> anyhow::Result<SharedLockGuard> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();
        loop {
            let lock = state.entry(component.to_string()).or_default();
            if lock.owner.is_none() {
                lock.readers += 1;
                return Ok(SharedLockGuard {
                    locks: self.clone(),
                    component: component.to_string(),
                });
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                state.retain(|_, lock| !lock.is_free());
                return Err(self.timed_out(component));
            }
        }
    }

    fn release_shared(&self, component: &str) {
        let mut state = self.state.lock();
        if let Some(lock) = state.get_mut(component) {
            lock.readers = lock.readers.saturating_sub(1);
            if lock.is_free() {
                state.remove(component);
            }
        }
        drop(state);
        self.cond.notify_all();
    }

    pub fn is_locked(&self, component: &str) -> bool {
        self.state
            .lock()
            .get(component)
            .is_some_and(|lock| lock.owner.is_some())
    }
}

pub struct SharedLockGuard {
    locks: Arc<ComponentLocks>,
    component: String,
}

impl Drop for SharedLockGuard {
    fn drop(&mut self) {
        self.locks.release_shared(&self.component);
    }
}
