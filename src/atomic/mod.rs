mod lock;
mod manager;
mod operation;

pub use lock::{ComponentLocks, SharedLockGuard};
pub use manager::{AtomicOperationsManager, CommitFreeze};
pub use operation::{AtomicOperation, ChangesCollector, OperationState};
