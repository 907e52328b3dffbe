mod bins;
mod buffer_pool;
mod error;
mod file_lock;
mod id;
mod page;
mod po;
mod recovery;
mod storage;

pub mod atomic;
pub mod btree;
pub mod cache;
pub mod co;
pub mod wal;

pub use buffer_pool::{ByteBufferPool, PageBuffer};
pub use error::StorageError;
pub use id::{FileId, Lsn, OperationUnitId, Rid};
pub use po::PageOperation;
pub use storage::{Setting, Storage};
