use crate::error::StorageError;
use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pool of fixed-size page buffers. Buffers are handed out as [`PageBuffer`] handles which go back
/// to the pool when dropped, so a buffer can't be released twice.
#[derive(Clone)]
pub struct ByteBufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    page_size: usize,
    max_pooled: usize,
    limit: Option<usize>,
    acquire_timeout: Duration,

    state: Mutex<PoolState>,
    released: Condvar,
}

struct PoolState {
    free: Vec<Box<[u8]>>,
    allocated: usize,
}

impl ByteBufferPool {
    pub fn new(page_size: usize, max_pooled: usize) -> Self {
        Self::with_limit(page_size, max_pooled, None, Duration::from_secs(10))
    }

    /// Creates a pool that never keeps more than `limit` buffers alive. Acquiring a buffer while
    /// the limit is reached waits up to `acquire_timeout` for another buffer to be dropped.
    pub fn with_limit(
        page_size: usize,
        max_pooled: usize,
        limit: Option<usize>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                page_size,
                max_pooled,
                limit,
                acquire_timeout,
                state: Mutex::new(PoolState {
                    free: Vec::with_capacity(max_pooled.min(1024)),
                    allocated: 0,
                }),
                released: Condvar::new(),
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    pub fn acquire_direct(&self, clear: bool) -> anyhow::Result<PageBuffer> {
        let deadline = Instant::now() + self.inner.acquire_timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(mut data) = state.free.pop() {
                drop(state);
                if clear {
                    data.fill(0);
                }
                return Ok(PageBuffer {
                    data: Some(data),
                    pool: self.inner.clone(),
                });
            }

            let Some(limit) = self.inner.limit else {
                break;
            };
            if state.allocated < limit {
                break;
            }
            if self
                .inner
                .released
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(StorageError::LockTimeout {
                    resource: "page buffer".to_string(),
                    waited: self.inner.acquire_timeout,
                }
                .into());
            }
        }

        state.allocated += 1;
        drop(state);

        let data = match Self::allocate(self.inner.page_size) {
            Ok(data) => data,
            Err(err) => {
                self.inner.state.lock().allocated -= 1;
                self.inner.released.notify_one();
                return Err(err);
            }
        };
        Ok(PageBuffer {
            data: Some(data),
            pool: self.inner.clone(),
        })
    }

    fn allocate(page_size: usize) -> anyhow::Result<Box<[u8]>> {
        let mut data = Vec::new();
        if data.try_reserve_exact(page_size).is_err() {
            return Err(StorageError::ResourceExhausted(format!(
                "cannot allocate page buffer of {page_size} bytes"
            ))
            .into());
        }
        data.resize(page_size, 0);
        Ok(data.into_boxed_slice())
    }

    pub fn release(&self, buffer: PageBuffer) {
        drop(buffer);
    }

    pub fn allocated(&self) -> usize {
        self.inner.state.lock().allocated
    }

    pub fn pooled(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    pub fn used_memory(&self) -> usize {
        self.allocated() * self.inner.page_size
    }
}

pub struct PageBuffer {
    data: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl Deref for PageBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PageBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer").field("len", &self.len()).finish()
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        let Some(data) = self.data.take() else {
            return;
        };
        let mut state = self.pool.state.lock();
        if state.free.len() < self.pool.max_pooled {
            state.free.push(data);
        } else {
            state.allocated -= 1;
        }
        drop(state);
        self.pool.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_are_reused() {
        let pool = ByteBufferPool::new(256, 4);
        let mut buff = pool.acquire_direct(true).unwrap();
        assert_eq!(256, buff.len());
        buff[0] = 42;
        pool.release(buff);
        assert_eq!(1, pool.allocated());
        assert_eq!(1, pool.pooled());

        let buff = pool.acquire_direct(false).unwrap();
        assert_eq!(42, buff[0], "dirty buffer should be handed out as is");
        assert_eq!(0, pool.pooled());
        drop(buff);

        let buff = pool.acquire_direct(true).unwrap();
        assert_eq!(0, buff[0]);
        assert_eq!(256, pool.used_memory());
    }

    #[test]
    fn test_pool_over_capacity_frees_memory() {
        let pool = ByteBufferPool::new(128, 1);
        let a = pool.acquire_direct(true).unwrap();
        let b = pool.acquire_direct(true).unwrap();
        assert_eq!(2, pool.allocated());
        drop(a);
        drop(b);
        assert_eq!(1, pool.allocated());
        assert_eq!(1, pool.pooled());
    }

    #[test]
    fn test_limit_times_out() {
        let pool = ByteBufferPool::with_limit(128, 4, Some(1), Duration::from_millis(20));
        let held = pool.acquire_direct(true).unwrap();
        let err = pool.acquire_direct(true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::LockTimeout { .. })
        ));

        drop(held);
        pool.acquire_direct(true).unwrap();
    }

    #[test]
    fn test_limit_waits_for_release() {
        let pool = ByteBufferPool::with_limit(128, 4, Some(1), Duration::from_secs(5));
        let held = pool.acquire_direct(true).unwrap();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(held);
        });
        let buff = pool.acquire_direct(true).unwrap();
        assert_eq!(128, buff.len());
        releaser.join().unwrap();
    }
}
