use crate::error::StorageError;
use std::fs::File;
use syscalls::{syscall2, Errno, Sysno};

pub(crate) trait FileLock: Sized {
    /// Takes an exclusive lock without waiting. Fails with [`StorageError::InvalidState`] when
    /// another process already holds it.
    fn acquire_lock(self) -> anyhow::Result<Self>;
}

#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
impl FileLock for File {
    fn acquire_lock(self) -> anyhow::Result<Self> {
        let fd = self.as_raw_fd();
        const LOCK_EX: usize = 0x2;
        const LOCK_NB: usize = 0x4;
        let result = unsafe { syscall2(Sysno::flock, fd as usize, LOCK_EX | LOCK_NB) };
        match result {
            Ok(_) => Ok(self),
            Err(err) if err == Errno::EAGAIN => Err(StorageError::InvalidState(
                "storage is already opened by another process".to_string(),
            )
            .into()),
            Err(err) => Err(anyhow::anyhow!("cannot lock file {fd} errno={err}")),
        }
    }
}
