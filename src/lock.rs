//! Per-identity lock serialising concurrent opens

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::debug;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Held exclusive `flock` on a lock file; released on drop or process death
pub struct OpenLock {
    _lock: Flock<File>,
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out waiting for lock")]
    TimedOut,
    #[error("lock file error: {0}")]
    Io(#[from] io::Error),
}

pub async fn acquire(path: &Path, limit: Duration) -> Result<OpenLock, LockError> {
    let deadline = Instant::now() + limit;
    let mut announced = false;

    loop {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => return Ok(OpenLock { _lock: lock }),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                if !announced {
                    debug!(path = %path.display(), "waiting for another open of this tunnel");
                    announced = true;
                }
                if Instant::now() >= deadline {
                    return Err(LockError::TimedOut);
                }
                sleep(LOCK_POLL_INTERVAL).await;
            }
            Err((_, errno)) => return Err(LockError::Io(io::Error::from(errno))),
        }
    }
}
