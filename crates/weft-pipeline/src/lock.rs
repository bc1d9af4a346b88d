use crate::errors::WeftError;
use std::time::Duration;
use weft_store::{LockRecord, WorkspaceStore, now_millis};

const CONTENTION_POLL: Duration = Duration::from_millis(50);

/// Serializes cross-process runs against one workspace. Acquisition uses
/// the filesystem's atomic create-if-absent; an expired record is treated
/// as stale and overwritten; a held lock is renewed at half the timeout
/// interval so legitimate long runs never look stale.
#[derive(Clone)]
pub struct LockManager {
    store: WorkspaceStore,
    timeout: Duration,
    wait: Duration,
}

impl LockManager {
    pub fn new(store: WorkspaceStore, timeout: Duration, wait: Duration) -> Self {
        Self {
            store,
            timeout,
            wait,
        }
    }

    /// Blocks (bounded by the configured wait) until the lock is held.
    /// Returns the overridden record when a stale lock was taken over.
    pub async fn acquire(&self) -> Result<(LockGuard, Option<LockRecord>), WeftError> {
        let deadline = tokio::time::Instant::now() + self.wait;
        loop {
            let record = self.fresh_record();
            if self.store.try_create_lock(&record)? {
                return Ok((self.guard(record), None));
            }

            match self.store.read_lock()? {
                // The holder released between our create and read; retry
                // immediately.
                None => continue,
                Some(existing) if existing.is_expired(now_millis()) => {
                    let record = self.fresh_record();
                    self.store.replace_lock(&record)?;
                    return Ok((self.guard(record), Some(existing)));
                }
                Some(existing) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(WeftError::LockContention {
                            holder_pid: existing.holder_pid,
                            holder_host: existing.holder_host,
                        });
                    }
                    tokio::time::sleep(CONTENTION_POLL).await;
                }
            }
        }
    }

    fn fresh_record(&self) -> LockRecord {
        let now = now_millis();
        LockRecord {
            holder_pid: std::process::id(),
            holder_host: whoami::fallible::hostname()
                .unwrap_or_else(|_| "unknown-host".to_string()),
            acquired_at: now,
            expires_at: now + self.timeout.as_millis() as u64,
        }
    }

    fn guard(&self, record: LockRecord) -> LockGuard {
        let renew_store = self.store.clone();
        let renew_timeout = self.timeout;
        let renew_record = record.clone();
        let renew_task = tokio::spawn(async move {
            let interval = renew_timeout / 2;
            loop {
                tokio::time::sleep(interval).await;
                let now = now_millis();
                let renewed = LockRecord {
                    expires_at: now + renew_timeout.as_millis() as u64,
                    ..renew_record.clone()
                };
                if renew_store.replace_lock(&renewed).is_err() {
                    // The workspace disappeared under us; the next write in
                    // the run will surface the real failure.
                    return;
                }
            }
        });

        LockGuard {
            store: self.store.clone(),
            record,
            renew_task: Some(renew_task),
            released: false,
        }
    }
}

#[derive(Debug)]
pub struct LockGuard {
    store: WorkspaceStore,
    record: LockRecord,
    renew_task: Option<tokio::task::JoinHandle<()>>,
    released: bool,
}

impl LockGuard {
    pub fn holder_pid(&self) -> u32 {
        self.record.holder_pid
    }

    pub fn expires_at(&self) -> u64 {
        self.record.expires_at
    }

    pub fn release(mut self) -> Result<(), WeftError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), WeftError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if let Some(task) = self.renew_task.take() {
            task.abort();
        }
        // Only delete a record this guard owns; a stale takeover by
        // another process must not be clobbered.
        if let Some(existing) = self.store.read_lock()? {
            if existing.holder_pid == self.record.holder_pid
                && existing.acquired_at == self.record.acquired_at
            {
                self.store.remove_lock()?;
            }
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.release_inner();
    }
}
