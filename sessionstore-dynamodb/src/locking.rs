//! Pessimistic per-session locking on top of conditional writes.
//!
//! A lock is the `locked_at` attribute of the session record. It is taken by
//! a single conditional update that succeeds only when the record exists and
//! `locked_at` is absent or older than `lock_expiry_time`, so acquiring a
//! free lock and busting an abandoned one are the same atomic step. It is
//! released by the write that persists the session, which removes
//! `locked_at` under the condition that it still holds the value this holder
//! wrote. A holder whose lock was busted therefore gets a conditional-check
//! failure instead of overwriting newer data.

use crate::error::{BackendError, SessionError, SessionResult};
use crate::record::{LOCKED_AT, RecordStore, SessionRecord, now_seconds};
use crate::table::{AttrValue, Condition, ReturnValues, UpdateItem};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Proof of a held lock: the `locked_at` value this holder wrote.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockMarker {
    acquired_at: f64,
}

impl LockMarker {
    /// Seconds since the epoch when the lock was taken.
    pub fn acquired_at(&self) -> f64 {
        self.acquired_at
    }

    fn condition(&self) -> Condition {
        Condition::equals(LOCKED_AT, AttrValue::N(self.acquired_at))
    }
}

/// A record read under a freshly taken lock.
#[derive(Debug, Clone)]
pub struct LockedRecord {
    pub record: SessionRecord,
    pub marker: LockMarker,
    /// Whether an abandoned lock had to be busted.
    pub busted: bool,
}

/// Result of one acquisition attempt.
#[derive(Debug, Clone)]
pub enum Attempt {
    Acquired(LockedRecord),
    /// Another holder's lock is still fresh.
    Busy { held_since: Option<f64> },
    /// No record with this id.
    Absent,
}

/// Serializes writers of one session across processes.
#[derive(Clone)]
pub struct LockCoordinator {
    store: RecordStore,
    expiry: Duration,
    retry_delay: Duration,
    max_wait: Duration,
}

impl LockCoordinator {
    /// Create a coordinator using the store's lock timing options.
    pub fn new(store: RecordStore) -> Self {
        let config = store.config();
        let (expiry, retry_delay, max_wait) = (
            config.lock_expiry_time,
            config.lock_retry_delay,
            config.lock_max_wait_time,
        );
        Self {
            store,
            expiry,
            retry_delay,
            max_wait,
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Acquire the lock on `id`, retrying until `lock_max_wait_time` elapses.
    ///
    /// Returns `None` when the record does not exist; a new session needs
    /// no lock.
    pub async fn acquire(&self, id: &str) -> SessionResult<Option<LockedRecord>> {
        self.acquire_until(id, Instant::now() + self.max_wait).await
    }

    /// Acquire the lock on `id`, giving up once `deadline` has passed.
    ///
    /// Every sleep is clamped to the time left, and dropping the future
    /// abandons the wait.
    pub async fn acquire_until(
        &self,
        id: &str,
        deadline: Instant,
    ) -> SessionResult<Option<LockedRecord>> {
        let start = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match self.try_acquire(id).await? {
                Attempt::Acquired(locked) => {
                    if attempts > 1 {
                        info!(
                            session_id = %id,
                            attempts,
                            waited_ms = start.elapsed().as_millis() as u64,
                            "Acquired session lock after contention"
                        );
                    }
                    return Ok(Some(locked));
                }
                Attempt::Absent => return Ok(None),
                Attempt::Busy { held_since } => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(session_id = %id, attempts, "Timed out waiting for session lock");
                        return Err(SessionError::LockWaitTimeout {
                            waited: now - start,
                        });
                    }
                    debug!(session_id = %id, attempts, ?held_since, "Session lock busy, retrying");
                    tokio::time::sleep(self.retry_delay.min(deadline - now)).await;
                }
            }
        }
    }

    /// Make one acquisition attempt.
    pub async fn try_acquire(&self, id: &str) -> SessionResult<Attempt> {
        let config = self.store.config();
        let now = now_seconds();
        let stale_before = now - self.expiry.as_secs_f64();

        let free = Condition::not_exists(LOCKED_AT)
            .or(Condition::less_than(LOCKED_AT, AttrValue::N(stale_before)));
        let request = UpdateItem::new(config.table_name.clone(), self.store.key(id))
            .set(LOCKED_AT, AttrValue::N(now))
            .condition(Condition::exists(config.table_key.clone()).and(free))
            .return_values(ReturnValues::AllOld)
            .return_current_on_failure();

        match self.store.table().update_item(request).await {
            Ok(Some(old)) => {
                let mut record = SessionRecord::from_item(&config.table_key, &old)?;
                let busted = record.locked_at.is_some();
                if busted {
                    warn!(
                        session_id = %id,
                        stale_lock = ?record.locked_at,
                        "Busting abandoned session lock"
                    );
                }
                record.locked_at = Some(now);
                Ok(Attempt::Acquired(LockedRecord {
                    record,
                    marker: LockMarker { acquired_at: now },
                    busted,
                }))
            }
            Ok(None) => Err(BackendError::service(
                "MissingReturnValues",
                "lock acquisition returned no previous item",
            )
            .into()),
            Err(BackendError::ConditionalCheckFailed { current: None }) => Ok(Attempt::Absent),
            Err(BackendError::ConditionalCheckFailed {
                current: Some(item),
            }) => Ok(Attempt::Busy {
                held_since: item.get(LOCKED_AT).and_then(AttrValue::as_f64),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist and release in one conditional write.
    ///
    /// `data` is `None` when the payload is unchanged. Fails with a
    /// conditional-check error if the lock is no longer ours.
    pub async fn commit(
        &self,
        id: &str,
        data: Option<&[u8]>,
        marker: LockMarker,
    ) -> SessionResult<()> {
        let request = self
            .store
            .update_request(id, data)
            .remove(LOCKED_AT)
            .condition(marker.condition());

        self.store.table().update_item(request).await?;
        debug!(session_id = %id, "Committed session and released lock");
        Ok(())
    }
}
