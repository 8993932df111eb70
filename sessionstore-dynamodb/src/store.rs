//! Transport-facing session store.
//!
//! [`SessionStore`] is what a web framework's session middleware talks to:
//! `find` once when the request arrives, `persist` (or `remove`) once before
//! the response leaves. Per-request state lives in the [`RequestContext`]
//! the caller passes to every call.

use crate::config::SessionConfig;
use crate::data::SessionData;
use crate::error::{BackendError, SessionError, SessionResult};
use crate::gc::{GarbageCollector, SweepReport};
use crate::handler::{DefaultErrorHandler, ErrorHandler, RequestContext};
use crate::identity::{IdentitySigner, Verification};
use crate::locking::LockCoordinator;
use crate::record::{RecordStore, SessionRecord};
use crate::table::{Condition, SessionTable};
use std::sync::Arc;
use tracing::{debug, warn};

/// Session storage over a [`SessionTable`].
///
/// With `enable_locking` set, `find` takes the record's lock and the
/// matching `persist` or `remove` releases it; otherwise reads and writes
/// are plain last-writer-wins.
///
/// # Examples
///
/// ```
/// use sessionstore_dynamodb::prelude::*;
/// use std::sync::Arc;
///
/// # tokio_test_block(async {
/// let config = SessionConfig::new("watermelon_smiles");
/// let table = Arc::new(MemoryTable::new("sessions", "session_id"));
/// let store = SessionStore::new(config, table).unwrap();
///
/// let mut ctx = RequestContext::new();
/// let (id, mut data) = store.find(&mut ctx, None).await.unwrap();
/// data.set("user_id", 42).unwrap();
/// store.persist(&mut ctx, &id, &data).await.unwrap();
///
/// let mut ctx = RequestContext::new();
/// let (same, data) = store.find(&mut ctx, Some(&id)).await.unwrap();
/// assert_eq!(same, id);
/// assert_eq!(data.get::<i64>("user_id"), Some(42));
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
pub struct SessionStore {
    config: Arc<SessionConfig>,
    signer: IdentitySigner,
    records: RecordStore,
    locks: Option<LockCoordinator>,
    handler: Arc<dyn ErrorHandler>,
}

impl SessionStore {
    /// Create a store. Fails if the configuration does not validate.
    pub fn new(config: SessionConfig, table: Arc<dyn SessionTable>) -> SessionResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let signer = IdentitySigner::new(config.secret_key.as_deref());
        let records = RecordStore::new(table, config.clone());
        let locks = config
            .enable_locking
            .then(|| LockCoordinator::new(records.clone()));
        let handler = Arc::new(DefaultErrorHandler::new(config.raise_errors));

        Ok(Self {
            config,
            signer,
            records,
            locks,
            handler,
        })
    }

    /// Replace the default error handler.
    pub fn with_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn signer(&self) -> &IdentitySigner {
        &self.signer
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn locks(&self) -> Option<&LockCoordinator> {
        self.locks.as_ref()
    }

    /// Resolve the identifier presented by the client to an id and payload.
    ///
    /// A missing identifier starts a new session. A tampered one is reported
    /// through the error handler as `InvalidIdentifier` and then also starts
    /// a new session. A valid identifier whose record no longer exists keeps
    /// its id but is written as a new record. A soft error while reading
    /// yields an empty payload once the handler has swallowed it.
    pub async fn find(
        &self,
        ctx: &mut RequestContext,
        candidate: Option<&str>,
    ) -> SessionResult<(String, SessionData)> {
        let id = match self.signer.verify(candidate)? {
            Verification::Absent => return self.new_session(ctx),
            Verification::Invalid => {
                self.handler
                    .handle_error(SessionError::InvalidIdentifier, ctx)?;
                return self.new_session(ctx);
            }
            Verification::Valid { .. } => candidate.unwrap_or_default().to_string(),
        };

        match self.load(ctx, &id).await {
            Ok(Some(data)) => Ok((id, data)),
            Ok(None) => {
                debug!(session_id = %id, "No record for session, starting over");
                ctx.mark_new_session();
                ctx.set_initial_data(None);
                Ok((id, SessionData::new()))
            }
            Err(e) => {
                self.handler.handle_error(e, ctx)?;
                Ok((id, SessionData::new()))
            }
        }
    }

    /// Write the session back.
    ///
    /// Returns the id written, or `None` when nothing was written: the
    /// payload was empty with no lock to release, locking is enabled but the
    /// lock was never taken (a swallowed error during `find`), or a soft
    /// error was swallowed by the handler.
    pub async fn persist(
        &self,
        ctx: &mut RequestContext,
        id: &str,
        data: &SessionData,
    ) -> SessionResult<Option<String>> {
        match self.write(ctx, id, data).await {
            Ok(written) => Ok(written),
            Err(e) => {
                self.handler.handle_error(e, ctx)?;
                Ok(None)
            }
        }
    }

    /// Delete the session record. Any lock held by this request goes with it.
    pub async fn remove(&self, ctx: &mut RequestContext, id: &str) -> SessionResult<()> {
        ctx.take_lock();
        match self.records.delete(id).await {
            Ok(()) => {
                ctx.set_initial_data(None);
                Ok(())
            }
            Err(e) => self.handler.handle_error(e, ctx),
        }
    }

    /// Delete the session and issue a fresh identifier for the same client.
    pub async fn regenerate(&self, ctx: &mut RequestContext, id: &str) -> SessionResult<String> {
        self.remove(ctx, id).await?;
        let (new_id, _) = self.new_session(ctx)?;
        Ok(new_id)
    }

    /// Run one garbage-collection sweep over this store's table.
    pub async fn collect_garbage(&self) -> SessionResult<SweepReport> {
        GarbageCollector::new(self.records.table().clone(), self.config.clone())
            .sweep()
            .await
    }

    fn new_session(&self, ctx: &mut RequestContext) -> SessionResult<(String, SessionData)> {
        let id = self.signer.generate()?;
        ctx.mark_new_session();
        ctx.set_initial_data(None);
        ctx.set_lock(None);
        Ok((id, SessionData::new()))
    }

    async fn load(&self, ctx: &mut RequestContext, id: &str) -> SessionResult<Option<SessionData>> {
        let record: Option<SessionRecord> = match &self.locks {
            Some(locks) => locks.acquire(id).await?.map(|locked| {
                ctx.set_lock(Some(locked.marker));
                locked.record
            }),
            None => self.records.fetch(id).await?,
        };
        let Some(record) = record else {
            return Ok(None);
        };

        ctx.clear_new_session();
        ctx.set_initial_data(record.data.clone());
        match record.data.as_deref() {
            Some(bytes) if !bytes.is_empty() => SessionData::unpack(bytes).map(Some),
            _ => Ok(Some(SessionData::new())),
        }
    }

    async fn write(
        &self,
        ctx: &mut RequestContext,
        id: &str,
        data: &SessionData,
    ) -> SessionResult<Option<String>> {
        let lock = ctx.take_lock();
        if data.is_empty() && lock.is_none() {
            debug!(session_id = %id, "Empty session, nothing to write");
            return Ok(None);
        }

        let packed = data.pack()?;
        let changed = ctx.initial_data() != Some(packed.as_slice());
        let update = changed.then_some(packed.as_slice());

        match (lock, &self.locks) {
            (Some(marker), Some(locks)) => locks.commit(id, update, marker).await?,
            _ if ctx.is_new_session() => {
                self.records.create_new(id, &packed).await?;
                ctx.clear_new_session();
            }
            (None, Some(_)) => {
                warn!(session_id = %id, "Session lock not held, discarding write");
                return Ok(None);
            }
            (_, None) => self.refresh(id, update, &packed).await?,
        }

        ctx.set_initial_data(Some(packed));
        Ok(Some(id.to_string()))
    }

    /// Refresh a record that must still exist. If it was deleted since it
    /// was read, it is written again as a new record.
    async fn refresh(&self, id: &str, update: Option<&[u8]>, packed: &[u8]) -> SessionResult<()> {
        let exists = Condition::exists(self.config.table_key.clone());
        match self.records.update(id, update, Some(exists)).await {
            Err(SessionError::Backend(BackendError::ConditionalCheckFailed { .. })) => {
                debug!(session_id = %id, "Session record vanished, recreating");
                self.records.create_new(id, packed).await?;
                Ok(())
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryTable, Operation, Request};
    use crate::record::LOCKED_AT;

    fn store(config: SessionConfig) -> (Arc<MemoryTable>, SessionStore) {
        let table = Arc::new(MemoryTable::new("sessions", "session_id"));
        let store = SessionStore::new(config, table.clone()).unwrap();
        (table, store)
    }

    #[tokio::test]
    async fn test_new_session_is_created_on_persist() {
        let (table, store) = store(SessionConfig::new("secret"));
        let mut ctx = RequestContext::new();

        let (id, mut data) = store.find(&mut ctx, None).await.unwrap();
        assert!(ctx.is_new_session());
        assert!(table.requests().is_empty());

        data.set("cart", vec![1, 2, 3]).unwrap();
        assert_eq!(store.persist(&mut ctx, &id, &data).await.unwrap(), Some(id.clone()));
        assert!(!ctx.is_new_session());
        assert_eq!(table.count(Operation::Put), 1);
        assert!(table.item(&id).is_some());
    }

    #[tokio::test]
    async fn test_empty_session_is_not_written() {
        let (table, store) = store(SessionConfig::new("secret"));
        let mut ctx = RequestContext::new();

        let (id, data) = store.find(&mut ctx, None).await.unwrap();
        assert_eq!(store.persist(&mut ctx, &id, &data).await.unwrap(), None);
        assert!(table.requests().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_id_is_reported_and_replaced() {
        let (_, store) = store(SessionConfig::new("secret"));
        let forged = format!("{}--{}", "0".repeat(64), "f".repeat(32));
        let mut ctx = RequestContext::new();

        let (id, data) = store.find(&mut ctx, Some(&forged)).await.unwrap();

        assert_ne!(id, forged);
        assert!(data.is_empty());
        assert!(ctx.is_new_session());
        assert_eq!(ctx.errors().len(), 1);
        assert!(ctx.errors()[0].contains("Corrupt session id"));
    }

    #[tokio::test]
    async fn test_missing_secret_is_fatal() {
        let (_, store) = store(SessionConfig::default());
        let mut ctx = RequestContext::new();
        assert!(matches!(
            store.find(&mut ctx, None).await,
            Err(SessionError::MissingSecret)
        ));
    }

    #[tokio::test]
    async fn test_soft_read_error_yields_empty_session() {
        let (table, store) = store(SessionConfig::new("secret"));
        let id = store.signer().generate().unwrap();
        table.fail_next(Operation::Get, BackendError::Throttled("slow down".into()));

        let mut ctx = RequestContext::new();
        let (found, data) = store.find(&mut ctx, Some(&id)).await.unwrap();

        assert_eq!(found, id);
        assert!(data.is_empty());
        assert_eq!(ctx.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_soft_write_error_drops_data() {
        let (table, store) = store(SessionConfig::new("secret"));
        let mut ctx = RequestContext::new();
        let (id, mut data) = store.find(&mut ctx, None).await.unwrap();
        data.set("k", "v").unwrap();
        table.fail_next(Operation::Put, BackendError::service("InternalServerError", "boom"));

        assert_eq!(store.persist(&mut ctx, &id, &data).await.unwrap(), None);
        assert!(table.is_empty());
        assert_eq!(ctx.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_with_lock_held() {
        let (table, store) = store(SessionConfig::new("secret").with_locking(true));
        let mut ctx = RequestContext::new();
        let (id, mut data) = store.find(&mut ctx, None).await.unwrap();
        data.set("k", "v").unwrap();
        store.persist(&mut ctx, &id, &data).await.unwrap();

        let mut ctx = RequestContext::new();
        store.find(&mut ctx, Some(&id)).await.unwrap();
        assert!(ctx.lock().is_some());
        assert!(table.item(&id).unwrap().contains_key(LOCKED_AT));

        store.remove(&mut ctx, &id).await.unwrap();
        assert!(ctx.lock().is_none());
        assert!(table.item(&id).is_none());
    }

    #[tokio::test]
    async fn test_record_deleted_before_persist_is_recreated() {
        let (table, store) = store(SessionConfig::new("secret"));
        let mut ctx = RequestContext::new();
        let (id, mut data) = store.find(&mut ctx, None).await.unwrap();
        data.set("step", 1).unwrap();
        store.persist(&mut ctx, &id, &data).await.unwrap();

        let mut ctx = RequestContext::new();
        let (_, mut data) = store.find(&mut ctx, Some(&id)).await.unwrap();
        store.records().delete(&id).await.unwrap();
        data.set("step", 2).unwrap();

        assert_eq!(store.persist(&mut ctx, &id, &data).await.unwrap(), Some(id.clone()));
        assert!(table.item(&id).unwrap().contains_key(crate::record::CREATED_AT));

        let record = store.records().fetch(&id).await.unwrap().unwrap();
        assert!(record.created_at <= record.updated_at);

        let mut ctx = RequestContext::new();
        let (_, data) = store.find(&mut ctx, Some(&id)).await.unwrap();
        assert_eq!(data.get::<i64>("step"), Some(2));
        assert!(ctx.errors().is_empty());
    }

    #[tokio::test]
    async fn test_plain_update_requires_existing_record() {
        let (table, store) = store(SessionConfig::new("secret"));
        let mut ctx = RequestContext::new();
        let (id, mut data) = store.find(&mut ctx, None).await.unwrap();
        data.set("k", "v").unwrap();
        store.persist(&mut ctx, &id, &data).await.unwrap();
        table.clear_requests();

        data.set("k", "w").unwrap();
        store.persist(&mut ctx, &id, &data).await.unwrap();

        let update = table
            .requests()
            .into_iter()
            .find_map(|r| match r {
                Request::Update(u) => Some(u),
                _ => None,
            })
            .unwrap();
        assert_eq!(update.condition, Some(Condition::exists("session_id")));
        assert_eq!(table.count(Operation::Put), 0);
    }

    #[tokio::test]
    async fn test_locked_write_without_lock_is_discarded() {
        let (table, store) = store(SessionConfig::new("secret").with_locking(true));
        let mut ctx = RequestContext::new();
        let (id, mut data) = store.find(&mut ctx, None).await.unwrap();
        data.set("owner", "a").unwrap();
        data.set("cart", vec![1, 2, 3]).unwrap();
        store.persist(&mut ctx, &id, &data).await.unwrap();

        let mut holder = RequestContext::new();
        let (_, mut mine) = store.find(&mut holder, Some(&id)).await.unwrap();
        assert!(holder.lock().is_some());
        let held = table.item(&id).unwrap();

        table.fail_next(Operation::Update, BackendError::Throttled("slow down".into()));
        let mut other = RequestContext::new();
        let (_, mut partial) = store.find(&mut other, Some(&id)).await.unwrap();
        assert!(other.lock().is_none());
        assert_eq!(other.errors().len(), 1);

        partial.set("owner", "b").unwrap();
        assert_eq!(store.persist(&mut other, &id, &partial).await.unwrap(), None);
        assert_eq!(table.item(&id).unwrap(), held);

        mine.set("cart", vec![1, 2, 3, 4]).unwrap();
        assert_eq!(store.persist(&mut holder, &id, &mine).await.unwrap(), Some(id.clone()));
        assert!(!table.item(&id).unwrap().contains_key(LOCKED_AT));

        let record = store.records().fetch(&id).await.unwrap().unwrap();
        let stored = SessionData::unpack(record.data.as_deref().unwrap()).unwrap();
        assert_eq!(stored.get::<String>("owner").as_deref(), Some("a"));
        assert_eq!(stored.get::<Vec<i64>>("cart"), Some(vec![1, 2, 3, 4]));
    }

    #[tokio::test]
    async fn test_regenerate_issues_new_id() {
        let (table, store) = store(SessionConfig::new("secret"));
        let mut ctx = RequestContext::new();
        let (id, mut data) = store.find(&mut ctx, None).await.unwrap();
        data.set("k", "v").unwrap();
        store.persist(&mut ctx, &id, &data).await.unwrap();

        let fresh = store.regenerate(&mut ctx, &id).await.unwrap();

        assert_ne!(fresh, id);
        assert!(ctx.is_new_session());
        assert!(table.item(&id).is_none());
        assert!(store.signer().verify(Some(&fresh)).unwrap().is_valid());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let table = Arc::new(MemoryTable::new("sessions", "session_id"));
        let config = SessionConfig::new("secret").with_table_name("");
        assert!(matches!(
            SessionStore::new(config, table),
            Err(SessionError::Config(_))
        ));
    }
}
