//! Session records and their translation into table requests.

use crate::config::SessionConfig;
use crate::error::{BackendError, SessionError, SessionResult};
use crate::table::{
    AttrValue, Condition, DeleteItem, GetItem, Item, PutItem, SessionTable, UpdateItem, key_item,
};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tracing::debug;

/// Attribute holding the packed session payload.
pub const DATA: &str = "data";
/// Creation time, seconds since the epoch.
pub const CREATED_AT: &str = "created_at";
/// Last write time, seconds since the epoch.
pub const UPDATED_AT: &str = "updated_at";
/// Whole seconds since the epoch after which the table's TTL may drop the item.
pub const EXPIRE_AT: &str = "expire_at";
/// Time the current lock was taken; absent when the record is free.
pub const LOCKED_AT: &str = "locked_at";

/// Current time as fractional seconds since the epoch.
pub fn now_seconds() -> f64 {
    to_seconds(Utc::now())
}

pub fn to_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 / 1_000_000.0
}

pub fn from_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    let micros = (seconds * 1_000_000.0).round();
    if !micros.is_finite() {
        return None;
    }
    Utc.timestamp_micros(micros as i64).single()
}

/// A session row as stored in the table.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    /// Packed payload, if the record has one.
    pub data: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
    /// Raw `locked_at` value, when a lock is held.
    pub locked_at: Option<f64>,
}

impl SessionRecord {
    /// Decode an item read from the table.
    pub fn from_item(key_attribute: &str, item: &Item) -> SessionResult<Self> {
        let id = item
            .get(key_attribute)
            .and_then(AttrValue::as_str)
            .ok_or_else(|| missing(key_attribute))?
            .to_string();
        let time = |name: &str| {
            item.get(name)
                .and_then(AttrValue::as_f64)
                .and_then(from_seconds)
        };

        Ok(Self {
            data: item.get(DATA).and_then(AttrValue::as_bytes).map(<[u8]>::to_vec),
            created_at: time(CREATED_AT).ok_or_else(|| missing(CREATED_AT))?,
            updated_at: time(UPDATED_AT).ok_or_else(|| missing(UPDATED_AT))?,
            expire_at: time(EXPIRE_AT),
            locked_at: item.get(LOCKED_AT).and_then(AttrValue::as_f64),
            id,
        })
    }

    /// Whether the record is due for collection under the given thresholds.
    pub fn is_expired(&self, config: &SessionConfig, now: DateTime<Utc>) -> bool {
        let older_than = |time: DateTime<Utc>, limit: std::time::Duration| {
            (now - time).to_std().is_ok_and(|age| age > limit)
        };
        config.max_age.is_some_and(|limit| older_than(self.created_at, limit))
            || config.max_stale.is_some_and(|limit| older_than(self.updated_at, limit))
    }
}

fn missing(attribute: &str) -> SessionError {
    SessionError::Deserialization(format!("session record is missing '{}'", attribute))
}

/// Reads and writes session records.
#[derive(Clone)]
pub struct RecordStore {
    table: Arc<dyn SessionTable>,
    config: Arc<SessionConfig>,
}

impl RecordStore {
    pub fn new(table: Arc<dyn SessionTable>, config: Arc<SessionConfig>) -> Self {
        Self { table, config }
    }

    pub fn table(&self) -> &Arc<dyn SessionTable> {
        &self.table
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Key item for a session id.
    pub fn key(&self, id: &str) -> Item {
        key_item(&self.config.table_key, id)
    }

    /// `expire_at` for a write happening now.
    fn expire_at(&self, now: f64) -> AttrValue {
        let max_stale = self.config.max_stale.map(|d| d.as_secs_f64()).unwrap_or(0.0);
        AttrValue::N((now + max_stale).floor())
    }

    /// Read one record.
    pub async fn fetch(&self, id: &str) -> SessionResult<Option<SessionRecord>> {
        let item = self
            .table
            .get_item(GetItem {
                table_name: self.config.table_name.clone(),
                key: self.key(id),
                consistent_read: self.config.consistent_read,
                projection: Vec::new(),
            })
            .await?;

        item.map(|item| SessionRecord::from_item(&self.config.table_key, &item))
            .transpose()
    }

    /// Write a new record, failing with `AlreadyExists` if the id is taken.
    pub async fn create_new(&self, id: &str, data: &[u8]) -> SessionResult<String> {
        let now = now_seconds();
        let mut item = self.key(id);
        item.insert(DATA.to_string(), AttrValue::B(data.to_vec()));
        item.insert(CREATED_AT.to_string(), AttrValue::N(now));
        item.insert(UPDATED_AT.to_string(), AttrValue::N(now));
        item.insert(EXPIRE_AT.to_string(), self.expire_at(now));

        let request = PutItem {
            table_name: self.config.table_name.clone(),
            item,
            condition: Some(Condition::not_exists(self.config.table_key.clone())),
        };

        match self.table.put_item(request).await {
            Ok(()) => {
                debug!(session_id = %id, "Created session record");
                Ok(id.to_string())
            }
            Err(BackendError::ConditionalCheckFailed { .. }) => {
                Err(SessionError::AlreadyExists(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Build the refresh of an existing record.
    ///
    /// Sets `updated_at` and `expire_at`; sets `data` only when `data` is
    /// `Some`, i.e. when the payload changed since it was read.
    pub fn update_request(&self, id: &str, data: Option<&[u8]>) -> UpdateItem {
        let now = now_seconds();
        let mut request = UpdateItem::new(self.config.table_name.clone(), self.key(id))
            .set(UPDATED_AT, AttrValue::N(now))
            .set(EXPIRE_AT, self.expire_at(now));
        if let Some(data) = data {
            request = request.set(DATA, AttrValue::B(data.to_vec()));
        }
        request
    }

    /// Refresh an existing record, optionally guarded by `expected`.
    pub async fn update(
        &self,
        id: &str,
        data: Option<&[u8]>,
        expected: Option<Condition>,
    ) -> SessionResult<()> {
        let mut request = self.update_request(id, data);
        request.condition = expected;
        self.table.update_item(request).await?;
        Ok(())
    }

    /// Delete a record. Missing records are not an error.
    pub async fn delete(&self, id: &str) -> SessionResult<()> {
        self.table
            .delete_item(DeleteItem {
                table_name: self.config.table_name.clone(),
                key: self.key(id),
            })
            .await?;
        debug!(session_id = %id, "Deleted session record");
        Ok(())
    }
}
