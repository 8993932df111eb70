//! In-process session table.
//!
//! `MemoryTable` evaluates conditions atomically under a single mutex, so it
//! gives the same mutual-exclusion guarantees as a real conditional-write
//! backend across tasks of one process. It records every request it receives
//! and can be scripted to split scan pages, leave batch deletes unprocessed,
//! or fail the next call of a given kind.

use crate::error::BackendError;
use crate::table::{
    AttrValue, BatchDelete, BatchDeleteOutput, DeleteItem, GetItem, Item, PutItem, ReturnValues,
    Scan, ScanOutput, SessionTable, UpdateItem,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;

/// A request as received by the table.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Get(GetItem),
    Put(PutItem),
    Update(UpdateItem),
    Delete(DeleteItem),
    Scan(Scan),
    BatchDelete(BatchDelete),
}

/// Request kind, used to script failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Put,
    Update,
    Delete,
    Scan,
    BatchDelete,
}

#[derive(Default)]
struct Script {
    scan_page_size: Option<usize>,
    unprocessed: VecDeque<usize>,
    failures: HashMap<Operation, VecDeque<BackendError>>,
}

/// In-memory [`SessionTable`] keyed by a string hash key.
///
/// # Examples
///
/// ```
/// use sessionstore_dynamodb::memory::MemoryTable;
///
/// let table = MemoryTable::new("sessions", "session_id");
/// assert!(table.is_empty());
/// ```
pub struct MemoryTable {
    table_name: String,
    key_attribute: String,
    items: Mutex<BTreeMap<String, Item>>,
    requests: Mutex<Vec<Request>>,
    script: Mutex<Script>,
}

impl MemoryTable {
    /// Create an empty table.
    pub fn new(table_name: impl Into<String>, key_attribute: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            key_attribute: key_attribute.into(),
            items: Mutex::new(BTreeMap::new()),
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
        }
    }

    /// Table name this backend answers to.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Insert or replace an item directly, bypassing request recording.
    pub fn insert(&self, item: Item) {
        if let Some(AttrValue::S(id)) = item.get(&self.key_attribute) {
            self.items.lock().insert(id.clone(), item);
        }
    }

    /// Snapshot of one stored item.
    pub fn item(&self, id: &str) -> Option<Item> {
        self.items.lock().get(id).cloned()
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// Forget recorded requests.
    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    /// Count received requests of one kind.
    pub fn count(&self, operation: Operation) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| Self::operation_of(r) == operation)
            .count()
    }

    /// Return at most `size` evaluated items per scan page.
    pub fn set_scan_page_size(&self, size: usize) {
        self.script.lock().scan_page_size = Some(size.max(1));
    }

    /// Leave the first `count` keys of the next batch delete unprocessed.
    ///
    /// Calls queue up: each batch delete consumes one entry.
    pub fn push_unprocessed(&self, count: usize) {
        self.script.lock().unprocessed.push_back(count);
    }

    /// Fail the next request of the given kind with `error`.
    pub fn fail_next(&self, operation: Operation, error: BackendError) {
        self.script
            .lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    fn operation_of(request: &Request) -> Operation {
        match request {
            Request::Get(_) => Operation::Get,
            Request::Put(_) => Operation::Put,
            Request::Update(_) => Operation::Update,
            Request::Delete(_) => Operation::Delete,
            Request::Scan(_) => Operation::Scan,
            Request::BatchDelete(_) => Operation::BatchDelete,
        }
    }

    /// Record the request and pop any scripted failure for it.
    fn receive(&self, table_name: &str, request: Request) -> Result<(), BackendError> {
        let operation = Self::operation_of(&request);
        self.requests.lock().push(request);

        if let Some(error) = self
            .script
            .lock()
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        if table_name != self.table_name {
            return Err(BackendError::ResourceNotFound(format!(
                "Requested resource not found: Table: {} not found",
                table_name
            )));
        }
        Ok(())
    }

    fn key_of(&self, key: &Item) -> Result<String, BackendError> {
        key.get(&self.key_attribute)
            .and_then(AttrValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                BackendError::service(
                    "ValidationException",
                    format!("missing key attribute {}", self.key_attribute),
                )
            })
    }

    fn project(item: &Item, projection: &[String]) -> Item {
        if projection.is_empty() {
            return item.clone();
        }
        item.iter()
            .filter(|(name, _)| projection.contains(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

#[async_trait]
impl SessionTable for MemoryTable {
    async fn get_item(&self, request: GetItem) -> Result<Option<Item>, BackendError> {
        self.receive(&request.table_name, Request::Get(request.clone()))?;
        let id = self.key_of(&request.key)?;
        Ok(self
            .items
            .lock()
            .get(&id)
            .map(|item| Self::project(item, &request.projection)))
    }

    async fn put_item(&self, request: PutItem) -> Result<(), BackendError> {
        self.receive(&request.table_name, Request::Put(request.clone()))?;
        let id = self.key_of(&request.item)?;

        let mut items = self.items.lock();
        if let Some(condition) = &request.condition {
            let current = items.get(&id);
            if !condition.matches(current) {
                return Err(BackendError::ConditionalCheckFailed { current: None });
            }
        }
        items.insert(id, request.item);
        Ok(())
    }

    async fn update_item(&self, request: UpdateItem) -> Result<Option<Item>, BackendError> {
        self.receive(&request.table_name, Request::Update(request.clone()))?;
        let id = self.key_of(&request.key)?;

        let mut items = self.items.lock();
        let current = items.get(&id);
        if let Some(condition) = &request.condition {
            if !condition.matches(current) {
                let current = if request.return_current_on_failure {
                    current.cloned()
                } else {
                    None
                };
                return Err(BackendError::ConditionalCheckFailed { current });
            }
        }

        let old = current.cloned();
        let mut updated = old.clone().unwrap_or_else(|| request.key.clone());
        for (name, value) in &request.set {
            updated.insert(name.clone(), value.clone());
        }
        for name in &request.remove {
            updated.remove(name);
        }
        items.insert(id, updated);

        Ok(match request.return_values {
            ReturnValues::AllOld => old,
            ReturnValues::None => None,
        })
    }

    async fn delete_item(&self, request: DeleteItem) -> Result<(), BackendError> {
        self.receive(&request.table_name, Request::Delete(request.clone()))?;
        let id = self.key_of(&request.key)?;
        self.items.lock().remove(&id);
        Ok(())
    }

    async fn scan(&self, request: Scan) -> Result<ScanOutput, BackendError> {
        self.receive(&request.table_name, Request::Scan(request.clone()))?;

        let start = match &request.exclusive_start_key {
            Some(key) => Bound::Excluded(self.key_of(key)?),
            None => Bound::Unbounded,
        };
        let page_size = {
            let script = self.script.lock();
            match (script.scan_page_size, request.limit) {
                (Some(a), Some(b)) => Some(a.min(b as usize)),
                (a, b) => a.or(b.map(|b| b as usize)),
            }
        };

        let items = self.items.lock();
        let mut evaluated = items.range((start, Bound::Unbounded));
        let mut output = ScanOutput::default();
        let mut last_key = None;
        let mut taken = 0;

        for (id, item) in evaluated.by_ref() {
            if page_size.is_some_and(|size| taken >= size) {
                break;
            }
            taken += 1;
            last_key = Some(id.clone());
            let keep = request
                .filter
                .as_ref()
                .is_none_or(|filter| filter.matches(Some(item)));
            if keep {
                output.items.push(Self::project(item, &request.projection));
            }
        }

        let exhausted = match &last_key {
            Some(id) => items
                .range::<String, _>((Bound::Excluded(id), Bound::Unbounded))
                .next()
                .is_none(),
            None => true,
        };
        if !exhausted {
            output.last_evaluated_key =
                last_key.map(|id| crate::table::key_item(&self.key_attribute, &id));
        }
        Ok(output)
    }

    async fn batch_delete(&self, request: BatchDelete) -> Result<BatchDeleteOutput, BackendError> {
        self.receive(&request.table_name, Request::BatchDelete(request.clone()))?;
        if request.keys.len() > crate::table::BATCH_WRITE_LIMIT {
            return Err(BackendError::service(
                "ValidationException",
                format!(
                    "Too many items requested for the BatchWriteItem call: {}",
                    request.keys.len()
                ),
            ));
        }

        let skip = self.script.lock().unprocessed.pop_front().unwrap_or(0);
        let (unprocessed, processed) = request.keys.split_at(skip.min(request.keys.len()));

        let mut items = self.items.lock();
        for key in processed {
            let id = self.key_of(key)?;
            items.remove(&id);
        }

        Ok(BatchDeleteOutput {
            unprocessed: unprocessed.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Condition, key_item};

    fn session(id: &str, updated_at: f64) -> Item {
        let mut item = key_item("session_id", id);
        item.insert("updated_at".into(), AttrValue::N(updated_at));
        item
    }

    #[tokio::test]
    async fn test_put_condition() {
        let table = MemoryTable::new("sessions", "session_id");
        let put = PutItem {
            table_name: "sessions".into(),
            item: session("a", 1.0),
            condition: Some(Condition::not_exists("session_id")),
        };

        table.put_item(put.clone()).await.unwrap();
        let err = table.put_item(put).await.unwrap_err();
        assert!(err.is_conditional_check_failed());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_update_returns_old_and_current_on_failure() {
        let table = MemoryTable::new("sessions", "session_id");
        table.insert(session("a", 1.0));

        let old = table
            .update_item(
                UpdateItem::new("sessions", key_item("session_id", "a"))
                    .set("locked_at", AttrValue::N(2.0))
                    .condition(Condition::not_exists("locked_at"))
                    .return_values(ReturnValues::AllOld),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(!old.contains_key("locked_at"));

        let err = table
            .update_item(
                UpdateItem::new("sessions", key_item("session_id", "a"))
                    .set("locked_at", AttrValue::N(3.0))
                    .condition(Condition::not_exists("locked_at"))
                    .return_current_on_failure(),
            )
            .await
            .unwrap_err();
        match err {
            BackendError::ConditionalCheckFailed { current: Some(item) } => {
                assert_eq!(item.get("locked_at"), Some(&AttrValue::N(2.0)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scan_pages() {
        let table = MemoryTable::new("sessions", "session_id");
        for i in 0..5 {
            table.insert(session(&format!("s{i}"), i as f64));
        }
        table.set_scan_page_size(3);

        let scan = Scan {
            table_name: "sessions".into(),
            projection: vec!["session_id".into()],
            filter: None,
            limit: None,
            exclusive_start_key: None,
        };
        let first = table.scan(scan.clone()).await.unwrap();
        assert_eq!(first.items.len(), 3);
        assert!(first.items[0].get("updated_at").is_none());

        let second = table
            .scan(Scan {
                exclusive_start_key: first.last_evaluated_key,
                ..scan
            })
            .await
            .unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(second.last_evaluated_key.is_none());
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let table = MemoryTable::new("sessions", "session_id");
        table.fail_next(Operation::Get, BackendError::Throttled("slow down".into()));

        let get = GetItem {
            table_name: "sessions".into(),
            key: key_item("session_id", "a"),
            consistent_read: true,
            projection: vec![],
        };
        assert!(matches!(
            table.get_item(get.clone()).await,
            Err(BackendError::Throttled(_))
        ));
        assert!(table.get_item(get).await.unwrap().is_none());
        assert_eq!(table.count(Operation::Get), 2);
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let table = MemoryTable::new("sessions", "session_id");
        let err = table
            .delete_item(DeleteItem {
                table_name: "other".into(),
                key: key_item("session_id", "a"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ResourceNotFound(_)));
    }
}
