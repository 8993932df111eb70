//! Backend abstraction for the session table.
//!
//! Requests are expressed in crate-native types so the record, locking and
//! garbage-collection logic can run against DynamoDB or the in-process
//! [`MemoryTable`](crate::memory::MemoryTable) without change.

use crate::error::BackendError;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Maximum number of requests a single batch write may carry.
pub const BATCH_WRITE_LIMIT: usize = 25;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// String
    S(String),
    /// Number
    N(f64),
    /// Binary
    B(Vec<u8>),
}

impl AttrValue {
    /// String content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::S(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric content, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::N(n) => Some(*n),
            _ => None,
        }
    }

    /// Binary content, if this is a blob.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            AttrValue::B(b) => Some(b),
            _ => None,
        }
    }

    /// Ordering between two values of the same type.
    ///
    /// Values of different types are unordered.
    pub fn partial_cmp_same_type(&self, other: &AttrValue) -> Option<Ordering> {
        match (self, other) {
            (AttrValue::S(a), AttrValue::S(b)) => Some(a.cmp(b)),
            (AttrValue::N(a), AttrValue::N(b)) => a.partial_cmp(b),
            (AttrValue::B(a), AttrValue::B(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// An item (row) as a map of attribute name to value.
pub type Item = HashMap<String, AttrValue>;

/// Build a key item for a string hash key.
pub fn key_item(attribute: &str, id: &str) -> Item {
    let mut key = Item::with_capacity(1);
    key.insert(attribute.to_string(), AttrValue::S(id.to_string()));
    key
}

/// A condition over the stored item, evaluated atomically with the write.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    AttributeExists(String),
    AttributeNotExists(String),
    Equals(String, AttrValue),
    LessThan(String, AttrValue),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn exists(attribute: impl Into<String>) -> Self {
        Condition::AttributeExists(attribute.into())
    }

    pub fn not_exists(attribute: impl Into<String>) -> Self {
        Condition::AttributeNotExists(attribute.into())
    }

    pub fn equals(attribute: impl Into<String>, value: AttrValue) -> Self {
        Condition::Equals(attribute.into(), value)
    }

    pub fn less_than(attribute: impl Into<String>, value: AttrValue) -> Self {
        Condition::LessThan(attribute.into(), value)
    }

    pub fn and(self, other: Condition) -> Self {
        Condition::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Condition) -> Self {
        Condition::Or(Box::new(self), Box::new(other))
    }

    /// Evaluate against an item; `None` means the item does not exist.
    pub fn matches(&self, item: Option<&Item>) -> bool {
        let attr = |name: &str| item.and_then(|i| i.get(name));
        match self {
            Condition::AttributeExists(name) => attr(name).is_some(),
            Condition::AttributeNotExists(name) => attr(name).is_none(),
            Condition::Equals(name, value) => attr(name) == Some(value),
            Condition::LessThan(name, value) => attr(name)
                .and_then(|v| v.partial_cmp_same_type(value))
                .is_some_and(|o| o == Ordering::Less),
            Condition::And(a, b) => a.matches(item) && b.matches(item),
            Condition::Or(a, b) => a.matches(item) || b.matches(item),
        }
    }
}

/// Single-item read.
#[derive(Debug, Clone, PartialEq)]
pub struct GetItem {
    pub table_name: String,
    pub key: Item,
    pub consistent_read: bool,
    /// Attributes to return; empty means all.
    pub projection: Vec<String>,
}

/// Whole-item write.
#[derive(Debug, Clone, PartialEq)]
pub struct PutItem {
    pub table_name: String,
    pub item: Item,
    pub condition: Option<Condition>,
}

/// Which item image an update returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnValues {
    #[default]
    None,
    /// The item as it was before the update.
    AllOld,
}

/// Partial update of one item.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateItem {
    pub table_name: String,
    pub key: Item,
    pub set: Vec<(String, AttrValue)>,
    pub remove: Vec<String>,
    pub condition: Option<Condition>,
    pub return_values: ReturnValues,
    /// Ask for the current item when the condition fails.
    pub return_current_on_failure: bool,
}

impl UpdateItem {
    pub fn new(table_name: impl Into<String>, key: Item) -> Self {
        Self {
            table_name: table_name.into(),
            key,
            set: Vec::new(),
            remove: Vec::new(),
            condition: None,
            return_values: ReturnValues::None,
            return_current_on_failure: false,
        }
    }

    pub fn set(mut self, attribute: impl Into<String>, value: AttrValue) -> Self {
        self.set.push((attribute.into(), value));
        self
    }

    pub fn remove(mut self, attribute: impl Into<String>) -> Self {
        self.remove.push(attribute.into());
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn return_values(mut self, return_values: ReturnValues) -> Self {
        self.return_values = return_values;
        self
    }

    pub fn return_current_on_failure(mut self) -> Self {
        self.return_current_on_failure = true;
        self
    }

    /// Whether the update writes the given attribute.
    pub fn sets(&self, attribute: &str) -> bool {
        self.set.iter().any(|(name, _)| name == attribute)
    }
}

/// Unconditional single-item delete.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteItem {
    pub table_name: String,
    pub key: Item,
}

/// One page of a table scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub table_name: String,
    pub projection: Vec<String>,
    pub filter: Option<Condition>,
    pub limit: Option<u32>,
    pub exclusive_start_key: Option<Item>,
}

/// Result of a scan page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanOutput {
    pub items: Vec<Item>,
    /// Continuation key; `None` once the table is exhausted.
    pub last_evaluated_key: Option<Item>,
}

/// Delete up to [`BATCH_WRITE_LIMIT`] items in one request.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchDelete {
    pub table_name: String,
    pub keys: Vec<Item>,
}

/// Result of a batch delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchDeleteOutput {
    /// Keys the backend did not process and which must be resubmitted.
    pub unprocessed: Vec<Item>,
}

/// Key-value backend holding the session table.
#[async_trait]
pub trait SessionTable: Send + Sync {
    /// Read one item.
    async fn get_item(&self, request: GetItem) -> Result<Option<Item>, BackendError>;

    /// Write a whole item, optionally guarded by a condition.
    async fn put_item(&self, request: PutItem) -> Result<(), BackendError>;

    /// Update attributes of one item, creating it if absent and unguarded.
    ///
    /// Returns the old item when `ReturnValues::AllOld` is requested.
    async fn update_item(&self, request: UpdateItem) -> Result<Option<Item>, BackendError>;

    /// Delete one item. Deleting a missing item succeeds.
    async fn delete_item(&self, request: DeleteItem) -> Result<(), BackendError>;

    /// Read one page of the table.
    async fn scan(&self, request: Scan) -> Result<ScanOutput, BackendError>;

    /// Delete a batch of items.
    async fn batch_delete(&self, request: BatchDelete) -> Result<BatchDeleteOutput, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(pairs: &[(&str, AttrValue)]) -> Item {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_condition_exists() {
        let it = item(&[("session_id", AttrValue::S("a".into()))]);
        assert!(Condition::exists("session_id").matches(Some(&it)));
        assert!(!Condition::exists("session_id").matches(None));
        assert!(Condition::not_exists("session_id").matches(None));
        assert!(Condition::not_exists("locked_at").matches(Some(&it)));
    }

    #[test]
    fn test_condition_less_than_requires_same_type() {
        let it = item(&[("locked_at", AttrValue::N(10.0))]);
        assert!(Condition::less_than("locked_at", AttrValue::N(11.0)).matches(Some(&it)));
        assert!(!Condition::less_than("locked_at", AttrValue::N(10.0)).matches(Some(&it)));
        assert!(!Condition::less_than("locked_at", AttrValue::S("11".into())).matches(Some(&it)));
    }

    #[test]
    fn test_condition_combinators() {
        let it = item(&[
            ("session_id", AttrValue::S("a".into())),
            ("locked_at", AttrValue::N(5.0)),
        ]);
        let free = Condition::not_exists("locked_at")
            .or(Condition::less_than("locked_at", AttrValue::N(4.0)));
        assert!(!Condition::exists("session_id").and(free.clone()).matches(Some(&it)));

        let stale = Condition::not_exists("locked_at")
            .or(Condition::less_than("locked_at", AttrValue::N(6.0)));
        assert!(Condition::exists("session_id").and(stale).matches(Some(&it)));
    }

    #[test]
    fn test_update_builder() {
        let update = UpdateItem::new("sessions", key_item("session_id", "abc"))
            .set("updated_at", AttrValue::N(1.0))
            .remove("locked_at")
            .return_values(ReturnValues::AllOld);

        assert!(update.sets("updated_at"));
        assert!(!update.sets("data"));
        assert_eq!(update.remove, vec!["locked_at".to_string()]);
        assert_eq!(update.return_values, ReturnValues::AllOld);
    }
}
