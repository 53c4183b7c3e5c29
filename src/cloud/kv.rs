//! Key-value store with conditional writes.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::StoreError;

/// A stored item: numeric attributes by name.
pub type Item = BTreeMap<String, i64>;

/// Two-part primary key. Some stores insist on a partition key even when all
/// data should be globally scannable, so callers typically pin it to a
/// constant and put the real identifier in the sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    pub partition_key: String,
    pub sort_key: String,
}

impl KeySchema {
    pub fn new(partition_key: impl Into<String>, sort_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: sort_key.into(),
        }
    }
}

/// Outcome of a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalWrite {
    /// The condition held and the update was applied.
    Applied,
    /// The stored value no longer matched; someone else got there first.
    Rejected,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Create a table and wait until it is usable.
    async fn create_table(&self, table: &str, schema: &KeySchema) -> Result<(), StoreError>;

    /// Delete a table and wait until it is gone.
    async fn delete_table(&self, table: &str) -> Result<(), StoreError>;

    /// Names of tables starting with `prefix`.
    async fn list_tables(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Bulk insert. Items must carry both key attributes.
    async fn put_items(&self, table: &str, items: Vec<Item>) -> Result<(), StoreError>;

    /// Fetch one item by key.
    async fn get_item(&self, table: &str, key: &Item) -> Result<Option<Item>, StoreError>;

    /// Delete one item by key. Deleting a missing key is not an error.
    async fn delete_item(&self, table: &str, key: &Item) -> Result<(), StoreError>;

    /// Strongly consistent item count.
    async fn count(&self, table: &str) -> Result<usize, StoreError>;

    /// Consistent scan for items whose `attribute` equals `value`, in key order.
    async fn scan_eq(&self, table: &str, attribute: &str, value: i64)
        -> Result<Vec<Item>, StoreError>;

    /// Add `delta` to `attribute` only if it currently equals `expected`.
    async fn increment_if_equals(
        &self,
        table: &str,
        key: &Item,
        attribute: &str,
        expected: i64,
        delta: i64,
    ) -> Result<ConditionalWrite, StoreError>;
}
