use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::cloud::kv::{ConditionalWrite, Item, KeySchema, KeyValueStore};
use crate::error::StoreError;

struct Table {
    schema: KeySchema,
    items: BTreeMap<(i64, i64), Item>,
}

impl Table {
    fn key_of(&self, table: &str, item: &Item) -> Result<(i64, i64), StoreError> {
        let part = |name: &str| {
            item.get(name).copied().ok_or_else(|| StoreError::InvalidItem {
                table: table.to_string(),
                reason: format!("missing key attribute {name}"),
            })
        };
        Ok((part(&self.schema.partition_key)?, part(&self.schema.sort_key)?))
    }
}

/// In-memory key-value store.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    tables: Mutex<HashMap<String, Table>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn has_table(&self, table: &str) -> bool {
        self.tables.lock().await.contains_key(table)
    }
}

fn not_found(table: &str) -> StoreError {
    StoreError::TableNotFound {
        table: table.to_string(),
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn create_table(&self, table: &str, schema: &KeySchema) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.contains_key(table) {
            return Err(StoreError::TableExists {
                table: table.to_string(),
            });
        }
        tables.insert(
            table.to_string(),
            Table {
                schema: schema.clone(),
                items: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| not_found(table))
    }

    async fn list_tables(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self
            .tables
            .lock()
            .await
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn put_items(&self, table: &str, items: Vec<Item>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let t = tables.get_mut(table).ok_or_else(|| not_found(table))?;
        for item in items {
            let key = t.key_of(table, &item)?;
            t.items.insert(key, item);
        }
        Ok(())
    }

    async fn get_item(&self, table: &str, key: &Item) -> Result<Option<Item>, StoreError> {
        let tables = self.tables.lock().await;
        let t = tables.get(table).ok_or_else(|| not_found(table))?;
        let key = t.key_of(table, key)?;
        Ok(t.items.get(&key).cloned())
    }

    async fn delete_item(&self, table: &str, key: &Item) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let t = tables.get_mut(table).ok_or_else(|| not_found(table))?;
        let key = t.key_of(table, key)?;
        t.items.remove(&key);
        Ok(())
    }

    async fn count(&self, table: &str) -> Result<usize, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.get(table).ok_or_else(|| not_found(table))?.items.len())
    }

    async fn scan_eq(
        &self,
        table: &str,
        attribute: &str,
        value: i64,
    ) -> Result<Vec<Item>, StoreError> {
        let tables = self.tables.lock().await;
        let t = tables.get(table).ok_or_else(|| not_found(table))?;
        Ok(t.items
            .values()
            .filter(|item| item.get(attribute) == Some(&value))
            .cloned()
            .collect())
    }

    async fn increment_if_equals(
        &self,
        table: &str,
        key: &Item,
        attribute: &str,
        expected: i64,
        delta: i64,
    ) -> Result<ConditionalWrite, StoreError> {
        let mut tables = self.tables.lock().await;
        let t = tables.get_mut(table).ok_or_else(|| not_found(table))?;
        let key = t.key_of(table, key)?;
        let Some(item) = t.items.get_mut(&key) else {
            // The condition cannot hold on a missing item.
            return Ok(ConditionalWrite::Rejected);
        };
        match item.get_mut(attribute) {
            Some(current) if *current == expected => {
                *current += delta;
                Ok(ConditionalWrite::Applied)
            }
            _ => Ok(ConditionalWrite::Rejected),
        }
    }
}
