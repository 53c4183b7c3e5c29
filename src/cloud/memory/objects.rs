use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::cloud::objects::ObjectStore;
use crate::error::ObjectStoreError;

/// In-memory object store.
#[derive(Default)]
pub struct MemoryObjectStore {
    containers: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(name: &str) -> ObjectStoreError {
    ObjectStoreError::ContainerNotFound {
        name: name.to_string(),
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn create_container(&self, name: &str) -> Result<(), ObjectStoreError> {
        let mut containers = self.containers.write().await;
        if containers.contains_key(name) {
            return Err(ObjectStoreError::ContainerExists {
                name: name.to_string(),
            });
        }
        containers.insert(name.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn delete_container(&self, name: &str) -> Result<(), ObjectStoreError> {
        let mut containers = self.containers.write().await;
        let objects = containers.get(name).ok_or_else(|| missing(name))?;
        if !objects.is_empty() {
            return Err(ObjectStoreError::ContainerNotEmpty {
                name: name.to_string(),
            });
        }
        containers.remove(name);
        Ok(())
    }

    async fn list_containers(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let containers = self.containers.read().await;
        let mut names: Vec<String> = containers
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn list_keys(
        &self,
        container: &str,
        prefix: &str,
    ) -> Result<Vec<String>, ObjectStoreError> {
        let containers = self.containers.read().await;
        let objects = containers.get(container).ok_or_else(|| missing(container))?;
        Ok(objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn put(&self, container: &str, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError> {
        let mut containers = self.containers.write().await;
        containers
            .get_mut(container)
            .ok_or_else(|| missing(container))?
            .insert(key.to_string(), body);
        Ok(())
    }

    async fn get(&self, container: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let containers = self.containers.read().await;
        containers
            .get(container)
            .ok_or_else(|| missing(container))?
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::ObjectNotFound {
                container: container.to_string(),
                key: key.to_string(),
            })
    }

    async fn delete(&self, container: &str, key: &str) -> Result<(), ObjectStoreError> {
        let mut containers = self.containers.write().await;
        containers
            .get_mut(container)
            .ok_or_else(|| missing(container))?
            .remove(key);
        Ok(())
    }

    async fn exists(&self, container: &str, key: &str) -> Result<bool, ObjectStoreError> {
        let containers = self.containers.read().await;
        Ok(containers
            .get(container)
            .ok_or_else(|| missing(container))?
            .contains_key(key))
    }
}
