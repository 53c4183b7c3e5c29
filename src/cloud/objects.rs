//! Object store: named blobs inside named containers.

use async_trait::async_trait;

use crate::error::ObjectStoreError;

const URI_SCHEME: &str = "s3://";

/// A container or an object inside one. Resolved when the value is built,
/// so rendering a URI never has to guess what it was given.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreLocation {
    Container { name: String },
    Object { container: String, key: String },
}

impl StoreLocation {
    pub fn container(name: impl Into<String>) -> Self {
        Self::Container { name: name.into() }
    }

    pub fn object(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Object {
            container: container.into(),
            key: key.into(),
        }
    }

    /// Parse `s3://container` or `s3://container/key`.
    pub fn parse(uri: &str) -> Result<Self, ObjectStoreError> {
        let rest = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| ObjectStoreError::InvalidUri(uri.to_string()))?;
        match rest.split_once('/') {
            Some((container, key)) if !container.is_empty() && !key.is_empty() => {
                Ok(Self::object(container, key))
            }
            Some((container, "")) if !container.is_empty() => Ok(Self::container(container)),
            None if !rest.is_empty() => Ok(Self::container(rest)),
            _ => Err(ObjectStoreError::InvalidUri(uri.to_string())),
        }
    }

    pub fn container_name(&self) -> &str {
        match self {
            Self::Container { name } => name,
            Self::Object { container, .. } => container,
        }
    }

    pub fn uri(&self) -> String {
        match self {
            Self::Container { name } => format!("{URI_SCHEME}{name}"),
            Self::Object { container, key } => format!("{URI_SCHEME}{container}/{key}"),
        }
    }
}

impl std::fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uri())
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create_container(&self, name: &str) -> Result<(), ObjectStoreError>;

    /// Delete an empty container.
    async fn delete_container(&self, name: &str) -> Result<(), ObjectStoreError>;

    async fn list_containers(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    /// All keys under `prefix`, following pagination to the end.
    async fn list_keys(&self, container: &str, prefix: &str)
        -> Result<Vec<String>, ObjectStoreError>;

    async fn put(&self, container: &str, key: &str, body: Vec<u8>)
        -> Result<(), ObjectStoreError>;

    async fn get(&self, container: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError>;

    async fn delete(&self, container: &str, key: &str) -> Result<(), ObjectStoreError>;

    async fn exists(&self, container: &str, key: &str) -> Result<bool, ObjectStoreError>;
}

/// Delete every object in a container and then the container itself.
pub async fn empty_and_delete(
    store: &dyn ObjectStore,
    container: &str,
) -> Result<(), ObjectStoreError> {
    for key in store.list_keys(container, "").await? {
        store.delete(container, &key).await?;
    }
    store.delete_container(container).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_and_object_uris() {
        assert_eq!(StoreLocation::container("bucket").uri(), "s3://bucket");
        assert_eq!(
            StoreLocation::object("bucket", "frames/frame-0001.png").to_string(),
            "s3://bucket/frames/frame-0001.png"
        );
    }

    #[test]
    fn parse_uris() {
        assert_eq!(
            StoreLocation::parse("s3://store").unwrap(),
            StoreLocation::container("store")
        );
        assert_eq!(
            StoreLocation::parse("s3://store/").unwrap(),
            StoreLocation::container("store")
        );
        assert_eq!(
            StoreLocation::parse("s3://store/blender/blender.tar.xz").unwrap(),
            StoreLocation::object("store", "blender/blender.tar.xz")
        );
        assert!(StoreLocation::parse("gs://store").is_err());
        assert!(StoreLocation::parse("s3://").is_err());
    }
}
