use async_trait::async_trait;
use fidoreg_types::DomainId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Per-user attribute mirroring whether the user has any active credential.
pub const KEYS_ENABLED_ATTRIBUTE: &str = "FIDOKeysEnabled";

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory backend error: {0}")]
    Backend(String),
    #[error("user {username} not found in domain {domain_id}")]
    UnknownUser { domain_id: DomainId, username: String },
}

/// External store of per-user attributes.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Set `attribute` for a user. With `append` the value is added next to
    /// existing values instead of replacing them.
    async fn set_attribute(
        &self,
        domain_id: DomainId,
        username: &str,
        attribute: &str,
        value: &str,
        append: bool,
    ) -> Result<(), DirectoryError>;
}

/// In-memory directory backed by a hashmap.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    attributes: Arc<RwLock<HashMap<(DomainId, String, String), Vec<String>>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, domain_id: DomainId, username: &str, attribute: &str) -> Option<Vec<String>> {
        self.attributes
            .read()
            .get(&(domain_id, username.to_string(), attribute.to_string()))
            .cloned()
    }
}

#[async_trait]
impl DirectoryService for MemoryDirectory {
    async fn set_attribute(
        &self,
        domain_id: DomainId,
        username: &str,
        attribute: &str,
        value: &str,
        append: bool,
    ) -> Result<(), DirectoryError> {
        let mut attributes = self.attributes.write();
        let values = attributes
            .entry((domain_id, username.to_string(), attribute.to_string()))
            .or_default();
        if !append {
            values.clear();
        }
        values.push(value.to_string());
        Ok(())
    }
}
