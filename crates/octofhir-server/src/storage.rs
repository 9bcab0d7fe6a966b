//! In-memory resource store.
//!
//! Resources are kept as JSON with server-managed `id` and `meta`. Every
//! successful write returns the stored resource, which is what the
//! subscription engine sees.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use octofhir_core::{CoreError, generate_id, validate_id};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StorageKey {
    resource_type: String,
    id: String,
}

impl StorageKey {
    fn new(resource_type: &str, id: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
        }
    }
}

struct Entry {
    /// Creation order, used for stable search results
    seq: u64,
    version: u64,
    resource: Value,
}

/// Result of a write.
#[derive(Debug, Clone)]
pub struct StoredResource {
    pub id: String,
    pub version_id: u64,
    pub resource: Value,
    /// True when the write created the resource
    pub created: bool,
}

#[derive(Default)]
pub struct InMemoryStore {
    data: DashMap<StorageKey, Entry>,
    seq: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a server-assigned id.
    pub fn create(&self, resource_type: &str, resource: &Value) -> Result<StoredResource, CoreError> {
        check_resource_type(resource_type, resource)?;
        let id = generate_id();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let stored = with_meta(resource, &id, 1)?;
        self.data.insert(
            StorageKey::new(resource_type, &id),
            Entry {
                seq,
                version: 1,
                resource: stored.clone(),
            },
        );
        Ok(StoredResource {
            id,
            version_id: 1,
            resource: stored,
            created: true,
        })
    }

    /// Update, or create with the client-supplied id.
    pub fn update(
        &self,
        resource_type: &str,
        id: &str,
        resource: &Value,
    ) -> Result<StoredResource, CoreError> {
        check_resource_type(resource_type, resource)?;
        validate_id(id).map_err(|e| CoreError::invalid_id(e.to_string()))?;
        if let Some(body_id) = resource.get("id").and_then(Value::as_str) {
            if body_id != id {
                return Err(CoreError::invalid_resource(format!(
                    "resource id '{body_id}' does not match URL id '{id}'"
                )));
            }
        }

        let key = StorageKey::new(resource_type, id);
        let mut entry = self.data.entry(key).or_insert_with(|| Entry {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            version: 0,
            resource: Value::Null,
        });
        let created = entry.version == 0;
        let version = entry.version + 1;
        let stored = with_meta(resource, id, version)?;
        entry.version = version;
        entry.resource = stored.clone();

        Ok(StoredResource {
            id: id.to_string(),
            version_id: version,
            resource: stored,
            created,
        })
    }

    pub fn read(&self, resource_type: &str, id: &str) -> Option<Value> {
        self.data
            .get(&StorageKey::new(resource_type, id))
            .map(|entry| entry.resource.clone())
    }

    pub fn delete(&self, resource_type: &str, id: &str) -> Option<Value> {
        self.data
            .remove(&StorageKey::new(resource_type, id))
            .map(|(_, entry)| entry.resource)
    }

    /// All resources of a type in creation order.
    pub fn search(&self, resource_type: &str) -> Vec<Value> {
        let mut found: Vec<(u64, Value)> = self
            .data
            .iter()
            .filter(|item| item.key().resource_type == resource_type)
            .map(|item| (item.seq, item.resource.clone()))
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, resource)| resource).collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn check_resource_type(resource_type: &str, resource: &Value) -> Result<(), CoreError> {
    match resource.get("resourceType").and_then(Value::as_str) {
        Some(t) if t == resource_type => Ok(()),
        Some(t) => Err(CoreError::invalid_resource(format!(
            "resourceType '{t}' does not match endpoint type '{resource_type}'"
        ))),
        None => Err(CoreError::invalid_resource("missing resourceType")),
    }
}

fn with_meta(resource: &Value, id: &str, version: u64) -> Result<Value, CoreError> {
    let mut stored = resource.clone();
    let object = stored
        .as_object_mut()
        .ok_or_else(|| CoreError::invalid_resource("resource must be a JSON object"))?;
    object.insert("id".to_string(), Value::String(id.to_string()));
    object.insert(
        "meta".to_string(),
        json!({
            "versionId": version.to_string(),
            "lastUpdated": OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        }),
    );
    Ok(stored)
}
