//! Concurrent store of subscription records.
//!
//! The primary map (`id -> record`) and the type index
//! (`resource type -> active ids`) live behind one lock and are only changed
//! together, so a reader never sees one updated without the other. A record
//! is in the type index iff its status is `Active`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::types::{SubscriptionRecord, SubscriptionStatus};

#[derive(Default)]
struct Inner {
    records: HashMap<String, Arc<SubscriptionRecord>>,
    by_type: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn index(&mut self, record: &SubscriptionRecord) {
        if record.is_active() {
            self.by_type
                .entry(record.criteria.resource_type.clone())
                .or_default()
                .insert(record.id.clone());
        }
    }

    fn unindex(&mut self, record: &SubscriptionRecord) {
        let resource_type = &record.criteria.resource_type;
        if let Some(ids) = self.by_type.get_mut(resource_type) {
            ids.remove(&record.id);
            if ids.is_empty() {
                self.by_type.remove(resource_type);
            }
        }
    }

    fn insert(&mut self, record: Arc<SubscriptionRecord>) {
        self.index(&record);
        self.records.insert(record.id.clone(), record);
    }

    fn remove(&mut self, id: &str) -> Option<Arc<SubscriptionRecord>> {
        let record = self.records.remove(id)?;
        self.unindex(&record);
        Some(record)
    }
}

/// Registry of live subscriptions, indexed by resource type.
///
/// Records are immutable `Arc`s; every mutation swaps in a new record under
/// the write lock.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record. `Requested` becomes `Active`.
    ///
    /// Fails with `DuplicateId` if the id is present and with
    /// `InvalidTransition` for records that are `Off`.
    pub fn register(&self, mut record: SubscriptionRecord) -> SubscriptionResult<Arc<SubscriptionRecord>> {
        if record.status == SubscriptionStatus::Off {
            return Err(SubscriptionError::InvalidTransition {
                id: record.id,
                from: SubscriptionStatus::Off,
                to: SubscriptionStatus::Active,
            });
        }
        if record.status == SubscriptionStatus::Requested {
            record.status = SubscriptionStatus::Active;
        }

        let mut inner = self.inner.write();
        if inner.records.contains_key(&record.id) {
            return Err(SubscriptionError::DuplicateId(record.id));
        }
        let record = Arc::new(record);
        inner.insert(record.clone());
        drop(inner);

        tracing::debug!(
            subscription_id = %record.id,
            resource_type = %record.criteria.resource_type,
            status = %record.status,
            "Subscription registered"
        );
        Ok(record)
    }

    /// Atomically replace (or insert) the record with the same id.
    ///
    /// Used when a subscription is updated at the boundary. An `Off` record
    /// removes any existing entry and is not stored.
    pub fn replace(&self, mut record: SubscriptionRecord) -> Option<Arc<SubscriptionRecord>> {
        let mut inner = self.inner.write();
        inner.remove(&record.id);
        if record.status == SubscriptionStatus::Off {
            return None;
        }
        if record.status == SubscriptionStatus::Requested {
            record.status = SubscriptionStatus::Active;
        }
        let record = Arc::new(record);
        inner.insert(record.clone());
        Some(record)
    }

    /// Change the status of a registered record.
    ///
    /// Allowed: `Active <-> Error`, `Active|Error -> Off` (removes the
    /// record), and same-status updates (which refresh the error text).
    /// Returns the previous status.
    pub fn update_status(
        &self,
        id: &str,
        status: SubscriptionStatus,
        error: Option<String>,
    ) -> SubscriptionResult<SubscriptionStatus> {
        let mut inner = self.inner.write();
        let current = inner
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| SubscriptionError::not_found(id))?;
        let from = current.status;

        use SubscriptionStatus::*;
        match (from, status) {
            (Active | Error, Off) => {
                inner.remove(id);
            }
            (Active, Active | Error) | (Error, Active | Error) => {
                let mut next = (*current).clone();
                next.status = status;
                next.error = if status == Error { error } else { None };
                inner.remove(id);
                inner.insert(Arc::new(next));
            }
            _ => {
                return Err(SubscriptionError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    to: status,
                });
            }
        }
        drop(inner);

        if from != status {
            tracing::info!(
                subscription_id = %id,
                from = %from,
                to = %status,
                "Subscription status changed"
            );
        }
        Ok(from)
    }

    /// Move `expected` to `Error`, but only if it is still the current record.
    ///
    /// Returns false when the record was replaced, removed or is no longer
    /// active, so a failure against an old definition never marks its
    /// successor.
    pub fn mark_error_if_current(&self, expected: &Arc<SubscriptionRecord>, error: String) -> bool {
        let mut inner = self.inner.write();
        let current = match inner.records.get(&expected.id) {
            Some(current) if Arc::ptr_eq(current, expected) && current.is_active() => {
                current.clone()
            }
            _ => return false,
        };
        let mut next = (*current).clone();
        next.status = SubscriptionStatus::Error;
        next.error = Some(error);
        inner.remove(&expected.id);
        inner.insert(Arc::new(next));
        drop(inner);

        tracing::info!(
            subscription_id = %expected.id,
            from = %SubscriptionStatus::Active,
            to = %SubscriptionStatus::Error,
            "Subscription status changed"
        );
        true
    }

    /// Remove a record regardless of status.
    pub fn unregister(&self, id: &str) -> SubscriptionResult<Arc<SubscriptionRecord>> {
        let removed = self.inner.write().remove(id);
        match removed {
            Some(record) => {
                tracing::debug!(subscription_id = %id, "Subscription unregistered");
                Ok(record)
            }
            None => Err(SubscriptionError::not_found(id)),
        }
    }

    /// Current record for `id`, whatever its status.
    pub fn get(&self, id: &str) -> Option<Arc<SubscriptionRecord>> {
        self.inner.read().records.get(id).cloned()
    }

    /// Ids of active subscriptions targeting `resource_type`.
    pub fn candidates_for(&self, resource_type: &str) -> HashSet<String> {
        self.inner
            .read()
            .by_type
            .get(resource_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of the active records targeting `resource_type`.
    ///
    /// Taken under one read lock, so ids and records are consistent.
    pub fn active_for(&self, resource_type: &str) -> Vec<Arc<SubscriptionRecord>> {
        let inner = self.inner.read();
        let Some(ids) = inner.by_type.get(resource_type) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }

    /// Number of registered records.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    /// Number of records currently matched against writes.
    pub fn active_count(&self) -> usize {
        self.inner.read().by_type.values().map(HashSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::CriteriaPredicate;
    use crate::types::{ChannelDescriptor, ChannelType, PayloadFormat};

    fn record(id: &str, criteria: &str) -> SubscriptionRecord {
        SubscriptionRecord::new(
            id,
            CriteriaPredicate::parse(criteria).unwrap(),
            ChannelDescriptor {
                channel_type: ChannelType::WebSocket,
                endpoint: String::new(),
                payload_format: PayloadFormat::IdOnly,
                headers: Vec::new(),
            },
        )
    }

    /// `candidates_for(t)` contains i iff record i is active and targets t.
    fn assert_index_consistent(registry: &SubscriptionRegistry) {
        let inner = registry.inner.read();
        for (id, rec) in &inner.records {
            let indexed = inner
                .by_type
                .get(&rec.criteria.resource_type)
                .is_some_and(|ids| ids.contains(id));
            assert_eq!(indexed, rec.is_active(), "index mismatch for {id}");
        }
        for (resource_type, ids) in &inner.by_type {
            for id in ids {
                let rec = inner.records.get(id).expect("indexed id has a record");
                assert_eq!(&rec.criteria.resource_type, resource_type);
            }
        }
    }

    #[test]
    fn register_activates_and_indexes() {
        let registry = SubscriptionRegistry::new();
        let rec = registry
            .register(record("1", "Observation?code=1"))
            .unwrap();
        assert_eq!(rec.status, SubscriptionStatus::Active);
        assert!(registry.candidates_for("Observation").contains("1"));
        assert!(registry.candidates_for("Patient").is_empty());
        assert_index_consistent(&registry);
    }

    #[test]
    fn mark_error_ignores_replaced_record() {
        let registry = SubscriptionRegistry::new();
        let first = registry.register(record("1", "Observation?code=1")).unwrap();
        let second = registry
            .replace(record("1", "Observation?code=2"))
            .unwrap();

        assert!(!registry.mark_error_if_current(&first, "stale".into()));
        assert_eq!(registry.get("1").unwrap().status, SubscriptionStatus::Active);

        assert!(registry.mark_error_if_current(&second, "boom".into()));
        let current = registry.get("1").unwrap();
        assert_eq!(current.status, SubscriptionStatus::Error);
        assert_eq!(current.error.as_deref(), Some("boom"));
        assert!(!registry.mark_error_if_current(&current, "again".into()));
        assert_index_consistent(&registry);
    }

    #[test]
    fn duplicate_register_fails() {
        let registry = SubscriptionRegistry::new();
        registry.register(record("1", "Observation?code=1")).unwrap();
        let err = registry
            .register(record("1", "Patient?gender=male"))
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::DuplicateId(id) if id == "1"));
        assert_eq!(
            registry.get("1").unwrap().criteria.resource_type,
            "Observation"
        );
    }

    #[test]
    fn status_transitions_keep_index_consistent() {
        let registry = SubscriptionRegistry::new();
        registry.register(record("1", "Observation?code=1")).unwrap();
        registry.register(record("2", "Observation?code=2")).unwrap();

        registry
            .update_status("1", SubscriptionStatus::Error, Some("boom".into()))
            .unwrap();
        assert!(!registry.candidates_for("Observation").contains("1"));
        assert_eq!(registry.get("1").unwrap().error.as_deref(), Some("boom"));
        assert_index_consistent(&registry);

        registry
            .update_status("1", SubscriptionStatus::Active, None)
            .unwrap();
        assert!(registry.candidates_for("Observation").contains("1"));
        assert!(registry.get("1").unwrap().error.is_none());

        registry
            .update_status("2", SubscriptionStatus::Off, None)
            .unwrap();
        assert!(registry.get("2").is_none());
        assert_eq!(registry.active_count(), 1);
        assert_index_consistent(&registry);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let registry = SubscriptionRegistry::new();
        registry.register(record("1", "Observation?code=1")).unwrap();
        let err = registry
            .update_status("1", SubscriptionStatus::Requested, None)
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::InvalidTransition { .. }));
        assert!(matches!(
            registry.update_status("missing", SubscriptionStatus::Off, None),
            Err(SubscriptionError::NotFound(_))
        ));

        let mut off = record("2", "Observation?code=1");
        off.status = SubscriptionStatus::Off;
        assert!(registry.register(off).is_err());
    }

    #[test]
    fn unregister_and_replace() {
        let registry = SubscriptionRegistry::new();
        registry.register(record("1", "Observation?code=1")).unwrap();
        registry.replace(record("1", "Patient?gender=male"));
        assert!(registry.candidates_for("Observation").is_empty());
        assert!(registry.candidates_for("Patient").contains("1"));
        assert_index_consistent(&registry);

        registry.unregister("1").unwrap();
        assert!(registry.is_empty());
        assert!(registry.candidates_for("Patient").is_empty());
        assert!(registry.unregister("1").is_err());
    }

    #[test]
    fn concurrent_mutations_preserve_invariant() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("{t}-{i}");
                        registry
                            .register(record(&id, "Observation?code=1"))
                            .unwrap();
                        if i % 3 == 0 {
                            registry
                                .update_status(&id, SubscriptionStatus::Error, None)
                                .unwrap();
                        }
                        if i % 5 == 0 {
                            registry.unregister(&id).unwrap();
                        }
                        let _ = registry.active_for("Observation");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_index_consistent(&registry);
    }
}
