//! In-process record store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use playbook_types::record::merge_metadata;
use playbook_types::{
    EntityRecord, Metadata, NewEntity, NewRelationship, NewTransaction, NewTransactionLine,
    RelationshipRecord, TransactionLineRecord, TransactionRecord, new_id, now,
};

use crate::storage::{PersistenceAdapter, RecordFilter};
use crate::{Result, StoreError};

#[derive(Debug, Default)]
struct Inner {
    entities: Vec<EntityRecord>,
    transactions: Vec<TransactionRecord>,
    lines: Vec<TransactionLineRecord>,
    relationships: Vec<RelationshipRecord>,
    dynamic_fields: HashMap<(String, String), Value>,
}

/// [`PersistenceAdapter`] backed by in-memory vectors.
///
/// Records keep insertion order, which doubles as creation order for
/// queries. All operations take a single lock, so the conditional line claim
/// is atomic with respect to other callers of the same store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions of the given type (for tests and diagnostics).
    pub fn transaction_count(&self, transaction_type: &str) -> usize {
        self.inner
            .lock()
            .transactions
            .iter()
            .filter(|t| t.transaction_type == transaction_type)
            .count()
    }
}

fn line_status(line: &TransactionLineRecord) -> Option<&str> {
    line.metadata.get("status").and_then(Value::as_str)
}

#[async_trait]
impl PersistenceAdapter for MemoryStore {
    async fn create_entity(&self, new: NewEntity) -> Result<EntityRecord> {
        let ts = now();
        let record = EntityRecord {
            id: new_id(),
            organization_id: new.organization_id,
            entity_type: new.entity_type,
            entity_code: new.entity_code,
            entity_name: new.entity_name,
            smart_code: new.smart_code,
            metadata: new.metadata,
            created_at: ts,
            updated_at: ts,
        };
        self.inner.lock().entities.push(record.clone());
        Ok(record)
    }

    async fn get_entity(&self, id: &str) -> Result<EntityRecord> {
        self.inner
            .lock()
            .entities
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("entity", id))
    }

    async fn update_entity(&self, id: &str, patch: Metadata) -> Result<EntityRecord> {
        let mut inner = self.inner.lock();
        let record = inner
            .entities
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::not_found("entity", id))?;
        merge_metadata(&mut record.metadata, patch);
        record.updated_at = now();
        Ok(record.clone())
    }

    async fn query_entities(&self, filter: &RecordFilter) -> Result<Vec<EntityRecord>> {
        Ok(self
            .inner
            .lock()
            .entities
            .iter()
            .filter(|e| filter.matches(&e.organization_id, &e.entity_type, None, &e.metadata))
            .cloned()
            .collect())
    }

    async fn create_transaction(&self, new: NewTransaction) -> Result<TransactionRecord> {
        let ts = now();
        let record = TransactionRecord {
            id: new_id(),
            organization_id: new.organization_id,
            transaction_type: new.transaction_type,
            transaction_code: new.transaction_code,
            smart_code: new.smart_code,
            reference_entity_id: new.reference_entity_id,
            metadata: new.metadata,
            created_at: ts,
            updated_at: ts,
        };
        self.inner.lock().transactions.push(record.clone());
        Ok(record)
    }

    async fn get_transaction(&self, id: &str) -> Result<TransactionRecord> {
        self.inner
            .lock()
            .transactions
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("transaction", id))
    }

    async fn update_transaction(&self, id: &str, patch: Metadata) -> Result<TransactionRecord> {
        let mut inner = self.inner.lock();
        let record = inner
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StoreError::not_found("transaction", id))?;
        merge_metadata(&mut record.metadata, patch);
        record.updated_at = now();
        Ok(record.clone())
    }

    async fn query_transactions(&self, filter: &RecordFilter) -> Result<Vec<TransactionRecord>> {
        Ok(self
            .inner
            .lock()
            .transactions
            .iter()
            .filter(|t| {
                filter.matches(
                    &t.organization_id,
                    &t.transaction_type,
                    t.reference_entity_id.as_deref(),
                    &t.metadata,
                )
            })
            .cloned()
            .collect())
    }

    async fn create_transaction_line(
        &self,
        new: NewTransactionLine,
    ) -> Result<TransactionLineRecord> {
        let mut inner = self.inner.lock();
        if !inner.transactions.iter().any(|t| t.id == new.transaction_id) {
            return Err(StoreError::not_found("transaction", new.transaction_id));
        }
        let ts = now();
        let record = TransactionLineRecord {
            id: new_id(),
            organization_id: new.organization_id,
            transaction_id: new.transaction_id,
            line_number: new.line_number,
            line_type: new.line_type,
            smart_code: new.smart_code,
            entity_id: new.entity_id,
            metadata: new.metadata,
            created_at: ts,
            updated_at: ts,
        };
        inner.lines.push(record.clone());
        Ok(record)
    }

    async fn get_transaction_line(&self, id: &str) -> Result<TransactionLineRecord> {
        self.inner
            .lock()
            .lines
            .iter()
            .find(|l| l.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("transaction line", id))
    }

    async fn update_transaction_line(
        &self,
        id: &str,
        patch: Metadata,
    ) -> Result<TransactionLineRecord> {
        let mut inner = self.inner.lock();
        let record = inner
            .lines
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| StoreError::not_found("transaction line", id))?;
        merge_metadata(&mut record.metadata, patch);
        record.updated_at = now();
        Ok(record.clone())
    }

    async fn query_transaction_lines(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<TransactionLineRecord>> {
        let inner = self.inner.lock();
        let mut lines: Vec<_> = inner
            .lines
            .iter()
            .filter(|l| {
                filter.matches(
                    &l.organization_id,
                    &l.line_type,
                    Some(&l.transaction_id),
                    &l.metadata,
                )
            })
            .cloned()
            .collect();
        let position: HashMap<&str, usize> = inner
            .transactions
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        lines.sort_by_key(|l| {
            (
                position.get(l.transaction_id.as_str()).copied(),
                l.line_number,
            )
        });
        Ok(lines)
    }

    async fn claim_transaction_line(
        &self,
        id: &str,
        expected_status: &str,
        patch: Metadata,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let record = inner
            .lines
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| StoreError::not_found("transaction line", id))?;
        if line_status(record) != Some(expected_status) {
            return Ok(false);
        }
        merge_metadata(&mut record.metadata, patch);
        record.updated_at = now();
        Ok(true)
    }

    async fn create_relationship(&self, new: NewRelationship) -> Result<RelationshipRecord> {
        let record = RelationshipRecord {
            id: new_id(),
            organization_id: new.organization_id,
            from_entity_id: new.from_entity_id,
            to_entity_id: new.to_entity_id,
            relationship_type: new.relationship_type,
            smart_code: new.smart_code,
            metadata: new.metadata,
            created_at: now(),
        };
        self.inner.lock().relationships.push(record.clone());
        Ok(record)
    }

    async fn query_relationships(
        &self,
        from_entity_id: &str,
        relationship_type: &str,
    ) -> Result<Vec<RelationshipRecord>> {
        Ok(self
            .inner
            .lock()
            .relationships
            .iter()
            .filter(|r| {
                r.from_entity_id == from_entity_id && r.relationship_type == relationship_type
            })
            .cloned()
            .collect())
    }

    async fn get_dynamic_field(&self, entity_id: &str, field_name: &str) -> Result<Option<Value>> {
        Ok(self
            .inner
            .lock()
            .dynamic_fields
            .get(&(entity_id.to_string(), field_name.to_string()))
            .cloned())
    }

    async fn set_dynamic_field(
        &self,
        entity_id: &str,
        field_name: &str,
        value: Value,
    ) -> Result<()> {
        self.inner
            .lock()
            .dynamic_fields
            .insert((entity_id.to_string(), field_name.to_string()), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    async fn seed_run(store: &MemoryStore) -> TransactionRecord {
        store
            .create_transaction(NewTransaction {
                organization_id: "org-1".into(),
                transaction_type: "playbook_run".into(),
                transaction_code: "RUN-1".into(),
                smart_code: "PLAYBOOK.RUN.INSTANCE.v1".into(),
                reference_entity_id: Some("pb-1".into()),
                metadata: meta(json!({"status": "queued"})),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_entity_crud() {
        let store = MemoryStore::new();
        let created = store
            .create_entity(NewEntity {
                organization_id: "org-1".into(),
                entity_type: "playbook_definition".into(),
                entity_code: "PB".into(),
                entity_name: "Playbook".into(),
                smart_code: "PLAYBOOK.DEFINITION.CORE.v1".into(),
                metadata: meta(json!({"status": "draft"})),
            })
            .await
            .unwrap();

        let updated = store
            .update_entity(&created.id, meta(json!({"status": "published"})))
            .await
            .unwrap();
        assert_eq!(updated.metadata["status"], json!("published"));

        let found = store
            .query_entities(&RecordFilter::new().metadata_eq("status", "published"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let err = store.get_entity("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_lines_sorted_by_number() {
        let store = MemoryStore::new();
        let run = seed_run(&store).await;
        for n in [3, 1, 2] {
            store
                .create_transaction_line(NewTransactionLine {
                    organization_id: "org-1".into(),
                    transaction_id: run.id.clone(),
                    line_number: n,
                    line_type: "step_execution".into(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let lines = store
            .query_transaction_lines(&RecordFilter::new().parent(run.id.clone()))
            .await
            .unwrap();
        let numbers: Vec<u32> = lines.iter().map(|l| l.line_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_line_requires_transaction() {
        let store = MemoryStore::new();
        let err = store
            .create_transaction_line(NewTransactionLine {
                transaction_id: "nope".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_claim_only_once() {
        let store = MemoryStore::new();
        let run = seed_run(&store).await;
        let line = store
            .create_transaction_line(NewTransactionLine {
                organization_id: "org-1".into(),
                transaction_id: run.id,
                line_number: 1,
                line_type: "step_execution".into(),
                metadata: meta(json!({"status": "pending"})),
                ..Default::default()
            })
            .await
            .unwrap();

        let patch = meta(json!({"status": "running", "claimed_by": "a"}));
        assert!(
            store
                .claim_transaction_line(&line.id, "pending", patch.clone())
                .await
                .unwrap()
        );
        assert!(
            !store
                .claim_transaction_line(&line.id, "pending", patch)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_dynamic_fields() {
        let store = MemoryStore::new();
        assert!(
            store
                .get_dynamic_field("e1", "input_contract")
                .await
                .unwrap()
                .is_none()
        );
        store
            .set_dynamic_field("e1", "input_contract", json!({"type": "object"}))
            .await
            .unwrap();
        assert_eq!(
            store.get_dynamic_field("e1", "input_contract").await.unwrap(),
            Some(json!({"type": "object"}))
        );
    }
}
