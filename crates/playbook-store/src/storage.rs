//! Persistence adapter trait for generic records.
//!
//! The engine never assumes a relational schema. Everything it stores goes
//! through the operations below, plus a free-form metadata bag and a smart
//! code string on every record.
//!
//! # Architecture
//!
//! ```text
//! PersistenceAdapter (trait)   - entity / transaction / line / relationship CRUD
//!     ├── MemoryStore          - in-process maps, used by tests and the CLI
//!     └── SqliteStore          - single-file SQLite database
//! ```

use async_trait::async_trait;
use serde_json::Value;

use playbook_types::{
    EntityRecord, Id, Metadata, NewEntity, NewRelationship, NewTransaction, NewTransactionLine,
    RelationshipRecord, TransactionLineRecord, TransactionRecord,
};

use crate::Result;

/// Query-by-filter over any record collection.
///
/// Column filters apply to the collection's own columns; `metadata` holds
/// equality predicates on top-level metadata keys.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub organization_id: Option<Id>,
    /// `entity_type`, `transaction_type` or `line_type` depending on the collection.
    pub record_type: Option<String>,
    /// `reference_entity_id` for transactions, `transaction_id` for lines.
    pub parent_id: Option<Id>,
    pub metadata: Vec<(String, Value)>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn organization(mut self, organization_id: impl Into<Id>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn record_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_type = Some(record_type.into());
        self
    }

    pub fn parent(mut self, parent_id: impl Into<Id>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn metadata_eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    pub(crate) fn matches(
        &self,
        organization_id: &str,
        record_type: &str,
        parent_id: Option<&str>,
        metadata: &Metadata,
    ) -> bool {
        if let Some(ref org) = self.organization_id
            && org != organization_id
        {
            return false;
        }
        if let Some(ref ty) = self.record_type
            && ty != record_type
        {
            return false;
        }
        if let Some(ref parent) = self.parent_id
            && Some(parent.as_str()) != parent_id
        {
            return false;
        }
        self.metadata
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected))
    }
}

/// Generic CRUD over the record collections the engine persists into.
///
/// `update_*` operations shallow-merge the given patch into the record's
/// metadata and bump `updated_at`. Missing records fail with
/// [`StoreError::NotFound`](crate::StoreError::NotFound).
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    // ── Entities ────────────────────────────────────────────────────────

    async fn create_entity(&self, new: NewEntity) -> Result<EntityRecord>;

    async fn get_entity(&self, id: &str) -> Result<EntityRecord>;

    async fn update_entity(&self, id: &str, patch: Metadata) -> Result<EntityRecord>;

    async fn query_entities(&self, filter: &RecordFilter) -> Result<Vec<EntityRecord>>;

    // ── Transactions ────────────────────────────────────────────────────

    async fn create_transaction(&self, new: NewTransaction) -> Result<TransactionRecord>;

    async fn get_transaction(&self, id: &str) -> Result<TransactionRecord>;

    async fn update_transaction(&self, id: &str, patch: Metadata) -> Result<TransactionRecord>;

    /// Matching transactions in creation order.
    async fn query_transactions(&self, filter: &RecordFilter) -> Result<Vec<TransactionRecord>>;

    // ── Transaction lines ───────────────────────────────────────────────

    async fn create_transaction_line(&self, new: NewTransactionLine)
    -> Result<TransactionLineRecord>;

    async fn get_transaction_line(&self, id: &str) -> Result<TransactionLineRecord>;

    async fn update_transaction_line(
        &self,
        id: &str,
        patch: Metadata,
    ) -> Result<TransactionLineRecord>;

    /// Matching lines ordered by transaction, then line number.
    async fn query_transaction_lines(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<TransactionLineRecord>>;

    /// Conditionally apply `patch` to a line.
    ///
    /// The patch is applied only if the line's `metadata.status` still equals
    /// `expected_status`; returns whether it was applied.
    async fn claim_transaction_line(
        &self,
        id: &str,
        expected_status: &str,
        patch: Metadata,
    ) -> Result<bool>;

    // ── Relationships ───────────────────────────────────────────────────

    async fn create_relationship(&self, new: NewRelationship) -> Result<RelationshipRecord>;

    async fn query_relationships(
        &self,
        from_entity_id: &str,
        relationship_type: &str,
    ) -> Result<Vec<RelationshipRecord>>;

    // ── Dynamic fields ──────────────────────────────────────────────────

    async fn get_dynamic_field(&self, entity_id: &str, field_name: &str) -> Result<Option<Value>>;

    async fn set_dynamic_field(&self, entity_id: &str, field_name: &str, value: Value)
    -> Result<()>;
}
