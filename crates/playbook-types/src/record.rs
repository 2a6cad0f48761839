//! Generic persisted records.
//!
//! The backing store knows nothing about playbooks. It stores entities,
//! transactions, transaction lines and relationships, each with a smart code
//! and a metadata bag. Creation uses the `New*` structs; the store assigns
//! ids and timestamps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Id, Timestamp};

/// Free-form structured metadata attached to every record.
pub type Metadata = serde_json::Map<String, Value>;

/// A master-data record (playbook definitions, step definitions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: Id,
    pub organization_id: Id,
    pub entity_type: String,
    pub entity_code: String,
    pub entity_name: String,
    pub smart_code: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A business event record (runs, transitions, audit entries, human tasks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Id,
    pub organization_id: Id,
    pub transaction_type: String,
    pub transaction_code: String,
    pub smart_code: String,
    #[serde(default)]
    pub reference_entity_id: Option<Id>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A line belonging to a transaction (step executions within a run).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionLineRecord {
    pub id: Id,
    pub organization_id: Id,
    pub transaction_id: Id,
    pub line_number: u32,
    pub line_type: String,
    pub smart_code: String,
    #[serde(default)]
    pub entity_id: Option<Id>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A directed link between two entities (`has_step`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub id: Id,
    pub organization_id: Id,
    pub from_entity_id: Id,
    pub to_entity_id: Id,
    pub relationship_type: String,
    pub smart_code: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Default)]
pub struct NewEntity {
    pub organization_id: Id,
    pub entity_type: String,
    pub entity_code: String,
    pub entity_name: String,
    pub smart_code: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default)]
pub struct NewTransaction {
    pub organization_id: Id,
    pub transaction_type: String,
    pub transaction_code: String,
    pub smart_code: String,
    pub reference_entity_id: Option<Id>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default)]
pub struct NewTransactionLine {
    pub organization_id: Id,
    pub transaction_id: Id,
    pub line_number: u32,
    pub line_type: String,
    pub smart_code: String,
    pub entity_id: Option<Id>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default)]
pub struct NewRelationship {
    pub organization_id: Id,
    pub from_entity_id: Id,
    pub to_entity_id: Id,
    pub relationship_type: String,
    pub smart_code: String,
    pub metadata: Metadata,
}

/// Read a string field from a metadata bag.
pub fn metadata_str<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(Value::as_str)
}

/// Shallow-merge `patch` into `target`; keys in `patch` win.
pub fn merge_metadata(target: &mut Metadata, patch: Metadata) {
    for (key, value) in patch {
        target.insert(key, value);
    }
}
