//! SQLite-backed record store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::Value;

use playbook_types::record::merge_metadata;
use playbook_types::{
    EntityRecord, Metadata, NewEntity, NewRelationship, NewTransaction, NewTransactionLine,
    RelationshipRecord, Timestamp, TransactionLineRecord, TransactionRecord, new_id, now,
};

use crate::storage::{PersistenceAdapter, RecordFilter};
use crate::{Result, StoreError};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

const ENTITY_COLUMNS: &str = "id, organization_id, entity_type, entity_code, entity_name, smart_code, metadata, created_at, updated_at";
const TRANSACTION_COLUMNS: &str = "id, organization_id, transaction_type, transaction_code, smart_code, reference_entity_id, metadata, created_at, updated_at";
const LINE_COLUMNS: &str = "id, organization_id, transaction_id, line_number, line_type, smart_code, entity_id, metadata, created_at, updated_at";

/// [`PersistenceAdapter`] over a single SQLite database.
///
/// Metadata bags are stored as JSON text. Column filters run in SQL; metadata
/// equality filters run after loading. Thread-safe via an internal mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run pending migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let mut store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&mut self) -> Result<()> {
        let conn = self.conn.get_mut();
        let report = embedded::migrations::runner()
            .run(conn)
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        tracing::debug!(
            applied = report.applied_migrations().len(),
            "Record store migrations complete"
        );
        Ok(())
    }
}

// ── Row mapping ─────────────────────────────────────────────────────────

fn parse_dt(idx: usize, raw: String) -> rusqlite::Result<Timestamp> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_metadata(idx: usize, raw: String) -> rusqlite::Result<Metadata> {
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<EntityRecord> {
    Ok(EntityRecord {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        entity_type: row.get(2)?,
        entity_code: row.get(3)?,
        entity_name: row.get(4)?,
        smart_code: row.get(5)?,
        metadata: parse_metadata(6, row.get(6)?)?,
        created_at: parse_dt(7, row.get(7)?)?,
        updated_at: parse_dt(8, row.get(8)?)?,
    })
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<TransactionRecord> {
    Ok(TransactionRecord {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        transaction_type: row.get(2)?,
        transaction_code: row.get(3)?,
        smart_code: row.get(4)?,
        reference_entity_id: row.get(5)?,
        metadata: parse_metadata(6, row.get(6)?)?,
        created_at: parse_dt(7, row.get(7)?)?,
        updated_at: parse_dt(8, row.get(8)?)?,
    })
}

fn line_from_row(row: &Row<'_>) -> rusqlite::Result<TransactionLineRecord> {
    Ok(TransactionLineRecord {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        transaction_id: row.get(2)?,
        line_number: row.get(3)?,
        line_type: row.get(4)?,
        smart_code: row.get(5)?,
        entity_id: row.get(6)?,
        metadata: parse_metadata(7, row.get(7)?)?,
        created_at: parse_dt(8, row.get(8)?)?,
        updated_at: parse_dt(9, row.get(9)?)?,
    })
}

fn relationship_from_row(row: &Row<'_>) -> rusqlite::Result<RelationshipRecord> {
    Ok(RelationshipRecord {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        from_entity_id: row.get(2)?,
        to_entity_id: row.get(3)?,
        relationship_type: row.get(4)?,
        smart_code: row.get(5)?,
        metadata: parse_metadata(6, row.get(6)?)?,
        created_at: parse_dt(7, row.get(7)?)?,
    })
}

/// Build a `WHERE` clause for the column part of a filter.
fn column_clause(
    filter: &RecordFilter,
    type_column: &str,
    parent_column: Option<&str>,
) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();
    if let Some(ref org) = filter.organization_id {
        args.push(org.clone());
        clauses.push(format!("organization_id = ?{}", args.len()));
    }
    if let Some(ref ty) = filter.record_type {
        args.push(ty.clone());
        clauses.push(format!("{type_column} = ?{}", args.len()));
    }
    if let (Some(parent), Some(column)) = (&filter.parent_id, parent_column) {
        args.push(parent.clone());
        clauses.push(format!("{column} = ?{}", args.len()));
    }
    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), args)
    }
}

fn metadata_matches(filter: &RecordFilter, metadata: &Metadata) -> bool {
    filter
        .metadata
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}

// ── Adapter ─────────────────────────────────────────────────────────────

#[async_trait]
impl PersistenceAdapter for SqliteStore {
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
        self.conn.lock().execute(
            "INSERT INTO entities (id, organization_id, entity_type, entity_code, entity_name, smart_code, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                record.id,
                record.organization_id,
                record.entity_type,
                record.entity_code,
                record.entity_name,
                record.smart_code,
                serde_json::to_string(&record.metadata)?,
                ts.to_rfc3339(),
            ],
        )?;
        Ok(record)
    }

    async fn get_entity(&self, id: &str) -> Result<EntityRecord> {
        self.conn
            .lock()
            .query_row(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?1"),
                params![id],
                entity_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("entity", id))
    }

    async fn update_entity(&self, id: &str, patch: Metadata) -> Result<EntityRecord> {
        let mut record = self.get_entity(id).await?;
        merge_metadata(&mut record.metadata, patch);
        record.updated_at = now();
        self.conn.lock().execute(
            "UPDATE entities SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&record.metadata)?,
                record.updated_at.to_rfc3339(),
                id
            ],
        )?;
        Ok(record)
    }

    async fn query_entities(&self, filter: &RecordFilter) -> Result<Vec<EntityRecord>> {
        let (clause, args) = column_clause(filter, "entity_type", None);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities{clause} ORDER BY rowid"
        ))?;
        let rows = stmt.query_map(params_from_iter(args.iter()), entity_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            let record = row?;
            if metadata_matches(filter, &record.metadata) {
                out.push(record);
            }
        }
        Ok(out)
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
        self.conn.lock().execute(
            "INSERT INTO transactions (id, organization_id, transaction_type, transaction_code, smart_code, reference_entity_id, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                record.id,
                record.organization_id,
                record.transaction_type,
                record.transaction_code,
                record.smart_code,
                record.reference_entity_id,
                serde_json::to_string(&record.metadata)?,
                ts.to_rfc3339(),
            ],
        )?;
        Ok(record)
    }

    async fn get_transaction(&self, id: &str) -> Result<TransactionRecord> {
        self.conn
            .lock()
            .query_row(
                &format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1"),
                params![id],
                transaction_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("transaction", id))
    }

    async fn update_transaction(&self, id: &str, patch: Metadata) -> Result<TransactionRecord> {
        let mut record = self.get_transaction(id).await?;
        merge_metadata(&mut record.metadata, patch);
        record.updated_at = now();
        self.conn.lock().execute(
            "UPDATE transactions SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&record.metadata)?,
                record.updated_at.to_rfc3339(),
                id
            ],
        )?;
        Ok(record)
    }

    async fn query_transactions(&self, filter: &RecordFilter) -> Result<Vec<TransactionRecord>> {
        let (clause, args) = column_clause(filter, "transaction_type", Some("reference_entity_id"));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions{clause} ORDER BY rowid"
        ))?;
        let rows = stmt.query_map(params_from_iter(args.iter()), transaction_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            let record = row?;
            if metadata_matches(filter, &record.metadata) {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn create_transaction_line(
        &self,
        new: NewTransactionLine,
    ) -> Result<TransactionLineRecord> {
        // Surface a missing parent as NotFound rather than a constraint error.
        self.get_transaction(&new.transaction_id).await?;
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
        self.conn.lock().execute(
            "INSERT INTO transaction_lines (id, organization_id, transaction_id, line_number, line_type, smart_code, entity_id, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                record.id,
                record.organization_id,
                record.transaction_id,
                record.line_number,
                record.line_type,
                record.smart_code,
                record.entity_id,
                serde_json::to_string(&record.metadata)?,
                ts.to_rfc3339(),
            ],
        )?;
        Ok(record)
    }

    async fn get_transaction_line(&self, id: &str) -> Result<TransactionLineRecord> {
        self.conn
            .lock()
            .query_row(
                &format!("SELECT {LINE_COLUMNS} FROM transaction_lines WHERE id = ?1"),
                params![id],
                line_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("transaction line", id))
    }

    async fn update_transaction_line(
        &self,
        id: &str,
        patch: Metadata,
    ) -> Result<TransactionLineRecord> {
        let mut record = self.get_transaction_line(id).await?;
        merge_metadata(&mut record.metadata, patch);
        record.updated_at = now();
        self.conn.lock().execute(
            "UPDATE transaction_lines SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&record.metadata)?,
                record.updated_at.to_rfc3339(),
                id
            ],
        )?;
        Ok(record)
    }

    async fn query_transaction_lines(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<TransactionLineRecord>> {
        let (clause, args) = column_clause(filter, "line_type", Some("transaction_id"));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT l.id, l.organization_id, l.transaction_id, l.line_number, l.line_type, l.smart_code, l.entity_id, l.metadata, l.created_at, l.updated_at
             FROM (SELECT {LINE_COLUMNS} FROM transaction_lines{clause}) l
             JOIN transactions t ON t.id = l.transaction_id
             ORDER BY t.rowid, l.line_number"
        ))?;
        let rows = stmt.query_map(params_from_iter(args.iter()), line_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            let record = row?;
            if metadata_matches(filter, &record.metadata) {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn claim_transaction_line(
        &self,
        id: &str,
        expected_status: &str,
        patch: Metadata,
    ) -> Result<bool> {
        let mut record = self.get_transaction_line(id).await?;
        if record.metadata.get("status").and_then(Value::as_str) != Some(expected_status) {
            return Ok(false);
        }
        merge_metadata(&mut record.metadata, patch);
        // The status predicate makes the claim safe across connections too.
        let changed = self.conn.lock().execute(
            "UPDATE transaction_lines SET metadata = ?1, updated_at = ?2
             WHERE id = ?3 AND json_extract(metadata, '$.status') = ?4",
            params![
                serde_json::to_string(&record.metadata)?,
                now().to_rfc3339(),
                id,
                expected_status
            ],
        )?;
        Ok(changed == 1)
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
        self.conn.lock().execute(
            "INSERT INTO relationships (id, organization_id, from_entity_id, to_entity_id, relationship_type, smart_code, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.organization_id,
                record.from_entity_id,
                record.to_entity_id,
                record.relationship_type,
                record.smart_code,
                serde_json::to_string(&record.metadata)?,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(record)
    }

    async fn query_relationships(
        &self,
        from_entity_id: &str,
        relationship_type: &str,
    ) -> Result<Vec<RelationshipRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, from_entity_id, to_entity_id, relationship_type, smart_code, metadata, created_at
             FROM relationships WHERE from_entity_id = ?1 AND relationship_type = ?2 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![from_entity_id, relationship_type], relationship_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn get_dynamic_field(&self, entity_id: &str, field_name: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM dynamic_fields WHERE entity_id = ?1 AND field_name = ?2",
                params![entity_id, field_name],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn set_dynamic_field(
        &self,
        entity_id: &str,
        field_name: &str,
        value: Value,
    ) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO dynamic_fields (entity_id, field_name, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(entity_id, field_name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![
                entity_id,
                field_name,
                serde_json::to_string(&value)?,
                now().to_rfc3339()
            ],
        )?;
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

    #[tokio::test]
    async fn test_transaction_roundtrip_with_filter() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store
            .create_transaction(NewTransaction {
                organization_id: "org-1".into(),
                transaction_type: "playbook_run".into(),
                transaction_code: "RUN-1".into(),
                smart_code: "PLAYBOOK.RUN.INSTANCE.v1".into(),
                reference_entity_id: Some("pb-1".into()),
                metadata: meta(json!({"status": "queued"})),
            })
            .await
            .unwrap();

        store
            .update_transaction(&run.id, meta(json!({"status": "in_progress"})))
            .await
            .unwrap();

        let found = store
            .query_transactions(
                &RecordFilter::new()
                    .organization("org-1")
                    .parent("pb-1")
                    .metadata_eq("status", "in_progress"),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].transaction_code, "RUN-1");
    }

    #[tokio::test]
    async fn test_claim_is_conditional() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store
            .create_transaction(NewTransaction {
                organization_id: "org-1".into(),
                transaction_type: "playbook_run".into(),
                ..Default::default()
            })
            .await
            .unwrap();
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

        let patch = meta(json!({"status": "running"}));
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
    async fn test_dynamic_field_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("records.db")).unwrap();
        store
            .set_dynamic_field("pb", "sla_policy", json!({"rules": {}}))
            .await
            .unwrap();
        store
            .set_dynamic_field("pb", "sla_policy", json!({"rules": {"overall_hours": 4}}))
            .await
            .unwrap();
        let value = store.get_dynamic_field("pb", "sla_policy").await.unwrap();
        assert_eq!(value, Some(json!({"rules": {"overall_hours": 4}})));
    }

    #[tokio::test]
    async fn test_relationships_in_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        for to in ["s1", "s2"] {
            store
                .create_relationship(NewRelationship {
                    organization_id: "org".into(),
                    from_entity_id: "pb".into(),
                    to_entity_id: to.into(),
                    relationship_type: "has_step".into(),
                    smart_code: "PLAYBOOK.REL.HAS_STEP.v1".into(),
                    metadata: Metadata::new(),
                })
                .await
                .unwrap();
        }
        let rels = store.query_relationships("pb", "has_step").await.unwrap();
        let targets: Vec<_> = rels.iter().map(|r| r.to_entity_id.as_str()).collect();
        assert_eq!(targets, vec!["s1", "s2"]);
    }
}
