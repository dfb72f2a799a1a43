#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use trip_ledger_core::model::{format_iso_millis, now_utc};
use trip_ledger_core::{
    CleanupItemKind, CleanupReason, LinkCleanupEntry, StoreError, TripBlobStore, TripId,
    VersionedBlob,
};
use ulid::Ulid;

const TRIP_STORE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_TRIP_STORE_V1: &str = r"
CREATE TABLE IF NOT EXISTS trip_documents (
  trip_id TEXT PRIMARY KEY,
  body_json TEXT NOT NULL,
  document_version INTEGER NOT NULL CHECK (document_version >= 1),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS link_cleanup_log (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  trip_id TEXT NOT NULL,
  item_kind TEXT NOT NULL,
  item_id TEXT NOT NULL,
  expense_id TEXT NOT NULL,
  reason TEXT NOT NULL,
  schema_version INTEGER NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_link_cleanup_log_trip
  ON link_cleanup_log(trip_id, entry_seq);
";

pub struct SqliteTripStore {
    conn: Connection,
}

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Written(u64),
    Conflict { actual: Option<u64> },
}

impl SqliteTripStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_TRIP_STORE_V1)
            .context("failed to apply trip store schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![TRIP_STORE_MIGRATION_VERSION, format_iso_millis(now_utc())],
            )
            .context("failed to register trip store schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to query schema_migrations")
    }

    pub fn read_raw(&self, trip_id: &TripId) -> Result<Option<(String, u64)>> {
        let row = self
            .conn
            .query_row(
                "SELECT body_json, document_version FROM trip_documents WHERE trip_id = ?1",
                params![trip_id.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to read trip {trip_id}"))?;

        row.map(|(body, version)| {
            let version = u64::try_from(version)
                .with_context(|| format!("invalid document_version for {trip_id}: {version}"))?;
            Ok((body, version))
        })
        .transpose()
    }

    pub fn write_blob(
        &mut self,
        trip_id: &TripId,
        body: &Value,
        expected: Option<u64>,
    ) -> Result<WriteResult> {
        let payload = serde_json::to_string(body).context("failed to serialize trip body")?;
        let now = format_iso_millis(now_utc());

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start trip write transaction")?;

        let actual = tx
            .query_row(
                "SELECT document_version FROM trip_documents WHERE trip_id = ?1",
                params![trip_id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to read current document_version")?
            .map(u64::try_from)
            .transpose()
            .context("invalid stored document_version")?;

        if actual != expected {
            return Ok(WriteResult::Conflict { actual });
        }

        let next = expected.map_or(1, |version| version + 1);
        let next_sql = i64::try_from(next).context("document_version overflow")?;

        match expected {
            None => {
                tx.execute(
                    "INSERT INTO trip_documents(trip_id, body_json, document_version, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![trip_id.as_str(), payload, next_sql, now],
                )
                .context("failed to insert trip document")?;
            }
            Some(previous) => {
                let previous_sql = i64::try_from(previous).context("document_version overflow")?;
                let changed = tx
                    .execute(
                        "UPDATE trip_documents
                         SET body_json = ?2, document_version = ?3, updated_at = ?4
                         WHERE trip_id = ?1 AND document_version = ?5",
                        params![trip_id.as_str(), payload, next_sql, now, previous_sql],
                    )
                    .context("failed to update trip document")?;
                if changed != 1 {
                    return Err(anyhow!(
                        "trip {} changed inside write transaction (expected version {})",
                        trip_id,
                        previous
                    ));
                }
            }
        }

        tx.commit().context("failed to commit trip write")?;
        Ok(WriteResult::Written(next))
    }

    pub fn list_trip_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT trip_id FROM trip_documents ORDER BY trip_id ASC")?;
        let mut rows = stmt.query([])?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(row.get::<_, String>(0)?);
        }
        Ok(ids)
    }

    pub fn append_cleanup(&mut self, entries: &[LinkCleanupEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let now = format_iso_millis(now_utc());
        let tx = self
            .conn
            .transaction()
            .context("failed to start cleanup log transaction")?;

        for entry in entries {
            tx.execute(
                "INSERT INTO link_cleanup_log(
                    entry_id, trip_id, item_kind, item_id, expense_id,
                    reason, schema_version, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    Ulid::new().to_string(),
                    entry.trip_id,
                    entry.item_kind.as_str(),
                    entry.item_id,
                    entry.expense_id,
                    entry.reason.as_str(),
                    i64::from(entry.schema_version),
                    now,
                ],
            )
            .context("failed to append link cleanup entry")?;
        }

        tx.commit().context("failed to commit cleanup log")?;
        Ok(entries.len())
    }

    pub fn list_cleanup(&self, trip_id: &str) -> Result<Vec<LinkCleanupEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT trip_id, item_kind, item_id, expense_id, reason, schema_version
             FROM link_cleanup_log
             WHERE trip_id = ?1
             ORDER BY entry_seq ASC",
        )?;
        let mut rows = stmt.query(params![trip_id])?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let item_kind_raw: String = row.get(1)?;
            let reason_raw: String = row.get(4)?;
            let schema_version_i64: i64 = row.get(5)?;

            entries.push(LinkCleanupEntry {
                trip_id: row.get(0)?,
                item_kind: CleanupItemKind::parse(&item_kind_raw)
                    .ok_or_else(|| anyhow!("invalid item_kind in cleanup log: {item_kind_raw}"))?,
                item_id: row.get(2)?,
                expense_id: row.get(3)?,
                reason: CleanupReason::parse(&reason_raw)
                    .ok_or_else(|| anyhow!("invalid reason in cleanup log: {reason_raw}"))?,
                schema_version: u32::try_from(schema_version_i64).with_context(|| {
                    format!("invalid schema_version in cleanup log: {schema_version_i64}")
                })?,
            });
        }
        Ok(entries)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn backend(err: &anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{err:#}"))
}

impl TripBlobStore for SqliteTripStore {
    fn read(&self, trip_id: &TripId) -> Result<Option<VersionedBlob>, StoreError> {
        let Some((raw, document_version)) = self.read_raw(trip_id).map_err(|err| backend(&err))?
        else {
            return Ok(None);
        };

        let body = serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt {
            trip_id: trip_id.to_string(),
            reason: format!("stored body is not JSON: {err}"),
        })?;
        Ok(Some(VersionedBlob {
            body,
            document_version,
        }))
    }

    fn write(
        &mut self,
        trip_id: &TripId,
        body: &Value,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        match self
            .write_blob(trip_id, body, expected)
            .map_err(|err| backend(&err))?
        {
            WriteResult::Written(version) => Ok(version),
            WriteResult::Conflict { actual } => Err(StoreError::Conflict {
                trip_id: trip_id.to_string(),
                expected,
                actual,
            }),
        }
    }

    fn trip_ids(&self) -> Result<Vec<TripId>, StoreError> {
        let raw = self.list_trip_ids().map_err(|err| backend(&err))?;
        Ok(raw
            .into_iter()
            .filter_map(|raw| match TripId::parse(&raw) {
                Ok(trip_id) => Some(trip_id),
                Err(err) => {
                    tracing::warn!(error = %err, "ignoring stored trip with invalid id");
                    None
                }
            })
            .collect())
    }

    fn record_link_cleanup(&mut self, entries: &[LinkCleanupEntry]) -> Result<(), StoreError> {
        self.append_cleanup(entries)
            .map(drop)
            .map_err(|err| backend(&err))
    }

    fn link_cleanup_log(&self, trip_id: &TripId) -> Result<Vec<LinkCleanupEntry>, StoreError> {
        self.list_cleanup(trip_id.as_str())
            .map_err(|err| backend(&err))
    }
}
