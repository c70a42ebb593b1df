//! SQLite persistence for the budget engine.
//!
//! One `BudgetStore` owns every table the engine reads through its APIs:
//! entity tables (`envelopes`, `transactions`, `bills`, `budget_meta`), the
//! append-only commit log (`commits`, `changes`), sync bookkeeping
//! (`sync_state`), and pre-sync backups. Multi-row writes that must be
//! all-or-nothing (commit + changes, whole-snapshot apply) run inside a
//! single SQLite transaction.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use uuid::Uuid;

use wren_core::*;

/// Default number of connections in the pool. WAL mode supports one writer
/// plus N readers, so a small pool removes head-of-line blocking for reads.
const DEFAULT_POOL_SIZE: usize = 4;

pub struct BudgetStore {
    /// Round-robin pool; each connection is independently protected by a
    /// `Mutex` so callers run synchronous rusqlite operations without
    /// holding an async lock across `.await`.
    pool: Vec<Mutex<Connection>>,
    next_slot: std::sync::atomic::AtomicUsize,
}

/// A stored pre-sync backup row.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    /// JSON-serialized `SyncSnapshot`.
    pub payload: String,
}

impl BudgetStore {
    pub fn open(path: &Path) -> WrenResult<Self> {
        let mut pool = Vec::with_capacity(DEFAULT_POOL_SIZE);
        for _ in 0..DEFAULT_POOL_SIZE {
            pool.push(Mutex::new(Self::open_connection(path)?));
        }
        let store = Self {
            pool,
            next_slot: std::sync::atomic::AtomicUsize::new(0),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// In-memory store for tests. Uses a shared-cache URI so every pooled
    /// connection sees the same database.
    pub fn open_in_memory() -> WrenResult<Self> {
        let uri = format!("file:memdb{}?mode=memory&cache=shared", Uuid::now_v7());
        let flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
            | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX
            | rusqlite::OpenFlags::SQLITE_OPEN_URI;
        let mut pool = Vec::with_capacity(DEFAULT_POOL_SIZE);
        for _ in 0..DEFAULT_POOL_SIZE {
            let conn = Connection::open_with_flags(&uri, flags)
                .map_err(|e| WrenError::Storage(format!("open in-memory sqlite: {e}")))?;
            conn.execute_batch("PRAGMA foreign_keys=ON;")
                .map_err(|e| WrenError::Storage(format!("pragma error: {e}")))?;
            pool.push(Mutex::new(conn));
        }
        let store = Self {
            pool,
            next_slot: std::sync::atomic::AtomicUsize::new(0),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn open_connection(path: &Path) -> WrenResult<Connection> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WrenError::Storage(format!("create db directory: {e}")))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| WrenError::Storage(format!("open sqlite: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| WrenError::Storage(format!("pragma error: {e}")))?;
        Ok(conn)
    }

    /// Execute a synchronous closure with a pooled connection. The guard
    /// drops before any `.await` in the caller, keeping futures `Send`.
    fn with_conn<F, T>(&self, f: F) -> WrenResult<T>
    where
        F: FnOnce(&Connection) -> WrenResult<T>,
    {
        let idx = self
            .next_slot
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % self.pool.len();
        let conn = self.pool[idx]
            .lock()
            .map_err(|e| WrenError::Storage(e.to_string()))?;
        f(&conn)
    }

    fn run_migrations(&self) -> WrenResult<()> {
        // Migrations run on slot 0 only.
        let conn = self.pool[0]
            .lock()
            .map_err(|e| WrenError::Storage(e.to_string()))?;

        const MIGRATIONS: &[(i64, &str)] =
            &[(1, include_str!("../migrations/001_initial.sql"))];

        let current: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|e| WrenError::Storage(format!("read schema version: {e}")))?;

        for (version, sql) in MIGRATIONS {
            if current >= *version {
                continue;
            }
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| WrenError::Storage(format!("begin migration {version}: {e}")))?;
            tx.execute_batch(sql)
                .map_err(|e| WrenError::Storage(format!("apply migration {version}: {e}")))?;
            tx.pragma_update(None, "user_version", *version)
                .map_err(|e| WrenError::Storage(format!("set schema version: {e}")))?;
            tx.commit()
                .map_err(|e| WrenError::Storage(format!("commit migration {version}: {e}")))?;
            tracing::info!(version, "applied schema migration");
        }
        Ok(())
    }

    // -- Envelopes -----------------------------------------------------------

    pub fn upsert_envelope(&self, envelope: &Envelope) -> WrenResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO envelopes (id, name, category, balance, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   name=excluded.name, category=excluded.category,
                   balance=excluded.balance, updated_at=excluded.updated_at",
                params![
                    envelope.id.to_string(),
                    envelope.name,
                    envelope.category,
                    envelope.balance.to_string(),
                    envelope.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| WrenError::Storage(format!("upsert envelope: {e}")))?;
            Ok(())
        })
    }

    pub fn get_envelope(&self, id: Uuid) -> WrenResult<Option<Envelope>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, category, balance, updated_at FROM envelopes WHERE id = ?1",
                params![id.to_string()],
                row_to_envelope,
            )
            .optional()
            .map_err(|e| WrenError::Storage(format!("get envelope: {e}")))
        })
    }

    pub fn delete_envelope(&self, id: Uuid) -> WrenResult<bool> {
        self.with_conn(|conn| {
            let affected = conn
                .execute(
                    "DELETE FROM envelopes WHERE id = ?1",
                    params![id.to_string()],
                )
                .map_err(|e| WrenError::Storage(format!("delete envelope: {e}")))?;
            Ok(affected > 0)
        })
    }

    pub fn list_envelopes(&self) -> WrenResult<Vec<Envelope>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, category, balance, updated_at
                     FROM envelopes ORDER BY name ASC",
                )
                .map_err(|e| WrenError::Storage(format!("list envelopes: {e}")))?;
            let rows = stmt
                .query_map([], row_to_envelope)
                .map_err(|e| WrenError::Storage(format!("list envelopes: {e}")))?;
            collect_rows(rows, "envelope")
        })
    }

    // -- Transactions --------------------------------------------------------

    pub fn upsert_transaction(&self, tx: &Transaction) -> WrenResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO transactions (id, envelope_id, description, amount, date, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                   envelope_id=excluded.envelope_id, description=excluded.description,
                   amount=excluded.amount, date=excluded.date, updated_at=excluded.updated_at",
                params![
                    tx.id.to_string(),
                    tx.envelope_id.map(|id| id.to_string()),
                    tx.description,
                    tx.amount.to_string(),
                    tx.date.to_rfc3339(),
                    tx.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| WrenError::Storage(format!("upsert transaction: {e}")))?;
            Ok(())
        })
    }

    pub fn get_transaction(&self, id: Uuid) -> WrenResult<Option<Transaction>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, envelope_id, description, amount, date, updated_at
                 FROM transactions WHERE id = ?1",
                params![id.to_string()],
                row_to_transaction,
            )
            .optional()
            .map_err(|e| WrenError::Storage(format!("get transaction: {e}")))
        })
    }

    pub fn delete_transaction(&self, id: Uuid) -> WrenResult<bool> {
        self.with_conn(|conn| {
            let affected = conn
                .execute(
                    "DELETE FROM transactions WHERE id = ?1",
                    params![id.to_string()],
                )
                .map_err(|e| WrenError::Storage(format!("delete transaction: {e}")))?;
            Ok(affected > 0)
        })
    }

    pub fn list_transactions(&self) -> WrenResult<Vec<Transaction>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, envelope_id, description, amount, date, updated_at
                     FROM transactions ORDER BY date DESC",
                )
                .map_err(|e| WrenError::Storage(format!("list transactions: {e}")))?;
            let rows = stmt
                .query_map([], row_to_transaction)
                .map_err(|e| WrenError::Storage(format!("list transactions: {e}")))?;
            collect_rows(rows, "transaction")
        })
    }

    // -- Bills ---------------------------------------------------------------

    pub fn upsert_bill(&self, bill: &Bill) -> WrenResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO bills (id, name, amount, due_date, frequency, envelope_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                   name=excluded.name, amount=excluded.amount, due_date=excluded.due_date,
                   frequency=excluded.frequency, envelope_id=excluded.envelope_id,
                   updated_at=excluded.updated_at",
                params![
                    bill.id.to_string(),
                    bill.name,
                    bill.amount.to_string(),
                    bill.due_date.to_rfc3339(),
                    bill.frequency,
                    bill.envelope_id.map(|id| id.to_string()),
                    bill.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| WrenError::Storage(format!("upsert bill: {e}")))?;
            Ok(())
        })
    }

    pub fn get_bill(&self, id: Uuid) -> WrenResult<Option<Bill>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, amount, due_date, frequency, envelope_id, updated_at
                 FROM bills WHERE id = ?1",
                params![id.to_string()],
                row_to_bill,
            )
            .optional()
            .map_err(|e| WrenError::Storage(format!("get bill: {e}")))
        })
    }

    pub fn delete_bill(&self, id: Uuid) -> WrenResult<bool> {
        self.with_conn(|conn| {
            let affected = conn
                .execute("DELETE FROM bills WHERE id = ?1", params![id.to_string()])
                .map_err(|e| WrenError::Storage(format!("delete bill: {e}")))?;
            Ok(affected > 0)
        })
    }

    pub fn list_bills(&self) -> WrenResult<Vec<Bill>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, amount, due_date, frequency, envelope_id, updated_at
                     FROM bills ORDER BY due_date ASC",
                )
                .map_err(|e| WrenError::Storage(format!("list bills: {e}")))?;
            let rows = stmt
                .query_map([], row_to_bill)
                .map_err(|e| WrenError::Storage(format!("list bills: {e}")))?;
            collect_rows(rows, "bill")
        })
    }

    // -- Budget meta ---------------------------------------------------------

    pub fn meta(&self) -> WrenResult<BudgetMeta> {
        self.with_conn(|conn| {
            let meta = conn
                .query_row(
                    "SELECT unassigned_cash, actual_balance, last_modified, sync_version
                     FROM budget_meta WHERE id = 1",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| WrenError::Storage(format!("get budget meta: {e}")))?;

            match meta {
                Some((cash, balance, modified, version)) => Ok(BudgetMeta {
                    unassigned_cash: parse_decimal(&cash)?,
                    actual_balance: parse_decimal(&balance)?,
                    last_modified: parse_datetime(&modified)?,
                    sync_version: version as u64,
                }),
                None => Ok(BudgetMeta::default()),
            }
        })
    }

    pub fn set_meta(&self, meta: &BudgetMeta) -> WrenResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO budget_meta (id, unassigned_cash, actual_balance, last_modified, sync_version)
                 VALUES (1, ?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                   unassigned_cash=excluded.unassigned_cash,
                   actual_balance=excluded.actual_balance,
                   last_modified=excluded.last_modified,
                   sync_version=excluded.sync_version",
                params![
                    meta.unassigned_cash.to_string(),
                    meta.actual_balance.to_string(),
                    meta.last_modified.to_rfc3339(),
                    meta.sync_version as i64,
                ],
            )
            .map_err(|e| WrenError::Storage(format!("set budget meta: {e}")))?;
            Ok(())
        })
    }

    // -- Snapshots -----------------------------------------------------------

    /// Materialize the full local state for diffing against the remote.
    pub fn load_snapshot(&self, author: &str, device_fingerprint: &str) -> WrenResult<SyncSnapshot> {
        let envelopes = self.list_envelopes()?;
        let transactions = self.list_transactions()?;
        let bills = self.list_bills()?;
        let meta = self.meta()?;
        Ok(SyncSnapshot {
            author: author.to_string(),
            device_fingerprint: device_fingerprint.to_string(),
            envelopes,
            transactions,
            bills,
            unassigned_cash: meta.unassigned_cash,
            actual_balance: meta.actual_balance,
            last_modified: meta.last_modified,
            sync_version: meta.sync_version,
        })
    }

    /// Replace every entity table with the snapshot's contents in ONE
    /// transaction; the accepted sync result is applied whole or not at all.
    pub fn replace_all(&self, snapshot: &SyncSnapshot) -> WrenResult<()> {
        self.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| WrenError::Transaction(format!("begin snapshot apply: {e}")))?;

            for table in ["envelopes", "transactions", "bills"] {
                tx.execute(&format!("DELETE FROM {table}"), [])
                    .map_err(|e| WrenError::Transaction(format!("clear {table}: {e}")))?;
            }

            for envelope in &snapshot.envelopes {
                tx.execute(
                    "INSERT INTO envelopes (id, name, category, balance, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        envelope.id.to_string(),
                        envelope.name,
                        envelope.category,
                        envelope.balance.to_string(),
                        envelope.updated_at.to_rfc3339(),
                    ],
                )
                .map_err(|e| WrenError::Transaction(format!("insert envelope: {e}")))?;
            }
            for t in &snapshot.transactions {
                tx.execute(
                    "INSERT INTO transactions (id, envelope_id, description, amount, date, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        t.id.to_string(),
                        t.envelope_id.map(|id| id.to_string()),
                        t.description,
                        t.amount.to_string(),
                        t.date.to_rfc3339(),
                        t.updated_at.to_rfc3339(),
                    ],
                )
                .map_err(|e| WrenError::Transaction(format!("insert transaction: {e}")))?;
            }
            for bill in &snapshot.bills {
                tx.execute(
                    "INSERT INTO bills (id, name, amount, due_date, frequency, envelope_id, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        bill.id.to_string(),
                        bill.name,
                        bill.amount.to_string(),
                        bill.due_date.to_rfc3339(),
                        bill.frequency,
                        bill.envelope_id.map(|id| id.to_string()),
                        bill.updated_at.to_rfc3339(),
                    ],
                )
                .map_err(|e| WrenError::Transaction(format!("insert bill: {e}")))?;
            }

            tx.execute(
                "INSERT INTO budget_meta (id, unassigned_cash, actual_balance, last_modified, sync_version)
                 VALUES (1, ?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                   unassigned_cash=excluded.unassigned_cash,
                   actual_balance=excluded.actual_balance,
                   last_modified=excluded.last_modified,
                   sync_version=excluded.sync_version",
                params![
                    snapshot.unassigned_cash.to_string(),
                    snapshot.actual_balance.to_string(),
                    snapshot.last_modified.to_rfc3339(),
                    snapshot.sync_version as i64,
                ],
            )
            .map_err(|e| WrenError::Transaction(format!("update budget meta: {e}")))?;

            tx.commit()
                .map_err(|e| WrenError::Transaction(format!("commit snapshot apply: {e}")))
        })
    }

    // -- Commit log ----------------------------------------------------------

    /// Persist a commit and its fan-out changes atomically: either both
    /// land or neither does. Changes are raw rows: the entity column is
    /// plain text, so history written by a newer schema still stores.
    pub fn create_commit_with_changes(
        &self,
        commit: &Commit,
        changes: &[RawChange],
    ) -> WrenResult<()> {
        self.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| WrenError::Transaction(format!("begin commit write: {e}")))?;

            tx.execute(
                "INSERT INTO commits (hash, timestamp, message, author, parent_hash, device_fingerprint)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    commit.hash,
                    commit.timestamp.to_rfc3339(),
                    commit.message,
                    commit.author,
                    commit.parent_hash,
                    commit.device_fingerprint,
                ],
            )
            .map_err(|e| WrenError::Transaction(format!("insert commit: {e}")))?;

            for change in changes {
                tx.execute(
                    "INSERT INTO changes (commit_hash, entity, entity_id, op, description, old_value, new_value)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        change.commit_hash,
                        change.entity,
                        change.entity_id,
                        change.op,
                        change.description,
                        change.old_value,
                        change.new_value,
                    ],
                )
                .map_err(|e| WrenError::Transaction(format!("insert change: {e}")))?;
            }

            tx.commit()
                .map_err(|e| WrenError::Transaction(format!("commit write: {e}")))
        })
    }

    pub fn get_commit(&self, hash: &str) -> WrenResult<Option<Commit>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT hash, timestamp, message, author, parent_hash, device_fingerprint
                 FROM commits WHERE hash = ?1",
                params![hash],
                row_to_commit,
            )
            .optional()
            .map_err(|e| WrenError::Storage(format!("get commit: {e}")))
        })
    }

    /// Commits ordered newest-first.
    pub fn list_commits(&self, limit: usize) -> WrenResult<Vec<Commit>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT hash, timestamp, message, author, parent_hash, device_fingerprint
                     FROM commits ORDER BY timestamp DESC LIMIT ?1",
                )
                .map_err(|e| WrenError::Storage(format!("list commits: {e}")))?;
            let rows = stmt
                .query_map(params![limit as i64], row_to_commit)
                .map_err(|e| WrenError::Storage(format!("list commits: {e}")))?;
            collect_rows(rows, "commit")
        })
    }

    pub fn commits_by_author(&self, author: &str, limit: usize) -> WrenResult<Vec<Commit>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT hash, timestamp, message, author, parent_hash, device_fingerprint
                     FROM commits WHERE author = ?1 ORDER BY timestamp DESC LIMIT ?2",
                )
                .map_err(|e| WrenError::Storage(format!("commits by author: {e}")))?;
            let rows = stmt
                .query_map(params![author, limit as i64], row_to_commit)
                .map_err(|e| WrenError::Storage(format!("commits by author: {e}")))?;
            collect_rows(rows, "commit")
        })
    }

    /// Raw change rows for a commit, in insertion order. The entity column
    /// is returned as text so callers can skip kinds the current schema no
    /// longer knows.
    pub fn changes_for(&self, commit_hash: &str) -> WrenResult<Vec<RawChange>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT commit_hash, entity, entity_id, op, description, old_value, new_value
                     FROM changes WHERE commit_hash = ?1 ORDER BY id ASC",
                )
                .map_err(|e| WrenError::Storage(format!("changes for commit: {e}")))?;
            let rows = stmt
                .query_map(params![commit_hash], |row| {
                    Ok(RawChange {
                        commit_hash: row.get(0)?,
                        entity: row.get(1)?,
                        entity_id: row.get(2)?,
                        op: row.get(3)?,
                        description: row.get(4)?,
                        old_value: row.get(5)?,
                        new_value: row.get(6)?,
                    })
                })
                .map_err(|e| WrenError::Storage(format!("changes for commit: {e}")))?;
            collect_rows(rows, "change")
        })
    }

    // -- Sync state ----------------------------------------------------------

    pub fn sync_state_get(&self, key: &str) -> WrenResult<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT state_value FROM sync_state WHERE state_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| WrenError::Storage(format!("get sync state: {e}")))
        })
    }

    pub fn sync_state_set(&self, key: &str, value: &str) -> WrenResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sync_state (state_key, state_value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(state_key) DO UPDATE SET
                   state_value=excluded.state_value, updated_at=excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .map_err(|e| WrenError::Storage(format!("set sync state: {e}")))?;
            Ok(())
        })
    }

    // -- Backups -------------------------------------------------------------

    pub fn insert_backup(&self, backup: &BackupRow) -> WrenResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO backups (id, created_at, reason, payload) VALUES (?1, ?2, ?3, ?4)",
                params![
                    backup.id.to_string(),
                    backup.created_at.to_rfc3339(),
                    backup.reason,
                    backup.payload,
                ],
            )
            .map_err(|e| WrenError::Storage(format!("insert backup: {e}")))?;
            Ok(())
        })
    }

    pub fn get_backup(&self, id: Uuid) -> WrenResult<Option<BackupRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, created_at, reason, payload FROM backups WHERE id = ?1",
                params![id.to_string()],
                row_to_backup,
            )
            .optional()
            .map_err(|e| WrenError::Storage(format!("get backup: {e}")))
        })
    }

    /// Backups ordered newest-first.
    pub fn list_backups(&self, limit: usize) -> WrenResult<Vec<BackupRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, created_at, reason, payload
                     FROM backups ORDER BY created_at DESC LIMIT ?1",
                )
                .map_err(|e| WrenError::Storage(format!("list backups: {e}")))?;
            let rows = stmt
                .query_map(params![limit as i64], row_to_backup)
                .map_err(|e| WrenError::Storage(format!("list backups: {e}")))?;
            collect_rows(rows, "backup")
        })
    }

    /// Keep only the `retain` newest backups. Returns rows deleted.
    pub fn prune_backups(&self, retain: usize) -> WrenResult<u64> {
        self.with_conn(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM backups WHERE id NOT IN
                       (SELECT id FROM backups ORDER BY created_at DESC LIMIT ?1)",
                    params![retain as i64],
                )
                .map_err(|e| WrenError::Storage(format!("prune backups: {e}")))?;
            Ok(deleted as u64)
        })
    }
}

/// A change row with the entity kind still as raw text; restore skips rows
/// whose kind the current schema no longer recognizes.
#[derive(Debug, Clone)]
pub struct RawChange {
    pub commit_hash: String,
    pub entity: String,
    pub entity_id: String,
    pub op: String,
    pub description: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

// -- Row mapping -------------------------------------------------------------

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn row_to_envelope(row: &rusqlite::Row<'_>) -> rusqlite::Result<Envelope> {
    let id: String = row.get(0)?;
    let balance: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(Envelope {
        id: Uuid::parse_str(&id).map_err(|e| conversion_err(0, e))?,
        name: row.get(1)?,
        category: row.get(2)?,
        balance: Decimal::from_str(&balance).map_err(|e| conversion_err(3, e))?,
        updated_at: parse_dt_sql(&updated_at, 4)?,
    })
}

fn row_to_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transaction> {
    let id: String = row.get(0)?;
    let envelope_id: Option<String> = row.get(1)?;
    let amount: String = row.get(3)?;
    let date: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(Transaction {
        id: Uuid::parse_str(&id).map_err(|e| conversion_err(0, e))?,
        envelope_id: envelope_id
            .map(|s| Uuid::parse_str(&s).map_err(|e| conversion_err(1, e)))
            .transpose()?,
        description: row.get(2)?,
        amount: Decimal::from_str(&amount).map_err(|e| conversion_err(3, e))?,
        date: parse_dt_sql(&date, 4)?,
        updated_at: parse_dt_sql(&updated_at, 5)?,
    })
}

fn row_to_bill(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bill> {
    let id: String = row.get(0)?;
    let amount: String = row.get(2)?;
    let due_date: String = row.get(3)?;
    let envelope_id: Option<String> = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(Bill {
        id: Uuid::parse_str(&id).map_err(|e| conversion_err(0, e))?,
        name: row.get(1)?,
        amount: Decimal::from_str(&amount).map_err(|e| conversion_err(2, e))?,
        due_date: parse_dt_sql(&due_date, 3)?,
        frequency: row.get(4)?,
        envelope_id: envelope_id
            .map(|s| Uuid::parse_str(&s).map_err(|e| conversion_err(5, e)))
            .transpose()?,
        updated_at: parse_dt_sql(&updated_at, 6)?,
    })
}

fn row_to_commit(row: &rusqlite::Row<'_>) -> rusqlite::Result<Commit> {
    let timestamp: String = row.get(1)?;
    Ok(Commit {
        hash: row.get(0)?,
        timestamp: parse_dt_sql(&timestamp, 1)?,
        message: row.get(2)?,
        author: row.get(3)?,
        parent_hash: row.get(4)?,
        device_fingerprint: row.get(5)?,
    })
}

fn row_to_backup(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupRow> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(1)?;
    Ok(BackupRow {
        id: Uuid::parse_str(&id).map_err(|e| conversion_err(0, e))?,
        created_at: parse_dt_sql(&created_at, 1)?,
        reason: row.get(2)?,
        payload: row.get(3)?,
    })
}

fn parse_dt_sql(s: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_decimal(s: &str) -> WrenResult<Decimal> {
    Decimal::from_str(s).map_err(|e| WrenError::Storage(format!("parse decimal '{s}': {e}")))
}

fn parse_datetime(s: &str) -> WrenResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WrenError::Storage(format!("parse timestamp '{s}': {e}")))
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    what: &str,
) -> WrenResult<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| WrenError::Storage(format!("read {what} row: {e}")))?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_store() -> BudgetStore {
        BudgetStore::open_in_memory().expect("in-memory store")
    }

    fn make_commit(hash: &str, parent: Option<&str>) -> Commit {
        Commit {
            hash: hash.to_string(),
            timestamp: Utc::now(),
            message: format!("commit {hash}"),
            author: "alex".into(),
            parent_hash: parent.map(|p| p.to_string()),
            device_fingerprint: "dev-1".into(),
        }
    }

    fn make_change(hash: &str, op: ChangeOp) -> RawChange {
        RawChange {
            commit_hash: hash.to_string(),
            entity: EntityKind::Envelope.as_str().to_string(),
            entity_id: Uuid::now_v7().to_string(),
            op: op.as_str().to_string(),
            description: "test change".into(),
            old_value: match op {
                ChangeOp::Create => None,
                _ => Some("{\"balance\":\"1\"}".to_string()),
            },
            new_value: match op {
                ChangeOp::Delete => None,
                _ => Some("{\"balance\":\"2\"}".to_string()),
            },
        }
    }

    // -- Entity tables --------------------------------------------------------

    #[test]
    fn envelope_crud_roundtrip() {
        let store = make_store();
        let mut envelope = Envelope::new("Groceries", "food", Decimal::new(12550, 2));
        store.upsert_envelope(&envelope).unwrap();

        let fetched = store.get_envelope(envelope.id).unwrap().unwrap();
        assert_eq!(fetched, envelope);

        envelope.balance = Decimal::new(9900, 2);
        store.upsert_envelope(&envelope).unwrap();
        let fetched = store.get_envelope(envelope.id).unwrap().unwrap();
        assert_eq!(fetched.balance, Decimal::new(9900, 2));

        assert!(store.delete_envelope(envelope.id).unwrap());
        assert!(store.get_envelope(envelope.id).unwrap().is_none());
        assert!(!store.delete_envelope(envelope.id).unwrap());
    }

    #[test]
    fn transactions_list_newest_first() {
        let store = make_store();
        let mut old = Transaction::new("old", Decimal::new(-100, 2));
        old.date = Utc::now() - Duration::days(2);
        let recent = Transaction::new("recent", Decimal::new(-200, 2));
        store.upsert_transaction(&old).unwrap();
        store.upsert_transaction(&recent).unwrap();

        let listed = store.list_transactions().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, recent.id);
    }

    #[test]
    fn bill_preserves_envelope_link() {
        let store = make_store();
        let envelope = Envelope::new("Utilities", "home", Decimal::ZERO);
        store.upsert_envelope(&envelope).unwrap();

        let mut bill = Bill::new("Electric", Decimal::new(8000, 2), Utc::now());
        bill.envelope_id = Some(envelope.id);
        store.upsert_bill(&bill).unwrap();

        let fetched = store.get_bill(bill.id).unwrap().unwrap();
        assert_eq!(fetched.envelope_id, Some(envelope.id));
    }

    #[test]
    fn meta_defaults_then_persists() {
        let store = make_store();
        let meta = store.meta().unwrap();
        assert_eq!(meta.sync_version, 0);

        let updated = BudgetMeta {
            unassigned_cash: Decimal::new(50000, 2),
            actual_balance: Decimal::new(123456, 2),
            last_modified: Utc::now(),
            sync_version: 7,
        };
        store.set_meta(&updated).unwrap();
        let fetched = store.meta().unwrap();
        assert_eq!(fetched.sync_version, 7);
        assert_eq!(fetched.unassigned_cash, Decimal::new(50000, 2));
    }

    // -- Snapshot apply -------------------------------------------------------

    #[test]
    fn replace_all_swaps_entire_state() {
        let store = make_store();
        store
            .upsert_envelope(&Envelope::new("Old", "misc", Decimal::ZERO))
            .unwrap();

        let incoming = SyncSnapshot {
            author: "blair".into(),
            device_fingerprint: "dev-2".into(),
            envelopes: vec![Envelope::new("New", "misc", Decimal::new(100, 0))],
            transactions: vec![Transaction::new("lunch", Decimal::new(-1200, 2))],
            bills: vec![],
            unassigned_cash: Decimal::new(5000, 2),
            actual_balance: Decimal::new(90000, 2),
            last_modified: Utc::now(),
            sync_version: 4,
        };
        store.replace_all(&incoming).unwrap();

        let envelopes = store.list_envelopes().unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].name, "New");
        assert_eq!(store.list_transactions().unwrap().len(), 1);
        assert_eq!(store.meta().unwrap().sync_version, 4);
    }

    #[test]
    fn load_snapshot_reflects_tables() {
        let store = make_store();
        store
            .upsert_envelope(&Envelope::new("Rent", "home", Decimal::new(120000, 2)))
            .unwrap();
        let snap = store.load_snapshot("alex", "dev-1").unwrap();
        assert_eq!(snap.envelopes.len(), 1);
        assert_eq!(snap.author, "alex");
        assert!(snap.transactions.is_empty());
    }

    // -- Commit log -----------------------------------------------------------

    #[test]
    fn commit_with_changes_is_atomic() {
        let store = make_store();
        let commit = make_commit("hash-a", None);
        let changes = vec![
            make_change("hash-a", ChangeOp::Create),
            make_change("hash-a", ChangeOp::Update),
        ];
        store.create_commit_with_changes(&commit, &changes).unwrap();

        assert!(store.get_commit("hash-a").unwrap().is_some());
        assert_eq!(store.changes_for("hash-a").unwrap().len(), 2);

        // Re-inserting the same hash fails and leaves the change count
        // untouched; the second write rolled back whole.
        let dup = store.create_commit_with_changes(&commit, &changes);
        assert!(matches!(dup, Err(WrenError::Transaction(_))));
        assert_eq!(store.changes_for("hash-a").unwrap().len(), 2);
    }

    #[test]
    fn commit_with_unknown_parent_rejected_by_fk() {
        let store = make_store();
        let orphan = make_commit("hash-b", Some("missing-parent"));
        let result = store.create_commit_with_changes(&orphan, &[]);
        assert!(result.is_err());
        assert!(store.get_commit("hash-b").unwrap().is_none());
    }

    #[test]
    fn list_commits_newest_first() {
        let store = make_store();
        let mut first = make_commit("hash-1", None);
        first.timestamp = Utc::now() - Duration::minutes(5);
        let second = make_commit("hash-2", Some("hash-1"));
        store.create_commit_with_changes(&first, &[]).unwrap();
        store.create_commit_with_changes(&second, &[]).unwrap();

        let commits = store.list_commits(10).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].hash, "hash-2");
        assert_eq!(commits[1].parent_hash, None);
    }

    #[test]
    fn commits_by_author_filters() {
        let store = make_store();
        let mut a = make_commit("hash-a1", None);
        a.author = "alex".into();
        let mut b = make_commit("hash-b1", None);
        b.author = "blair".into();
        store.create_commit_with_changes(&a, &[]).unwrap();
        store.create_commit_with_changes(&b, &[]).unwrap();

        let alexs = store.commits_by_author("alex", 10).unwrap();
        assert_eq!(alexs.len(), 1);
        assert_eq!(alexs[0].hash, "hash-a1");
    }

    // -- Sync state -----------------------------------------------------------

    #[test]
    fn sync_state_roundtrip_and_overwrite() {
        let store = make_store();
        assert!(store.sync_state_get("last_synced").unwrap().is_none());
        store.sync_state_set("last_synced", "2026-01-01T00:00:00Z").unwrap();
        store.sync_state_set("last_synced", "2026-02-01T00:00:00Z").unwrap();
        assert_eq!(
            store.sync_state_get("last_synced").unwrap().as_deref(),
            Some("2026-02-01T00:00:00Z")
        );
    }

    // -- Durability -----------------------------------------------------------

    #[test]
    fn reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("budget.sqlite");

        let envelope = Envelope::new("Groceries", "food", Decimal::new(4200, 2));
        {
            let store = BudgetStore::open(&db_path).unwrap();
            store.upsert_envelope(&envelope).unwrap();
            store
                .create_commit_with_changes(&make_commit("persisted", None), &[])
                .unwrap();
        }

        let reopened = BudgetStore::open(&db_path).unwrap();
        assert_eq!(
            reopened.get_envelope(envelope.id).unwrap().unwrap().name,
            "Groceries"
        );
        assert!(reopened.get_commit("persisted").unwrap().is_some());
    }

    // -- Backups --------------------------------------------------------------

    #[test]
    fn backups_prune_keeps_newest() {
        let store = make_store();
        let base = Utc::now();
        for i in 0..5 {
            store
                .insert_backup(&BackupRow {
                    id: Uuid::now_v7(),
                    created_at: base + Duration::seconds(i),
                    reason: "pre_sync".into(),
                    payload: format!("{{\"n\":{i}}}"),
                })
                .unwrap();
        }
        let deleted = store.prune_backups(2).unwrap();
        assert_eq!(deleted, 3);

        let remaining = store.list_backups(10).unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].payload, "{\"n\":4}");
    }
}
