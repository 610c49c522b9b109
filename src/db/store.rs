//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
}

const TARGET_COLUMNS: &str = "id, name, canonical_name, normalized_key, description, url, status, \
     last_checked_at, reachable_attempts, total_attempts, average_latency_ms, is_mirror, parent_id, \
     mirror_priority, click_count";

/// Thread-safe database store.
///
/// All writes that belong to one logical operation go through
/// [`Store::save_changes`], which commits them in a single transaction.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Reads ---

    /// Read-only snapshot of every target with its proofs.
    pub fn load_all(&self) -> Result<Vec<MonitorTarget>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM targets ORDER BY id", TARGET_COLUMNS))?;
        let mut targets = stmt
            .query_map([], row_to_target)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut proofs = load_proofs(&conn, None)?;
        for target in &mut targets {
            target.proofs = proofs.remove(&target.id).unwrap_or_default();
        }
        Ok(targets)
    }

    /// Load the targets with the given ids. Unknown ids are skipped.
    pub fn load_by_ids(&self, ids: &[i64]) -> Result<Vec<MonitorTarget>, DbError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets WHERE id IN ({}) ORDER BY id",
            TARGET_COLUMNS, placeholders
        ))?;
        let mut targets = stmt
            .query_map(params_from_iter(ids.iter()), row_to_target)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut proofs = load_proofs(&conn, Some(ids))?;
        for target in &mut targets {
            target.proofs = proofs.remove(&target.id).unwrap_or_default();
        }
        Ok(targets)
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: i64) -> Result<Option<MonitorTarget>, DbError> {
        Ok(self.load_by_ids(&[id])?.into_iter().next())
    }

    /// Get a proof by ID.
    pub fn get_proof(&self, id: i64) -> Result<Option<Proof>, DbError> {
        let conn = self.conn.lock();
        let proof = conn
            .query_row(
                "SELECT id, target_id, proof_type, content, created_at FROM proofs WHERE id = ?1",
                params![id],
                row_to_proof,
            )
            .optional()?;
        Ok(proof)
    }

    // --- Writes ---

    /// Persist a batch of targets in one transaction.
    ///
    /// Targets with `id == 0` are inserted whole (their ids and their
    /// proofs' ids are filled in). For the others only the descriptive and
    /// mirror columns are written: health changes go through
    /// [`Store::save_outcomes`] and click counts through
    /// [`Store::increment_clicks`], so a stale copy cannot undo either.
    pub fn save_changes(&self, targets: &mut [MonitorTarget]) -> Result<(), DbError> {
        if targets.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for target in targets.iter_mut() {
            if target.id == 0 {
                insert_target(&tx, target)?;
            } else {
                update_target(&tx, target)?;
            }

            for proof in target.proofs.iter_mut().filter(|p| p.id == 0) {
                proof.target_id = target.id;
                insert_proof(&tx, proof)?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Write sweep results into the health columns only, in one transaction.
    ///
    /// Outcomes for targets deleted in the meantime are skipped. Returns the
    /// number of rows updated.
    pub fn save_outcomes(&self, outcomes: &[ProbeOutcome]) -> Result<usize, DbError> {
        if outcomes.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE targets SET status=?1, last_checked_at=?2, reachable_attempts=?3, \
                 total_attempts=?4, average_latency_ms=?5 WHERE id=?6",
            )?;
            for outcome in outcomes {
                updated += stmt.execute(params![
                    outcome.status.as_str(),
                    outcome.checked_at.to_rfc3339(),
                    outcome.reachable_count,
                    outcome.total_attempts,
                    outcome.average_latency_ms,
                    outcome.target_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Write only the mirror columns of the given targets.
    pub fn save_mirror_links(&self, targets: &[MonitorTarget]) -> Result<(), DbError> {
        if targets.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE targets SET is_mirror=?1, parent_id=?2, mirror_priority=?3 WHERE id=?4",
            )?;
            for target in targets {
                stmt.execute(params![
                    target.is_mirror,
                    target.parent_id,
                    target.mirror_priority,
                    target.id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete a target; its proofs go with it. Returns false for unknown ids.
    pub fn delete_target(&self, id: i64) -> Result<bool, DbError> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// Bump a target's click counter. Returns false for unknown ids.
    pub fn increment_clicks(&self, id: i64) -> Result<bool, DbError> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE targets SET click_count = click_count + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(affected > 0)
    }
}

fn insert_target(tx: &Transaction<'_>, target: &mut MonitorTarget) -> Result<(), DbError> {
    tx.execute(
        "INSERT INTO targets (name, canonical_name, normalized_key, description, url, status, \
         last_checked_at, reachable_attempts, total_attempts, average_latency_ms, is_mirror, \
         parent_id, mirror_priority, click_count) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            target.name,
            target.canonical_name,
            target.normalized_key,
            target.description,
            target.url,
            target.status.as_str(),
            target.last_checked_at.map(|t| t.to_rfc3339()),
            target.reachable_attempts,
            target.total_attempts,
            target.average_latency_ms,
            target.is_mirror,
            target.parent_id,
            target.mirror_priority,
            target.click_count,
        ],
    )?;
    target.id = tx.last_insert_rowid();
    Ok(())
}

fn update_target(tx: &Transaction<'_>, target: &MonitorTarget) -> Result<(), DbError> {
    tx.execute(
        "UPDATE targets SET name=?1, canonical_name=?2, normalized_key=?3, description=?4, url=?5, \
         is_mirror=?6, parent_id=?7, mirror_priority=?8 WHERE id=?9",
        params![
            target.name,
            target.canonical_name,
            target.normalized_key,
            target.description,
            target.url,
            target.is_mirror,
            target.parent_id,
            target.mirror_priority,
            target.id,
        ],
    )?;
    Ok(())
}

fn insert_proof(tx: &Transaction<'_>, proof: &mut Proof) -> Result<(), DbError> {
    tx.execute(
        "INSERT INTO proofs (target_id, proof_type, content, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            proof.target_id,
            proof.proof_type,
            proof.content,
            proof.created_at.to_rfc3339(),
        ],
    )?;
    proof.id = tx.last_insert_rowid();
    Ok(())
}

fn load_proofs(conn: &Connection, ids: Option<&[i64]>) -> Result<HashMap<i64, Vec<Proof>>, DbError> {
    let sql = match ids {
        Some(ids) => format!(
            "SELECT id, target_id, proof_type, content, created_at FROM proofs \
             WHERE target_id IN ({}) ORDER BY id",
            vec!["?"; ids.len()].join(", ")
        ),
        None => "SELECT id, target_id, proof_type, content, created_at FROM proofs ORDER BY id"
            .to_string(),
    };

    let mut stmt = conn.prepare(&sql)?;
    let rows = match ids {
        Some(ids) => stmt
            .query_map(params_from_iter(ids.iter()), row_to_proof)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        None => stmt
            .query_map([], row_to_proof)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
    };

    let mut grouped: HashMap<i64, Vec<Proof>> = HashMap::new();
    for proof in rows {
        grouped.entry(proof.target_id).or_default().push(proof);
    }
    Ok(grouped)
}

fn row_to_target(row: &Row<'_>) -> rusqlite::Result<MonitorTarget> {
    let status: String = row.get(6)?;
    let last_checked: Option<String> = row.get(7)?;

    Ok(MonitorTarget {
        id: row.get(0)?,
        name: row.get(1)?,
        canonical_name: row.get(2)?,
        normalized_key: row.get(3)?,
        description: row.get(4)?,
        url: row.get(5)?,
        status: HealthStatus::parse(&status).unwrap_or_default(),
        last_checked_at: last_checked.as_deref().and_then(parse_db_time),
        reachable_attempts: row.get(8)?,
        total_attempts: row.get(9)?,
        average_latency_ms: row.get(10)?,
        is_mirror: row.get(11)?,
        parent_id: row.get(12)?,
        mirror_priority: row.get(13)?,
        click_count: row.get(14)?,
        proofs: Vec::new(),
    })
}

fn row_to_proof(row: &Row<'_>) -> rusqlite::Result<Proof> {
    let created: String = row.get(4)?;
    Ok(Proof {
        id: row.get(0)?,
        target_id: row.get(1)?,
        proof_type: row.get(2)?,
        content: row.get(3)?,
        created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn target(name: &str, url: &str) -> MonitorTarget {
        MonitorTarget {
            name: name.to_string(),
            canonical_name: name.to_string(),
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_target_crud() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        // Create
        let mut batch = vec![target("Test", "http://test.onion")];
        batch[0].proofs.push(Proof::new("pgp-signed", "-----BEGIN PGP-----"));
        store.save_changes(&mut batch).unwrap();
        let id = batch[0].id;
        assert!(id > 0);
        assert!(batch[0].proofs[0].id > 0);

        // Read
        let fetched = store.get_target(id).unwrap().unwrap();
        assert_eq!(fetched.name, "Test");
        assert_eq!(fetched.proofs.len(), 1);
        assert_eq!(fetched.proofs[0].target_id, id);

        // Update
        let mut updated = vec![fetched];
        updated[0].name = "Updated".to_string();
        store.save_changes(&mut updated).unwrap();
        store.save_outcomes(&[outcome(id, HealthStatus::Degraded, 1)]).unwrap();

        let fetched2 = store.get_target(id).unwrap().unwrap();
        assert_eq!(fetched2.name, "Updated");
        assert_eq!(fetched2.status, HealthStatus::Degraded);
        assert!(fetched2.last_checked_at.is_some());
        assert_eq!(fetched2.proofs.len(), 1);

        // Delete
        let proof_id = fetched2.proofs[0].id;
        assert!(store.delete_target(id).unwrap());
        assert!(store.get_target(id).unwrap().is_none());
        assert!(store.get_proof(proof_id).unwrap().is_none());
        assert!(!store.delete_target(id).unwrap());
    }

    fn outcome(target_id: i64, status: HealthStatus, reachable: i32) -> ProbeOutcome {
        ProbeOutcome {
            target_id,
            reachable_count: reachable,
            total_attempts: 3,
            average_latency_ms: Some(250.0),
            status,
            checked_at: Utc::now(),
        }
    }

    #[test]
    fn test_stale_copy_keeps_sweep_outcome() {
        let store = Store::open_in_memory().unwrap();
        let mut batch = vec![target("A", "http://a.onion")];
        store.save_changes(&mut batch).unwrap();
        let id = batch[0].id;

        let mut stale = vec![store.get_target(id).unwrap().unwrap()];
        assert_eq!(store.save_outcomes(&[outcome(id, HealthStatus::Online, 3)]).unwrap(), 1);

        stale[0].mirror_priority = 4;
        store.save_changes(&mut stale).unwrap();
        store.save_mirror_links(&stale).unwrap();

        let stored = store.get_target(id).unwrap().unwrap();
        assert_eq!(stored.status, HealthStatus::Online);
        assert_eq!(stored.reachable_attempts, 3);
        assert_eq!(stored.total_attempts, 3);
        assert_eq!(stored.average_latency_ms, Some(250.0));
        assert!(stored.last_checked_at.is_some());
        assert_eq!(stored.mirror_priority, 4);
    }

    #[test]
    fn test_outcomes_leave_descriptive_columns_alone() {
        let store = Store::open_in_memory().unwrap();
        let mut batch = vec![target("A", "http://a.onion")];
        store.save_changes(&mut batch).unwrap();
        let id = batch[0].id;

        // An admin edit lands after the sweep loaded its snapshot.
        let mut edited = vec![store.get_target(id).unwrap().unwrap()];
        edited[0].name = "Renamed".to_string();
        edited[0].url = "http://renamed.onion".to_string();
        store.save_changes(&mut edited).unwrap();

        let written = store
            .save_outcomes(&[outcome(id, HealthStatus::Offline, 0), outcome(9999, HealthStatus::Online, 3)])
            .unwrap();
        assert_eq!(written, 1);

        let stored = store.get_target(id).unwrap().unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.url, "http://renamed.onion");
        assert_eq!(stored.status, HealthStatus::Offline);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let store = Store::open_in_memory().unwrap();
        let mut first = vec![target("A", "http://a.onion")];
        store.save_changes(&mut first).unwrap();

        // The second insert violates URL uniqueness, so the first must roll back.
        let mut batch = vec![target("B", "http://b.onion"), target("A again", "http://a.onion")];
        assert!(store.save_changes(&mut batch).is_err());

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "A");
    }

    #[test]
    fn test_clicks_and_load_by_ids() {
        let store = Store::open_in_memory().unwrap();
        let mut batch = vec![target("A", "http://a.onion"), target("B", "http://b.onion")];
        store.save_changes(&mut batch).unwrap();

        assert!(store.increment_clicks(batch[1].id).unwrap());
        assert!(store.increment_clicks(batch[1].id).unwrap());
        assert!(!store.increment_clicks(9999).unwrap());

        let loaded = store.load_by_ids(&[batch[1].id, 9999]).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].click_count, 2);

        // A stale copy being saved must not clobber the counter.
        let mut stale = vec![batch[1].clone()];
        store.save_changes(&mut stale).unwrap();
        assert_eq!(store.get_target(batch[1].id).unwrap().unwrap().click_count, 2);
    }

    #[test]
    fn test_parse_db_time() {
        assert!(parse_db_time("2024-01-02T03:04:05+00:00").is_some());
        assert!(parse_db_time("2024-01-02 03:04:05").is_some());
        assert!(parse_db_time("yesterday").is_none());
    }
}
