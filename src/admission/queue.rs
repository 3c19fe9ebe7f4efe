//! Pending Admission Queue (C3): durable, append-mostly table of devices
//! awaiting an operator decision, with an immutable audit history (spec §4.3).

use crate::error::{Error, Result};
use crate::types::{AdmissionHistoryEntry, Mac, PendingAdmission, PendingStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

/// Outcome of [`PendingQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Duplicate,
}

pub struct PendingQueue {
    conn: Mutex<Connection>,
}

impl PendingQueue {
    pub async fn open(db_path: &str) -> Result<Self> {
        let path = db_path.to_string();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;
            create_schema(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::Storage(e.to_string()))??;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Enqueue a newly observed MAC. Duplicate iff a row with the same MAC
    /// already exists in a non-terminal status (spec §4.3).
    pub async fn enqueue(
        &self,
        mac: &Mac,
        device_id_candidate: &str,
        device_type: Option<&str>,
        device_info: Option<&str>,
    ) -> Result<EnqueueOutcome> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;

            let existing_status: Option<String> = conn
                .query_row(
                    "SELECT status FROM pending_devices WHERE mac = ?1",
                    params![mac],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(status) = &existing_status {
                if !status_from_str(status).is_terminal() {
                    return Ok(EnqueueOutcome::Duplicate);
                }
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO pending_devices (mac, device_id_candidate, device_type, device_info, detected_at, status, admin_notes, approved_at, rejected_at, onboarded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', NULL, NULL, NULL, NULL)
                 ON CONFLICT(mac) DO UPDATE SET
                    device_id_candidate = excluded.device_id_candidate,
                    device_type = excluded.device_type,
                    device_info = excluded.device_info,
                    detected_at = excluded.detected_at,
                    status = 'pending',
                    admin_notes = NULL,
                    approved_at = NULL,
                    rejected_at = NULL,
                    onboarded_at = NULL",
                params![mac, device_id_candidate, device_type, device_info, now],
            )?;

            append_history(&conn, mac, existing_status.map(|s| status_from_str(&s)), PendingStatus::Pending, None)?;

            Ok(EnqueueOutcome::Enqueued)
        })
        .await
    }

    /// Approve a pending row. A no-op returning success if already approved
    /// (invariant I2).
    pub async fn approve(&self, mac: &Mac, notes: Option<&str>) -> Result<()> {
        self.transition(mac, PendingStatus::Approved, notes, |from| {
            matches!(from, PendingStatus::Pending | PendingStatus::Approved)
        })
        .await
    }

    /// Reject a pending row. Idempotent over the terminal `rejected` state.
    pub async fn reject(&self, mac: &Mac, notes: Option<&str>) -> Result<()> {
        self.transition(mac, PendingStatus::Rejected, notes, |from| {
            matches!(from, PendingStatus::Pending | PendingStatus::Rejected)
        })
        .await
    }

    /// Mark a row onboarded after C2/C1/C5 have run.
    pub async fn mark_onboarded(&self, mac: &Mac) -> Result<()> {
        self.transition(mac, PendingStatus::Onboarded, None, |from| {
            matches!(from, PendingStatus::Approved | PendingStatus::Onboarded)
        })
        .await
    }

    async fn transition(
        &self,
        mac: &Mac,
        to: PendingStatus,
        notes: Option<&str>,
        allowed_from: impl Fn(PendingStatus) -> bool,
    ) -> Result<()> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            let current: Option<String> = conn
                .query_row("SELECT status FROM pending_devices WHERE mac = ?1", params![mac], |row| row.get(0))
                .optional()?;
            let Some(current) = current else {
                return Err(Error::NotFound(format!("pending row for {mac}")));
            };
            let from = status_from_str(&current);

            if from == to {
                return Ok(());
            }
            if !allowed_from(from) {
                return Err(Error::Conflict(format!(
                    "cannot transition pending row for {mac} from {current} to {to:?}"
                )));
            }

            let now = Utc::now().to_rfc3339();
            let column = match to {
                PendingStatus::Approved => "approved_at",
                PendingStatus::Rejected => "rejected_at",
                PendingStatus::Onboarded => "onboarded_at",
                PendingStatus::Pending => unreachable!("transition target is never Pending"),
            };
            conn.execute(
                &format!(
                    "UPDATE pending_devices SET status = ?1, admin_notes = COALESCE(?2, admin_notes), {column} = ?3 WHERE mac = ?4"
                ),
                params![status_str(to), notes, now, mac],
            )?;
            append_history(&conn, mac, Some(from), to, notes)?;
            Ok(())
        })
        .await
    }

    /// Fetch the pending row for `mac`, if any.
    pub async fn get_by_mac(&self, mac: &Mac) -> Result<Option<PendingAdmission>> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            row_by_predicate(&conn, "mac = ?1", params![mac])
        })
        .await
    }

    /// All rows currently in `pending` status.
    pub async fn list_pending(&self) -> Result<Vec<PendingAdmission>> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            rows_by_predicate(&conn, "status = 'pending'", [])
        })
        .await
    }

    /// All rows, optionally filtered by status.
    pub async fn list_all(&self, status: Option<PendingStatus>) -> Result<Vec<PendingAdmission>> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            match status {
                Some(s) => rows_by_predicate(&conn, "status = ?1", params![status_str(s)]),
                None => rows_by_predicate(&conn, "1 = 1", []),
            }
        })
        .await
    }

    /// Audit history, optionally scoped to one MAC, most recent first.
    pub async fn history(&self, mac: Option<&Mac>, limit: usize) -> Result<Vec<AdmissionHistoryEntry>> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            let sql = match mac {
                Some(_) => "SELECT mac, from_status, to_status, notes, at FROM device_history WHERE mac = ?1 ORDER BY id DESC LIMIT ?2",
                None => "SELECT mac, from_status, to_status, notes, at FROM device_history ORDER BY id DESC LIMIT ?1",
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = match mac {
                Some(m) => stmt
                    .query_map(params![m, limit as i64], history_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?,
                None => stmt
                    .query_map(params![limit as i64], history_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?,
            };
            Ok(rows)
        })
        .await
    }
}

fn history_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdmissionHistoryEntry> {
    let from: Option<String> = row.get(1)?;
    let to: String = row.get(2)?;
    let at: String = row.get(4)?;
    Ok(AdmissionHistoryEntry {
        mac: row.get(0)?,
        from_status: from.map(|s| status_from_str(&s)),
        to_status: status_from_str(&to),
        notes: row.get(3)?,
        at: parse_ts(&at),
    })
}

fn append_history(
    conn: &Connection,
    mac: &str,
    from: Option<PendingStatus>,
    to: PendingStatus,
    notes: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO device_history (mac, from_status, to_status, notes, at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![mac, from.map(status_str), status_str(to), notes, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS pending_devices (
            mac TEXT PRIMARY KEY,
            device_id_candidate TEXT NOT NULL,
            device_type TEXT,
            device_info TEXT,
            detected_at TEXT NOT NULL,
            status TEXT NOT NULL,
            admin_notes TEXT,
            approved_at TEXT,
            rejected_at TEXT,
            onboarded_at TEXT
        );
        CREATE TABLE IF NOT EXISTS device_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mac TEXT NOT NULL,
            from_status TEXT,
            to_status TEXT NOT NULL,
            notes TEXT,
            at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_device_history_mac ON device_history(mac);",
    )?;
    Ok(())
}

fn status_str(s: PendingStatus) -> &'static str {
    match s {
        PendingStatus::Pending => "pending",
        PendingStatus::Approved => "approved",
        PendingStatus::Rejected => "rejected",
        PendingStatus::Onboarded => "onboarded",
    }
}

fn status_from_str(s: &str) -> PendingStatus {
    match s {
        "approved" => PendingStatus::Approved,
        "rejected" => PendingStatus::Rejected,
        "onboarded" => PendingStatus::Onboarded,
        _ => PendingStatus::Pending,
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn pending_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingAdmission> {
    let status: String = row.get("status")?;
    let detected_at: String = row.get("detected_at")?;
    let approved_at: Option<String> = row.get("approved_at")?;
    let rejected_at: Option<String> = row.get("rejected_at")?;
    let onboarded_at: Option<String> = row.get("onboarded_at")?;
    Ok(PendingAdmission {
        mac: row.get("mac")?,
        device_id_candidate: row.get("device_id_candidate")?,
        device_type: row.get("device_type")?,
        device_info: row.get("device_info")?,
        detected_at: parse_ts(&detected_at),
        status: status_from_str(&status),
        admin_notes: row.get("admin_notes")?,
        approved_at: approved_at.map(|s| parse_ts(&s)),
        rejected_at: rejected_at.map(|s| parse_ts(&s)),
        onboarded_at: onboarded_at.map(|s| parse_ts(&s)),
    })
}

fn row_by_predicate(
    conn: &Connection,
    predicate: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Option<PendingAdmission>> {
    let sql = format!("SELECT * FROM pending_devices WHERE {predicate}");
    let mut stmt = conn.prepare(&sql)?;
    Ok(stmt.query_row(params, pending_from_row).optional()?)
}

fn rows_by_predicate(
    conn: &Connection,
    predicate: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<PendingAdmission>> {
    let sql = format!("SELECT * FROM pending_devices WHERE {predicate}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, pending_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn queue() -> PendingQueue {
        PendingQueue::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_approve_then_onboard() {
        let q = queue().await;
        let outcome = q.enqueue(&"AA:BB:CC:00:00:01".to_string(), "DEV_AA_BB_CC_XXXXXX", None, None).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Enqueued);

        q.approve(&"AA:BB:CC:00:00:01".to_string(), None).await.unwrap();
        q.mark_onboarded(&"AA:BB:CC:00:00:01".to_string()).await.unwrap();

        let row = q.get_by_mac(&"AA:BB:CC:00:00:01".to_string()).await.unwrap().unwrap();
        assert_eq!(row.status, PendingStatus::Onboarded);
    }

    #[tokio::test]
    async fn duplicate_enqueue_while_pending() {
        let q = queue().await;
        let mac = "AA:BB:CC:00:00:01".to_string();
        q.enqueue(&mac, "DEV_AA_BB_CC_XXXXXX", None, None).await.unwrap();
        let second = q.enqueue(&mac, "DEV_AA_BB_CC_YYYYYY", None, None).await.unwrap();
        assert_eq!(second, EnqueueOutcome::Duplicate);
    }

    #[tokio::test]
    async fn approve_twice_is_idempotent() {
        let q = queue().await;
        let mac = "AA:BB:CC:00:00:01".to_string();
        q.enqueue(&mac, "DEV_AA_BB_CC_XXXXXX", None, None).await.unwrap();
        q.approve(&mac, None).await.unwrap();
        q.approve(&mac, None).await.unwrap();
        let row = q.get_by_mac(&mac).await.unwrap().unwrap();
        assert_eq!(row.status, PendingStatus::Approved);
    }

    #[tokio::test]
    async fn history_is_append_only() {
        let q = queue().await;
        let mac = "AA:BB:CC:00:00:01".to_string();
        q.enqueue(&mac, "DEV_AA_BB_CC_XXXXXX", None, None).await.unwrap();
        q.approve(&mac, Some("looks fine")).await.unwrap();
        q.mark_onboarded(&mac).await.unwrap();
        let history = q.history(Some(&mac), 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].to_status, PendingStatus::Onboarded);
    }

    #[tokio::test]
    async fn re_enqueue_after_rejection_reopens() {
        let q = queue().await;
        let mac = "AA:BB:CC:00:00:01".to_string();
        q.enqueue(&mac, "DEV_AA_BB_CC_XXXXXX", None, None).await.unwrap();
        q.reject(&mac, None).await.unwrap();
        let outcome = q.enqueue(&mac, "DEV_AA_BB_CC_ZZZZZZ", None, None).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Enqueued);
        let row = q.get_by_mac(&mac).await.unwrap().unwrap();
        assert_eq!(row.status, PendingStatus::Pending);
    }
}
