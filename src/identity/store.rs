//! Durable key-value-like device registry backed by SQLite (spec §4.1).
//!
//! Schema: `devices`, `behavioral_baselines`, `device_policies`,
//! `trust_score_history`, matching the table names spec §6 lists. Writes are
//! serialized through a single guarded connection (spec: "single-writer,
//! multi-reader acceptable" — this implementation serializes reads too,
//! which satisfies the invariant at the cost of read concurrency; see
//! DESIGN.md).

use crate::error::{Error, Result};
use crate::types::{BehavioralBaseline, Device, DevicePolicy, DeviceStatus, TrustHistoryEntry, DEFAULT_TRUST_SCORE};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Durable device registry (spec §3, §4.1).
pub struct IdentityStore {
    conn: Mutex<Connection>,
}

/// Short content fingerprint for a newly onboarded device: a `blake3` hash of
/// `mac || device_type || first_seen`, truncated to 16 hex chars. Not used for
/// any security decision, only as a stable identity marker for dedup/audit.
pub fn derive_fingerprint(mac: &str, device_type: &str, first_seen: DateTime<Utc>) -> String {
    let mut input = String::with_capacity(mac.len() + device_type.len() + 32);
    input.push_str(mac);
    input.push_str(device_type);
    input.push_str(&first_seen.to_rfc3339());
    blake3::hash(input.as_bytes()).to_hex()[..16].to_string()
}

const DEVICE_COLUMNS: &[(&str, &str)] = &[
    ("trust_score", "INTEGER NOT NULL DEFAULT 70"),
    ("ip", "TEXT"),
    ("fingerprint", "TEXT"),
];

impl IdentityStore {
    /// Open (creating if absent) the identity store at `db_path`, running
    /// schema migration for any missing columns (spec §4.1).
    pub async fn open(db_path: &str) -> Result<Self> {
        let path = db_path.to_string();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;
            create_schema(&conn)?;
            migrate_schema(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::Storage(e.to_string()))??;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory store, primarily for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        migrate_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Insert or re-insert a device. Preserves `first_seen` and the existing
    /// `trust_score` on re-insert. Fails with [`Error::Conflict`] if the MAC
    /// is already bound to a different *active* device (invariant I2).
    #[allow(clippy::too_many_arguments)]
    pub async fn add_device(
        &self,
        device_id: &str,
        mac: &str,
        cert_ref: Option<&str>,
        key_ref: Option<&str>,
        device_type: &str,
        device_info: &str,
        fingerprint: Option<&str>,
    ) -> Result<()> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;

            let collision: Option<String> = conn
                .query_row(
                    "SELECT device_id FROM devices WHERE mac = ?1 AND status = 'active' AND device_id != ?2",
                    params![mac, device_id],
                    |row| row.get(0),
                )
                .optional()?;
            if collision.is_some() {
                return Err(Error::Conflict(format!(
                    "MAC {mac} already bound to an active device"
                )));
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO devices (device_id, mac, cert_ref, key_ref, status, device_type, device_info, fingerprint, first_seen, last_seen, ip, trust_score)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?7, ?8, ?8, NULL, ?9)
                 ON CONFLICT(device_id) DO UPDATE SET
                    mac = excluded.mac,
                    cert_ref = excluded.cert_ref,
                    key_ref = excluded.key_ref,
                    device_type = excluded.device_type,
                    device_info = excluded.device_info,
                    fingerprint = excluded.fingerprint,
                    last_seen = excluded.last_seen",
                params![device_id, mac, cert_ref, key_ref, device_type, device_info, fingerprint, now, DEFAULT_TRUST_SCORE],
            )?;

            Ok(())
        })
        .await
    }

    /// Fetch a device by id.
    pub async fn get_device(&self, device_id: &str) -> Result<Device> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            row_to_device(&conn, "device_id = ?1", params![device_id])?
                .ok_or_else(|| Error::NotFound(format!("device {device_id}")))
        })
        .await
    }

    /// Fetch the (preferentially active) device bound to `mac`, if any.
    pub async fn get_device_by_mac(&self, mac: &str) -> Result<Option<Device>> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            if let Some(d) = row_to_device(&conn, "mac = ?1 AND status = 'active'", params![mac])? {
                return Ok(Some(d));
            }
            row_to_device(&conn, "mac = ?1 ORDER BY last_seen DESC LIMIT 1", params![mac])
        })
        .await
    }

    /// Fetch the active device currently bound to `ip`, if any.
    pub async fn get_device_by_ip(&self, ip: &str) -> Result<Option<Device>> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            row_to_device(&conn, "ip = ?1 AND status = 'active'", params![ip])
        })
        .await
    }

    /// List all devices.
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare("SELECT * FROM devices")?;
            let rows = stmt
                .query_map([], device_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Update a device's lifecycle status.
    pub async fn update_status(&self, device_id: &str, status: DeviceStatus) -> Result<()> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            let n = conn.execute(
                "UPDATE devices SET status = ?1 WHERE device_id = ?2",
                params![status_str(status), device_id],
            )?;
            if n == 0 {
                return Err(Error::NotFound(format!("device {device_id}")));
            }
            Ok(())
        })
        .await
    }

    /// Update a device's observed IP address.
    pub async fn update_ip(&self, device_id: &str, ip: Option<&str>) -> Result<()> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            let n = conn.execute(
                "UPDATE devices SET ip = ?1 WHERE device_id = ?2",
                params![ip, device_id],
            )?;
            if n == 0 {
                return Err(Error::NotFound(format!("device {device_id}")));
            }
            Ok(())
        })
        .await
    }

    /// Refresh `last_seen` to now.
    pub async fn touch_last_seen(&self, device_id: &str) -> Result<()> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            let n = conn.execute(
                "UPDATE devices SET last_seen = ?1 WHERE device_id = ?2",
                params![Utc::now().to_rfc3339(), device_id],
            )?;
            if n == 0 {
                return Err(Error::NotFound(format!("device {device_id}")));
            }
            Ok(())
        })
        .await
    }

    /// Persist a finalized baseline (spec: immutable once finalized, overwritten
    /// only by a fresh profiling run).
    pub async fn save_baseline(&self, device_id: &str, baseline: &BehavioralBaseline) -> Result<()> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            let data = serde_json::to_string(baseline).map_err(|e| Error::Storage(e.to_string()))?;
            conn.execute(
                "INSERT INTO behavioral_baselines (device_id, data, established_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(device_id) DO UPDATE SET data = excluded.data, established_at = excluded.established_at",
                params![device_id, data, baseline.established_at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    /// Fetch a device's baseline, if established.
    pub async fn get_baseline(&self, device_id: &str) -> Result<Option<BehavioralBaseline>> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM behavioral_baselines WHERE device_id = ?1",
                    params![device_id],
                    |row| row.get(0),
                )
                .optional()?;
            data.map(|d| serde_json::from_str(&d).map_err(|e| Error::Storage(e.to_string())))
                .transpose()
        })
        .await
    }

    /// Persist a (re)generated policy.
    pub async fn save_policy(&self, device_id: &str, policy: &DevicePolicy) -> Result<()> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            let data = serde_json::to_string(policy).map_err(|e| Error::Storage(e.to_string()))?;
            conn.execute(
                "INSERT INTO device_policies (device_id, data, generated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(device_id) DO UPDATE SET data = excluded.data, generated_at = excluded.generated_at",
                params![device_id, data, policy.generated_at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    /// Fetch a device's current policy, if generated.
    pub async fn get_policy(&self, device_id: &str) -> Result<Option<DevicePolicy>> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM device_policies WHERE device_id = ?1",
                    params![device_id],
                    |row| row.get(0),
                )
                .optional()?;
            data.map(|d| serde_json::from_str(&d).map_err(|e| Error::Storage(e.to_string())))
                .transpose()
        })
        .await
    }

    /// Write the current score and append an immutable history row
    /// (invariants I3/I5: append-only, strictly ordered per device — callers
    /// serialize per-device via C8's lock, and this store additionally
    /// serializes all writers).
    pub async fn save_trust(&self, device_id: &str, score: i32, reason: &str) -> Result<()> {
        let clipped = score.clamp(0, 100);
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE devices SET trust_score = ?1 WHERE device_id = ?2",
                params![clipped, device_id],
            )?;
            conn.execute(
                "INSERT INTO trust_score_history (device_id, timestamp, score, reason) VALUES (?1, ?2, ?3, ?4)",
                params![device_id, now, clipped, reason],
            )?;
            Ok(())
        })
        .await
    }

    /// Load every device's current trust score, for startup hydration.
    pub async fn load_all_trust(&self) -> Result<HashMap<String, i32>> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare("SELECT device_id, trust_score FROM devices")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i32>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows.into_iter().collect())
        })
        .await
    }

    /// Full trust history for one device, oldest first.
    pub async fn trust_history(&self, device_id: &str) -> Result<Vec<TrustHistoryEntry>> {
        crate::error::retry_once(|| async {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT timestamp, score, reason FROM trust_score_history WHERE device_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![device_id], |row| {
                    let ts: String = row.get(0)?;
                    Ok(TrustHistoryEntry {
                        timestamp: DateTime::parse_from_rfc3339(&ts)
                            .map(|d| d.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                        score: row.get(1)?,
                        reason: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS devices (
            device_id TEXT PRIMARY KEY,
            mac TEXT NOT NULL,
            cert_ref TEXT,
            key_ref TEXT,
            status TEXT NOT NULL,
            device_type TEXT NOT NULL,
            device_info TEXT NOT NULL,
            fingerprint TEXT,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            ip TEXT,
            trust_score INTEGER NOT NULL DEFAULT 70
        );
        CREATE INDEX IF NOT EXISTS idx_devices_mac ON devices(mac);
        CREATE TABLE IF NOT EXISTS behavioral_baselines (
            device_id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            established_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS device_policies (
            device_id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            generated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS trust_score_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            score INTEGER NOT NULL,
            reason TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Forward-compatible migration: add any column named in [`DEVICE_COLUMNS`]
/// that a pre-existing `devices` table is missing (spec §4.1).
fn migrate_schema(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(devices)")?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (column, ddl) in DEVICE_COLUMNS {
        if !existing.iter().any(|c| c == column) {
            conn.execute(&format!("ALTER TABLE devices ADD COLUMN {column} {ddl}"), [])?;
        }
    }
    Ok(())
}

fn status_str(status: DeviceStatus) -> &'static str {
    match status {
        DeviceStatus::Active => "active",
        DeviceStatus::Inactive => "inactive",
        DeviceStatus::Revoked => "revoked",
        DeviceStatus::Quarantined => "quarantined",
    }
}

fn status_from_str(s: &str) -> DeviceStatus {
    match s {
        "inactive" => DeviceStatus::Inactive,
        "revoked" => DeviceStatus::Revoked,
        "quarantined" => DeviceStatus::Quarantined,
        _ => DeviceStatus::Active,
    }
}

fn device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    let parse_ts = |s: String| -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };
    Ok(Device {
        device_id: row.get("device_id")?,
        mac: row.get("mac")?,
        cert_ref: row.get("cert_ref")?,
        key_ref: row.get("key_ref")?,
        status: status_from_str(&row.get::<_, String>("status")?),
        device_type: row.get("device_type")?,
        device_info: row.get("device_info")?,
        fingerprint: row.get("fingerprint")?,
        first_seen: parse_ts(row.get("first_seen")?),
        last_seen: parse_ts(row.get("last_seen")?),
        ip: row.get("ip")?,
        trust_score: row.get("trust_score")?,
    })
}

fn row_to_device(
    conn: &Connection,
    predicate: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Option<Device>> {
    let sql = format!("SELECT * FROM devices WHERE {predicate}");
    let mut stmt = conn.prepare(&sql)?;
    let device = stmt.query_row(params, device_from_row).optional()?;
    Ok(device)
}
