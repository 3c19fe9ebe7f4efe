//! Shared data-model types (spec §3).
//!
//! The original system represents these as untyped dictionaries; here each
//! gets an explicit record or enum so the wire codec (`serde_json`) is the
//! only place loose typing survives.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque stable device identifier, `DEV_<mac-prefix>_<suffix>`.
pub type DeviceId = String;

/// Canonical uppercase colon-separated MAC address.
pub type Mac = String;

/// Lifecycle status of a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Active,
    Inactive,
    Revoked,
    Quarantined,
}

/// Root entity of the Identity Store (spec §3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub mac: Mac,
    pub cert_ref: Option<String>,
    pub key_ref: Option<String>,
    pub status: DeviceStatus,
    pub device_type: String,
    pub device_info: String,
    pub fingerprint: Option<String>,
    pub first_seen: chrono::DateTime<chrono::Utc>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    pub ip: Option<String>,
    pub trust_score: i32,
}

/// Default trust score assigned to a newly onboarded device.
pub const DEFAULT_TRUST_SCORE: i32 = 70;

/// State of a row in the Pending Admission Queue (spec §3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Approved,
    Rejected,
    Onboarded,
}

impl PendingStatus {
    /// Terminal states never revert (invariant I3).
    pub fn is_terminal(self) -> bool {
        matches!(self, PendingStatus::Rejected | PendingStatus::Onboarded)
    }
}

/// A device awaiting an operator decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAdmission {
    pub mac: Mac,
    pub device_id_candidate: DeviceId,
    pub device_type: Option<String>,
    pub device_info: Option<String>,
    pub detected_at: chrono::DateTime<chrono::Utc>,
    pub status: PendingStatus,
    pub admin_notes: Option<String>,
    pub approved_at: Option<chrono::DateTime<chrono::Utc>>,
    pub rejected_at: Option<chrono::DateTime<chrono::Utc>>,
    pub onboarded_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// One immutable audit row for a pending-admission state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionHistoryEntry {
    pub mac: Mac,
    pub from_status: Option<PendingStatus>,
    pub to_status: PendingStatus,
    pub notes: Option<String>,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Learned per-device traffic baseline (spec §3, §4.5). Immutable once finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehavioralBaseline {
    pub device_id: DeviceId,
    pub mean_pps: f64,
    pub mean_bps: f64,
    pub mean_packet_size: f64,
    pub top_destinations: Vec<(String, u64)>,
    pub top_ports: Vec<(u16, u64)>,
    pub protocol_histogram: HashMap<String, u64>,
    /// Distinct destinations/ports seen during the full profiling window
    /// (not truncated to `top_destinations`/`top_ports`); the anomaly
    /// detector's baseline for scanning/port-scanning ratios (spec §4.7).
    pub unique_destinations: usize,
    pub unique_ports: usize,
    pub established_at: chrono::DateTime<chrono::Utc>,
    /// Set when the profiling window elapsed with fewer than 5 packets observed.
    pub limited_traffic: bool,
}

/// Action mandated by an enforcement decision (spec glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Deny,
    Redirect,
    Quarantine,
}

/// Match fields over the southbound rule-installer's supported set (spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchFields {
    pub eth_src: Option<String>,
    pub eth_dst: Option<String>,
    pub ipv4_src: Option<String>,
    pub ipv4_dst: Option<String>,
    pub in_port: Option<u32>,
    pub ip_proto: Option<u8>,
    pub tcp_src: Option<u16>,
    pub tcp_dst: Option<u16>,
    pub udp_src: Option<u16>,
    pub udp_dst: Option<u16>,
}

/// A single match/action rule in a [`DevicePolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub action: PolicyAction,
    pub match_fields: MatchFields,
    pub priority: u32,
}

/// Per-device policy generated from its baseline (spec §3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePolicy {
    pub device_id: DeviceId,
    pub rules: Vec<PolicyRule>,
    pub rate_limit_pps: f64,
    pub rate_limit_bps: f64,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

/// One row of a device's append-only trust history (spec §3, invariants I3/I5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustHistoryEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub score: i32,
    pub reason: String,
}

/// Trust level buckets driving enforcement (spec §4.8, §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustBucket {
    Trusted,
    Monitored,
    Suspicious,
    Untrusted,
}

impl TrustBucket {
    /// Bucket a raw score falls into.
    pub fn of(score: i32) -> Self {
        if score >= 70 {
            TrustBucket::Trusted
        } else if score >= 50 {
            TrustBucket::Monitored
        } else if score >= 30 {
            TrustBucket::Suspicious
        } else {
            TrustBucket::Untrusted
        }
    }

    /// Enforcement action mandated for this bucket (spec §4.10 table).
    pub fn action(self) -> PolicyAction {
        match self {
            TrustBucket::Trusted => PolicyAction::Allow,
            TrustBucket::Monitored => PolicyAction::Redirect,
            TrustBucket::Suspicious => PolicyAction::Deny,
            TrustBucket::Untrusted => PolicyAction::Quarantine,
        }
    }
}

/// Counters pulled from a single data-plane flow reply (spec §3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSample {
    pub device_id: DeviceId,
    pub packets: u64,
    pub bytes: u64,
    pub duration_secs: f64,
    pub pps: f64,
    pub bps: f64,
    pub destination: String,
    pub dest_port: u16,
    pub protocol: String,
    pub sampled_at: chrono::DateTime<chrono::Utc>,
}

/// Aggregated statistics over a device's rolling flow window (spec §4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceFlowStats {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub avg_pps: f64,
    pub avg_bps: f64,
    pub unique_destinations: usize,
    pub unique_ports: usize,
    pub flow_count: usize,
}

/// Classification of an [`AnomalyEvent`] (spec §3, §4.7). Precedence for
/// "highest matched type" is `Dos > Volume > Scanning > PortScanning > Anomaly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Dos,
    Scanning,
    PortScanning,
    VolumeAttack,
    Anomaly,
}

impl AnomalyType {
    fn precedence(self) -> u8 {
        match self {
            AnomalyType::Dos => 0,
            AnomalyType::VolumeAttack => 1,
            AnomalyType::Scanning => 2,
            AnomalyType::PortScanning => 3,
            AnomalyType::Anomaly => 4,
        }
    }
}

impl PartialOrd for AnomalyType {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AnomalyType {
    /// Lower precedence value sorts first ("highest precedence" = smallest value).
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.precedence().cmp(&other.precedence())
    }
}

/// Severity of an anomaly or threat signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// A detected anomaly (spec §3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub device_id: DeviceId,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub score: u32,
    pub indicators: Vec<String>,
}

/// A threat signal ingested from the honeypot collaborator (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatRecord {
    pub source_ip: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: String,
    pub severity: Severity,
    pub device_id: Option<DeviceId>,
    pub details: String,
}

/// An opaque short-lived session token (spec §3, §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionToken {
    pub device_id: DeviceId,
    pub token: String,
    pub last_activity: chrono::DateTime<chrono::Utc>,
}
