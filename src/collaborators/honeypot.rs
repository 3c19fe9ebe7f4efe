//! Honeypot log source contract and threat-record parsing (spec §6).

use crate::error::Result;
use crate::types::{Severity, ThreatRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One raw structured event as returned by the honeypot log source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHoneypotEvent {
    pub event_id: String,
    pub src_ip: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Honeypot container runtime log source; out of scope beyond this contract.
#[async_trait]
pub trait HoneypotLogSource: Send + Sync {
    /// Return events observed since `since`.
    async fn poll_events(&self, since: chrono::DateTime<chrono::Utc>) -> Result<Vec<RawHoneypotEvent>>;
}

/// Used when no honeypot runtime is deployed.
#[derive(Debug, Default)]
pub struct NullHoneypotSource;

#[async_trait]
impl HoneypotLogSource for NullHoneypotSource {
    async fn poll_events(&self, _since: chrono::DateTime<chrono::Utc>) -> Result<Vec<RawHoneypotEvent>> {
        Ok(Vec::new())
    }
}

/// Map a known honeypot event id to a severity (spec §6).
fn severity_for_event(event_id: &str) -> Option<Severity> {
    match event_id {
        "login.success" => Some(Severity::Medium),
        "login.failed" => Some(Severity::Low),
        "command.input" => Some(Severity::Medium),
        "session.file_download" => Some(Severity::High),
        "client.version" => Some(Severity::None),
        _ => None,
    }
}

/// Parse a raw honeypot event into a [`ThreatRecord`], or `None` if the
/// event id is unrecognized (spec §6: "parses known event ids").
pub fn parse_threat_record(event: &RawHoneypotEvent) -> Option<ThreatRecord> {
    let severity = severity_for_event(&event.event_id)?;
    Some(ThreatRecord {
        source_ip: event.src_ip.clone(),
        timestamp: event.timestamp,
        event_type: event.event_id.clone(),
        severity,
        device_id: event.device_id.clone(),
        details: event.details.to_string(),
    })
}
