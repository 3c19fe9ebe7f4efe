//! Configuration for the Zero-Trust control plane.
//!
//! Mirrors the teacher's layered `Config` (one struct per subsystem, each
//! with research-free, spec-derived defaults) plus an env-var overlay for
//! the two deployment flags spec §6 names.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration, one section per component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub identity_store: IdentityStoreConfig,
    pub ca: CertificateAuthorityConfig,
    pub admission: AdmissionConfig,
    pub profiling: ProfilingConfig,
    pub flows: FlowAggregatorConfig,
    pub anomaly: AnomalyConfig,
    pub trust: TrustConfig,
    pub attestation: AttestationConfig,
    pub session: SessionConfig,
    pub supervisor: SupervisorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity_store: IdentityStoreConfig::default(),
            ca: CertificateAuthorityConfig::default(),
            admission: AdmissionConfig::default(),
            profiling: ProfilingConfig::default(),
            flows: FlowAggregatorConfig::default(),
            anomaly: AnomalyConfig::default(),
            trust: TrustConfig::default(),
            attestation: AttestationConfig::default(),
            session: SessionConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Config {
    /// Layer the two deployment environment variables from spec §6 onto defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("ALLOW_INSECURE_AUTO_AUTH") {
            config.session.allow_insecure_auto_auth = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("WIFI_INTERFACE") {
            config.admission.wifi_interface = v;
        }

        config
    }
}

/// Identity Store (C1) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityStoreConfig {
    /// Path to the SQLite database file.
    pub db_path: String,
}

impl Default for IdentityStoreConfig {
    fn default() -> Self {
        Self {
            db_path: "identity_store.db".to_string(),
        }
    }
}

/// Certificate Authority (C2) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateAuthorityConfig {
    /// Directory holding `ca_cert.pem`, `ca_key.pem`, and per-device credentials.
    pub cert_dir: String,
    pub ca_validity_days: i64,
    pub device_validity_days: i64,
}

impl Default for CertificateAuthorityConfig {
    fn default() -> Self {
        Self {
            cert_dir: "certs".to_string(),
            ca_validity_days: 365 * 10,
            device_validity_days: 365,
        }
    }
}

/// Admission Service (C3 + C4) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub pending_db_path: String,
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    pub wifi_interface: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            pending_db_path: "pending_admissions.db".to_string(),
            poll_interval: Duration::from_secs(2),
            wifi_interface: "wlan0".to_string(),
        }
    }
}

/// Behavioral Profiler (C5) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilingConfig {
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    #[serde(with = "duration_secs")]
    pub monitor_tick: Duration,
    pub min_packets_for_confidence: u64,
    pub top_k: usize,
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(300),
            monitor_tick: Duration::from_secs(30),
            min_packets_for_confidence: 5,
            top_k: 10,
        }
    }
}

/// Flow Statistics Aggregator (C6) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowAggregatorConfig {
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    pub window_size: usize,
    /// Switches polled for flow counters each tick.
    pub switch_ids: Vec<String>,
}

impl Default for FlowAggregatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            window_size: 100,
            switch_ids: Vec::new(),
        }
    }
}

/// Anomaly Detector (C7) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    #[serde(with = "duration_secs")]
    pub tick_interval: Duration,
    pub max_retained_events: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            max_retained_events: 100,
        }
    }
}

/// Trust Scorer (C8) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    pub initial_score: i32,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self { initial_score: crate::types::DEFAULT_TRUST_SCORE }
    }
}

/// Attestation Scheduler (C9) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationConfig {
    #[serde(with = "duration_secs")]
    pub tick_interval: Duration,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(300),
        }
    }
}

/// Session & Token Manager (C12) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    pub rate_limit_packets: u32,
    #[serde(with = "duration_secs")]
    pub rate_limit_window: Duration,
    /// Off by default (spec §4.12): new MAC with valid format auto-admits.
    pub allow_insecure_auto_auth: bool,
    /// Local wall-clock hour range during which all submissions are rejected.
    pub maintenance_window: Option<(u32, u32)>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            rate_limit_packets: 60,
            rate_limit_window: Duration::from_secs(60),
            allow_insecure_auto_auth: false,
            maintenance_window: Some((2, 3)),
        }
    }
}

/// Supervisor (C13) and worker-pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(with = "duration_secs")]
    pub policy_sweep_interval: Duration,
    #[serde(with = "duration_secs")]
    pub analyst_replay_interval: Duration,
    #[serde(with = "duration_secs")]
    pub honeypot_ingest_interval: Duration,
    #[serde(with = "duration_secs")]
    pub activity_update_interval: Duration,
    #[serde(with = "duration_secs")]
    pub shutdown_grace_period: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            policy_sweep_interval: Duration::from_secs(60),
            analyst_replay_interval: Duration::from_secs(30),
            honeypot_ingest_interval: Duration::from_secs(10),
            activity_update_interval: Duration::from_secs(10),
            shutdown_grace_period: Duration::from_secs(5),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
