//! Attestation Scheduler (C9): periodic credential and heartbeat checks,
//! feeding failures into the Trust Scorer (spec §4.9).

use crate::ca::CertificateAuthority;
use crate::config::AttestationConfig;
use crate::error::Result;
use crate::identity::IdentityStore;
use crate::trust::TrustScorer;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

pub struct AttestationScheduler {
    config: AttestationConfig,
    identity: Arc<IdentityStore>,
    ca: Arc<CertificateAuthority>,
    trust: Arc<TrustScorer>,
    heartbeats: DashMap<String, DateTime<Utc>>,
}

impl AttestationScheduler {
    pub fn new(config: AttestationConfig, identity: Arc<IdentityStore>, ca: Arc<CertificateAuthority>, trust: Arc<TrustScorer>) -> Self {
        Self {
            config,
            identity,
            ca,
            trust,
            heartbeats: DashMap::new(),
        }
    }

    /// Record a heartbeat, e.g. from C12's data-submission path.
    pub fn record_heartbeat(&self, device_id: &str) {
        self.heartbeats.insert(device_id.to_string(), Utc::now());
    }

    /// Last recorded heartbeat timestamp for `device_id`, if any.
    pub fn last_heartbeat(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.heartbeats.get(device_id).map(|t| *t)
    }

    /// Run one attestation tick for `device_id`. Returns `true` iff both the
    /// credential check and the heartbeat-freshness check passed. On
    /// failure, invokes [`TrustScorer::attestation_failure`] (spec §4.9).
    pub async fn tick(&self, device_id: &str) -> Result<bool> {
        let device = self.identity.get_device(device_id).await?;

        let credential_ok = match &device.cert_ref {
            Some(cert_ref) => self.ca.verify(cert_ref).await?,
            None => false,
        };

        let heartbeat_ok = match self.heartbeats.get(device_id) {
            Some(last) => {
                let age = Utc::now().signed_duration_since(*last);
                age < chrono::Duration::from_std(self.config.tick_interval * 2).unwrap_or(chrono::Duration::zero())
            }
            None => false,
        };

        let passed = credential_ok && heartbeat_ok;
        if !passed {
            tracing::warn!(device_id, credential_ok, heartbeat_ok, "attestation failed");
            self.trust.attestation_failure(device_id).await?;
        }

        Ok(passed)
    }

    /// Run a tick for every device named in `device_ids`; used by the
    /// Supervisor's W6 worker (spec §5).
    pub async fn tick_all(&self, device_ids: &[String]) -> Vec<(String, Result<bool>)> {
        let mut results = Vec::with_capacity(device_ids.len());
        for device_id in device_ids {
            let outcome = self.tick(device_id).await;
            results.push((device_id.clone(), outcome));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_TRUST_SCORE;

    async fn harness() -> (AttestationScheduler, String, tempfile::TempDir) {
        let identity = Arc::new(IdentityStore::open_in_memory().await.unwrap());
        let tmp = tempfile::tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::open(tmp.path()).await.unwrap());
        let trust = Arc::new(TrustScorer::new(DEFAULT_TRUST_SCORE, identity.clone()));

        let (cert_ref, key_ref) = ca.issue("DEV_1", "AA:BB:CC:00:00:01", None).await.unwrap();
        identity.add_device("DEV_1", "AA:BB:CC:00:00:01", Some(&cert_ref), Some(&key_ref), "sensor", "", None).await.unwrap();

        let scheduler = AttestationScheduler::new(
            AttestationConfig { tick_interval: std::time::Duration::from_secs(300) },
            identity,
            ca,
            trust,
        );
        (scheduler, "DEV_1".to_string(), tmp)
    }

    #[tokio::test]
    async fn missing_heartbeat_fails_and_docks_trust() {
        let (scheduler, device_id, _tmp) = harness().await;
        let passed = scheduler.tick(&device_id).await.unwrap();
        assert!(!passed);
        assert_eq!(scheduler.trust.get(&device_id).await, DEFAULT_TRUST_SCORE - 20);
    }

    #[tokio::test]
    async fn fresh_heartbeat_and_valid_credential_pass() {
        let (scheduler, device_id, _tmp) = harness().await;
        scheduler.record_heartbeat(&device_id);
        let passed = scheduler.tick(&device_id).await.unwrap();
        assert!(passed);
        assert_eq!(scheduler.trust.get(&device_id).await, DEFAULT_TRUST_SCORE);
    }

    #[tokio::test]
    async fn revoked_credential_fails_attestation_even_with_heartbeat() {
        let (scheduler, device_id, tmp) = harness().await;
        scheduler.record_heartbeat(&device_id);
        scheduler.ca.revoke(&scheduler.identity, &device_id).await.unwrap();
        let passed = scheduler.tick(&device_id).await.unwrap();
        assert!(!passed);
        drop(tmp);
    }
}
