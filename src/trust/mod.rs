//! Trust Scorer (C8): maintains an integer trust score per device, reacts to
//! behavioral and security events, persists to C1, and notifies listeners
//! synchronously on every change (spec §4.8).

use crate::error::Result;
use crate::identity::IdentityStore;
use crate::types::{DeviceId, Severity, TrustBucket};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Registered on C8; invoked synchronously (never while holding the score
/// lock) on every score change (spec §4.8, §5, §9).
#[async_trait]
pub trait TrustChangeListener: Send + Sync {
    async fn on_trust_change(&self, device_id: &str, old: i32, new: i32, reason: &str);
}

const DELTA_BEHAVIORAL_LOW: i32 = -5;
const DELTA_BEHAVIORAL_MEDIUM: i32 = -15;
const DELTA_BEHAVIORAL_HIGH: i32 = -30;
const DELTA_ATTESTATION_FAILURE: i32 = -20;
const DELTA_SECURITY_LOW: i32 = -10;
const DELTA_SECURITY_MEDIUM: i32 = -20;
const DELTA_SECURITY_HIGH: i32 = -40;
const DELTA_POSITIVE_TICK: i32 = 2;

/// Per-device score held behind a mutex so a single device's updates are
/// totally ordered end-to-end (read, clip, persist) before the next update
/// for that device may proceed (spec §5 ordering guarantee).
pub struct TrustScorer {
    initial_score: i32,
    identity: Arc<IdentityStore>,
    scores: DashMap<DeviceId, Arc<Mutex<i32>>>,
    listeners: RwLock<Vec<Arc<dyn TrustChangeListener>>>,
}

impl TrustScorer {
    pub fn new(initial_score: i32, identity: Arc<IdentityStore>) -> Self {
        Self {
            initial_score,
            identity,
            scores: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a trust-change listener (e.g. the Policy Adapter, C10).
    pub async fn register_listener(&self, listener: Arc<dyn TrustChangeListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Hydrate in-memory scores from C1 on startup (spec §4.13).
    pub async fn hydrate(&self) -> Result<()> {
        for (device_id, score) in self.identity.load_all_trust().await? {
            self.scores.insert(device_id, Arc::new(Mutex::new(score)));
        }
        for device in self.identity.list_devices().await? {
            self.scores.entry(device.device_id).or_insert_with(|| Arc::new(Mutex::new(self.initial_score)));
        }
        Ok(())
    }

    /// Current score, or the configured initial score if never set.
    pub async fn get(&self, device_id: &str) -> i32 {
        let lock = self.device_lock(device_id);
        *lock.lock().await
    }

    fn device_lock(&self, device_id: &str) -> Arc<Mutex<i32>> {
        self.scores
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(self.initial_score)))
            .clone()
    }

    /// Adjust a device's score by `delta`, clipped to [0, 100].
    pub async fn adjust(&self, device_id: &str, delta: i32, reason: &str) -> Result<(i32, i32)> {
        let lock = self.device_lock(device_id);
        let (old, new) = {
            let mut guard = lock.lock().await;
            let old = *guard;
            let new = (old + delta).clamp(0, 100);
            self.identity.save_trust(device_id, new, reason).await?;
            *guard = new;
            (old, new)
        };
        self.notify_listeners(device_id, old, new, reason).await;
        Ok((old, new))
    }

    /// Set a device's score outright, clipped to [0, 100].
    pub async fn set(&self, device_id: &str, score: i32, reason: &str) -> Result<(i32, i32)> {
        let new = score.clamp(0, 100);
        let lock = self.device_lock(device_id);
        let old = {
            let mut guard = lock.lock().await;
            let old = *guard;
            self.identity.save_trust(device_id, new, reason).await?;
            *guard = new;
            old
        };
        self.notify_listeners(device_id, old, new, reason).await;
        Ok((old, new))
    }

    async fn notify_listeners(&self, device_id: &str, old: i32, new: i32, reason: &str) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            listener.on_trust_change(device_id, old, new, reason).await;
        }
    }

    /// Full append-only history for one device, oldest first (spec §4.8).
    pub async fn history(&self, device_id: &str) -> Result<Vec<crate::types::TrustHistoryEntry>> {
        self.identity.trust_history(device_id).await
    }

    pub async fn behavioral_anomaly(&self, device_id: &str, severity: Severity) -> Result<(i32, i32)> {
        let delta = match severity {
            Severity::Low => DELTA_BEHAVIORAL_LOW,
            Severity::Medium => DELTA_BEHAVIORAL_MEDIUM,
            Severity::High | Severity::Critical => DELTA_BEHAVIORAL_HIGH,
            Severity::None => 0,
        };
        self.adjust(device_id, delta, "behavioral_anomaly").await
    }

    pub async fn attestation_failure(&self, device_id: &str) -> Result<(i32, i32)> {
        self.adjust(device_id, DELTA_ATTESTATION_FAILURE, "attestation_failure").await
    }

    pub async fn security_alert(&self, device_id: &str, severity: Severity) -> Result<(i32, i32)> {
        let delta = match severity {
            Severity::Low => DELTA_SECURITY_LOW,
            Severity::Medium => DELTA_SECURITY_MEDIUM,
            Severity::High | Severity::Critical => DELTA_SECURITY_HIGH,
            Severity::None => 0,
        };
        self.adjust(device_id, delta, "security_alert").await
    }

    pub async fn positive_behavior_tick(&self, device_id: &str) -> Result<(i32, i32)> {
        self.adjust(device_id, DELTA_POSITIVE_TICK, "positive_behavior_tick").await
    }
}

/// Bucket helper re-exported for callers that only have a raw score.
pub fn bucket_of(score: i32) -> TrustBucket {
    TrustBucket::of(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener(Arc<AtomicUsize>);

    #[async_trait]
    impl TrustChangeListener for CountingListener {
        async fn on_trust_change(&self, _device_id: &str, _old: i32, _new: i32, _reason: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn scorer() -> TrustScorer {
        let identity = Arc::new(IdentityStore::open_in_memory().await.unwrap());
        identity.add_device("DEV_1", "AA:BB:CC:00:00:01", None, None, "sensor", "", None).await.unwrap();
        TrustScorer::new(70, identity)
    }

    #[tokio::test]
    async fn default_score_is_initial_score() {
        let s = scorer().await;
        assert_eq!(s.get("DEV_1").await, 70);
    }

    #[tokio::test]
    async fn adjust_clips_to_bounds() {
        let s = scorer().await;
        let (_, new) = s.adjust("DEV_1", -1000, "test").await.unwrap();
        assert_eq!(new, 0);
        let (_, new) = s.adjust("DEV_1", 1000, "test").await.unwrap();
        assert_eq!(new, 100);
    }

    #[tokio::test]
    async fn listeners_fire_synchronously_on_every_change() {
        let s = scorer().await;
        let count = Arc::new(AtomicUsize::new(0));
        s.register_listener(Arc::new(CountingListener(count.clone()))).await;
        s.adjust("DEV_1", -5, "behavioral_anomaly").await.unwrap();
        s.set("DEV_1", 50, "manual").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn security_alert_cascade_matches_spec_scenario_s5() {
        let s = scorer().await;
        let (_, new) = s.security_alert("DEV_1", Severity::High).await.unwrap();
        assert_eq!(new, 30);
        assert_eq!(bucket_of(new), TrustBucket::Suspicious);
        let (_, new) = s.security_alert("DEV_1", Severity::High).await.unwrap();
        assert_eq!(new, 0);
        assert_eq!(bucket_of(new), TrustBucket::Untrusted);
    }

    #[tokio::test]
    async fn history_persists_through_identity_store() {
        let s = scorer().await;
        s.adjust("DEV_1", -5, "a").await.unwrap();
        s.adjust("DEV_1", 3, "b").await.unwrap();
        let history = s.history("DEV_1").await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn hydrate_loads_scores_from_identity_store() {
        let identity = Arc::new(IdentityStore::open_in_memory().await.unwrap());
        identity.add_device("DEV_1", "AA:BB:CC:00:00:01", None, None, "sensor", "", None).await.unwrap();
        identity.save_trust("DEV_1", 42, "seed").await.unwrap();

        let s = TrustScorer::new(70, identity);
        s.hydrate().await.unwrap();
        assert_eq!(s.get("DEV_1").await, 42);
    }
}
