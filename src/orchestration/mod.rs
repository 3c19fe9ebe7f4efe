//! Traffic Orchestrator (C11): central decision fusion for alert paths that
//! need an immediate policy decision rather than waiting on the trust-score
//! cascade (spec §4.11). Advisory with respect to C10 — both may act on the
//! same device; the Rule Installer contract requires idempotence either way.

use crate::anomaly::AnomalyDetector;
use crate::collaborators::rule_installer::RuleInstaller;
use crate::identity::IdentityStore;
use crate::trust::TrustScorer;
use crate::types::{DeviceId, MatchFields, PolicyAction, Severity, ThreatRecord};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

const MAX_DECISIONS_PER_DEVICE: usize = 100;

#[derive(Debug, Clone)]
pub struct OrchestratorDecision {
    pub timestamp: DateTime<Utc>,
    pub device_id: DeviceId,
    pub trust_score: i32,
    pub threat_level: Severity,
    pub action: PolicyAction,
}

pub struct TrafficOrchestrator {
    identity: Arc<IdentityStore>,
    trust: Arc<TrustScorer>,
    anomaly: Arc<AnomalyDetector>,
    rule_installer: Arc<dyn RuleInstaller>,
    decisions: DashMap<DeviceId, Mutex<VecDeque<OrchestratorDecision>>>,
}

impl TrafficOrchestrator {
    pub fn new(
        identity: Arc<IdentityStore>,
        trust: Arc<TrustScorer>,
        anomaly: Arc<AnomalyDetector>,
        rule_installer: Arc<dyn RuleInstaller>,
    ) -> Self {
        Self {
            identity,
            trust,
            anomaly,
            rule_installer,
            decisions: DashMap::new(),
        }
    }

    /// Fuse identity, trust, anomaly, and an optional threat record into one
    /// [`PolicyAction`], apply it, and record the decision (spec §4.11).
    pub async fn decide(&self, device_id: &str, threat: Option<&ThreatRecord>) -> crate::error::Result<PolicyAction> {
        let device = self.identity.get_device(device_id).await?;
        let trust_score = self.trust.get(device_id).await;
        let recent_alerts = self.anomaly.recent_events_for(device_id, 20).await;

        let threat_level = compute_threat_level(threat, &recent_alerts);
        let action = decide_action(threat_level, trust_score);

        let match_fields = MatchFields {
            eth_src: Some(device.mac.clone()),
            ..Default::default()
        };
        self.rule_installer.install(device_id, action, &match_fields, None, None).await?;

        let entry = self
            .decisions
            .entry(device_id.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut history = entry.lock().await;
        if history.len() >= MAX_DECISIONS_PER_DEVICE {
            history.pop_front();
        }
        history.push_back(OrchestratorDecision {
            timestamp: Utc::now(),
            device_id: device_id.to_string(),
            trust_score,
            threat_level,
            action,
        });

        Ok(action)
    }

    /// Last (up to 100) decisions recorded for a device, oldest first.
    pub async fn history(&self, device_id: &str) -> Vec<OrchestratorDecision> {
        match self.decisions.get(device_id) {
            Some(h) => h.lock().await.iter().cloned().collect(),
            None => Vec::new(),
        }
    }
}

fn compute_threat_level(threat: Option<&ThreatRecord>, recent_alerts: &[crate::types::AnomalyEvent]) -> Severity {
    let mut level = threat.map(|t| t.severity).unwrap_or(Severity::None);

    let high_count = recent_alerts.iter().filter(|a| a.severity == Severity::High || a.severity == Severity::Critical).count();
    let medium_count = recent_alerts.iter().filter(|a| a.severity == Severity::Medium).count();

    if high_count >= 1 {
        level = level.max(Severity::High);
    }
    if medium_count >= 2 {
        level = level.max(Severity::High);
    } else if medium_count >= 1 {
        level = level.max(Severity::Medium);
    }

    level
}

fn decide_action(threat_level: Severity, trust_score: i32) -> PolicyAction {
    if threat_level == Severity::Critical {
        return PolicyAction::Quarantine;
    }
    if threat_level == Severity::High {
        return if trust_score < 30 { PolicyAction::Quarantine } else { PolicyAction::Redirect };
    }
    if trust_score < 30 {
        return PolicyAction::Quarantine;
    }
    if trust_score < 50 {
        return PolicyAction::Deny;
    }
    if trust_score < 70 || threat_level == Severity::Medium {
        return PolicyAction::Redirect;
    }
    PolicyAction::Allow
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::AnomalyDetector;
    use crate::collaborators::rule_installer::{FlowQuerySample, NullRuleInstaller};
    use crate::config::{AnomalyConfig, FlowAggregatorConfig};
    use crate::flows::FlowAggregator;
    use crate::types::DEFAULT_TRUST_SCORE;
    use async_trait::async_trait;
    use tokio::sync::Mutex as TokioMutex;

    struct RecordingInstaller(TokioMutex<Vec<PolicyAction>>);

    #[async_trait]
    impl RuleInstaller for RecordingInstaller {
        async fn install(&self, _: &DeviceId, action: PolicyAction, _: &MatchFields, _: Option<u32>, _: Option<u64>) -> crate::error::Result<()> {
            self.0.lock().await.push(action);
            Ok(())
        }
        async fn remove(&self, _: &DeviceId) -> crate::error::Result<()> {
            Ok(())
        }
        async fn query_flows(&self, _: &str) -> crate::error::Result<Vec<FlowQuerySample>> {
            Ok(Vec::new())
        }
    }

    async fn harness() -> (TrafficOrchestrator, Arc<IdentityStore>, Arc<RecordingInstaller>, Arc<TrustScorer>) {
        let identity = Arc::new(IdentityStore::open_in_memory().await.unwrap());
        identity.add_device("DEV_1", "AA:BB:CC:00:00:01", None, None, "sensor", "", None).await.unwrap();
        let trust = Arc::new(TrustScorer::new(DEFAULT_TRUST_SCORE, identity.clone()));
        let flows = Arc::new(FlowAggregator::new(FlowAggregatorConfig::default(), identity.clone(), Arc::new(NullRuleInstaller)));
        let anomaly = Arc::new(AnomalyDetector::new(AnomalyConfig::default(), identity.clone(), flows));
        let installer = Arc::new(RecordingInstaller(TokioMutex::new(Vec::new())));
        let orchestrator = TrafficOrchestrator::new(identity.clone(), trust.clone(), anomaly, installer.clone());
        (orchestrator, identity, installer, trust)
    }

    #[tokio::test]
    async fn critical_threat_always_quarantines() {
        let (orch, _identity, _installer, _trust) = harness().await;
        let threat = ThreatRecord {
            source_ip: "10.0.0.9".into(),
            timestamp: Utc::now(),
            event_type: "session.file_download".into(),
            severity: Severity::Critical,
            device_id: Some("DEV_1".into()),
            details: "{}".into(),
        };
        let action = orch.decide("DEV_1", Some(&threat)).await.unwrap();
        assert_eq!(action, PolicyAction::Quarantine);
    }

    #[tokio::test]
    async fn no_threat_and_high_trust_allows() {
        let (orch, _identity, _installer, _trust) = harness().await;
        let action = orch.decide("DEV_1", None).await.unwrap();
        assert_eq!(action, PolicyAction::Allow);
    }

    #[tokio::test]
    async fn low_trust_without_threat_still_quarantines() {
        let (orch, _identity, _installer, trust) = harness().await;
        trust.set("DEV_1", 10, "test").await.unwrap();
        let action = orch.decide("DEV_1", None).await.unwrap();
        assert_eq!(action, PolicyAction::Quarantine);
    }

    #[test]
    fn threat_level_bumps_up_on_repeated_medium_alerts() {
        use crate::types::AnomalyEvent;
        let alerts = vec![
            AnomalyEvent { device_id: "DEV_1".into(), timestamp: Utc::now(), anomaly_type: crate::types::AnomalyType::Anomaly, severity: Severity::Medium, score: 40, indicators: vec![] },
            AnomalyEvent { device_id: "DEV_1".into(), timestamp: Utc::now(), anomaly_type: crate::types::AnomalyType::Anomaly, severity: Severity::Medium, score: 40, indicators: vec![] },
        ];
        assert_eq!(compute_threat_level(None, &alerts), Severity::High);
    }
}
