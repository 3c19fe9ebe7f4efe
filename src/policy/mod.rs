//! Policy Adapter (C10): a trust-change listener that translates score
//! changes and threshold crossings into enforcement actions (spec §4.10).

use crate::collaborators::rule_installer::RuleInstaller;
use crate::identity::IdentityStore;
use crate::trust::{TrustChangeListener, TrustScorer};
use crate::types::{BehavioralBaseline, DeviceId, DevicePolicy, MatchFields, PolicyAction, PolicyRule, TrustBucket};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

const MAX_HISTORY_PER_DEVICE: usize = 100;
/// A change crossing this many points, even within one bucket, still acts
/// (spec §4.10).
const SCORE_DELTA_THRESHOLD: i32 = 10;
/// Rate limit is derived as this multiple of the baseline's mean rates
/// (spec §3 Device Policy).
const RATE_LIMIT_MULTIPLIER: f64 = 1.5;

/// Policy Generator subcomponent of C1/C10 (spec §3): builds an explicit
/// allow-list from a finalized baseline's top destinations/ports, terminated
/// by a default-deny rule, with a rate limit at 1.5x the baseline. Called by
/// C5 on baseline finalization and regenerable at any time.
pub fn generate_policy(baseline: &BehavioralBaseline) -> DevicePolicy {
    let mut rules = Vec::with_capacity(baseline.top_destinations.len() + baseline.top_ports.len() + 1);
    let mut priority = (baseline.top_destinations.len() + baseline.top_ports.len()) as u32 + 1;

    for (destination, _) in &baseline.top_destinations {
        rules.push(PolicyRule {
            action: PolicyAction::Allow,
            match_fields: MatchFields { ipv4_dst: Some(destination.clone()), ..Default::default() },
            priority,
        });
        priority -= 1;
    }
    for (port, _) in &baseline.top_ports {
        rules.push(PolicyRule {
            action: PolicyAction::Allow,
            match_fields: MatchFields { tcp_dst: Some(*port), ..Default::default() },
            priority,
        });
        priority -= 1;
    }
    rules.push(PolicyRule {
        action: PolicyAction::Deny,
        match_fields: MatchFields::default(),
        priority: 0,
    });

    DevicePolicy {
        device_id: baseline.device_id.clone(),
        rules,
        rate_limit_pps: baseline.mean_pps * RATE_LIMIT_MULTIPLIER,
        rate_limit_bps: baseline.mean_bps * RATE_LIMIT_MULTIPLIER,
        generated_at: Utc::now(),
    }
}

#[derive(Debug, Clone)]
pub struct PolicyDecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub old_score: i32,
    pub new_score: i32,
    pub old_bucket: TrustBucket,
    pub new_bucket: TrustBucket,
    pub action: PolicyAction,
}

pub struct PolicyAdapter {
    identity: Arc<IdentityStore>,
    rule_installer: Arc<dyn RuleInstaller>,
    history: DashMap<DeviceId, Mutex<VecDeque<PolicyDecisionRecord>>>,
}

impl PolicyAdapter {
    pub fn new(identity: Arc<IdentityStore>, rule_installer: Arc<dyn RuleInstaller>) -> Self {
        Self {
            identity,
            rule_installer,
            history: DashMap::new(),
        }
    }

    /// Last (up to 100) decisions recorded for a device, oldest first.
    pub async fn history(&self, device_id: &str) -> Vec<PolicyDecisionRecord> {
        match self.history.get(device_id) {
            Some(h) => h.lock().await.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Sweep every known device, ensuring the installed rule matches its
    /// current bucket (spec §5 W7 worker). Idempotent per the Rule Installer
    /// contract, so this is safe to call even when nothing changed.
    pub async fn sweep(&self, trust: &TrustScorer) -> crate::error::Result<()> {
        for device in self.identity.list_devices().await? {
            let score = trust.get(&device.device_id).await;
            let bucket = TrustBucket::of(score);
            let action = bucket.action();
            let match_fields = MatchFields {
                eth_src: Some(device.mac.clone()),
                ..Default::default()
            };
            if let Err(e) = self.rule_installer.install(&device.device_id, action, &match_fields, None, None).await {
                tracing::warn!(device_id = %device.device_id, error = %e, "policy sweep install failed");
            }
        }
        Ok(())
    }

    async fn record(&self, device_id: &str, record: PolicyDecisionRecord) {
        let entry = self
            .history
            .entry(device_id.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut history = entry.lock().await;
        if history.len() >= MAX_HISTORY_PER_DEVICE {
            history.pop_front();
        }
        history.push_back(record);
    }
}

#[async_trait]
impl TrustChangeListener for PolicyAdapter {
    async fn on_trust_change(&self, device_id: &str, old: i32, new: i32, _reason: &str) {
        let old_bucket = TrustBucket::of(old);
        let new_bucket = TrustBucket::of(new);

        if old_bucket == new_bucket && (new - old).abs() < SCORE_DELTA_THRESHOLD {
            return;
        }

        let device = match self.identity.get_device(device_id).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(device_id, error = %e, "policy adapter could not resolve device for trust change");
                return;
            }
        };

        let action = new_bucket.action();
        let match_fields = MatchFields {
            eth_src: Some(device.mac.clone()),
            ..Default::default()
        };

        if let Err(e) = self.rule_installer.install(device_id, action, &match_fields, None, None).await {
            tracing::warn!(device_id, error = %e, "policy adapter install failed");
        }

        self.record(
            device_id,
            PolicyDecisionRecord {
                timestamp: Utc::now(),
                old_score: old,
                new_score: new,
                old_bucket,
                new_bucket,
                action,
            },
        )
        .await;
    }
}
