//! Anomaly Detector (C7): compares live flow aggregates against a device's
//! baseline (or absolute thresholds when none exists) to emit anomaly
//! events with type and severity (spec §4.7).

use crate::config::AnomalyConfig;
use crate::identity::IdentityStore;
use crate::flows::FlowAggregator;
use crate::types::{AnomalyEvent, AnomalyType, DeviceFlowStats, Severity};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Absolute thresholds used when a device has no baseline yet (spec §4.7).
#[derive(Debug, Clone)]
pub struct AbsoluteThresholds {
    pub pps: f64,
    pub bps: f64,
    pub unique_destinations: usize,
    pub unique_ports: usize,
}

impl Default for AbsoluteThresholds {
    fn default() -> Self {
        Self {
            pps: 50.0,
            bps: 1_000_000.0,
            unique_destinations: 50,
            unique_ports: 30,
        }
    }
}

struct ScoredSignal {
    anomaly_type: AnomalyType,
    score: u32,
    indicator: String,
}

pub struct AnomalyDetector {
    config: AnomalyConfig,
    identity: Arc<IdentityStore>,
    flows: Arc<FlowAggregator>,
    absolute: AbsoluteThresholds,
    recent_events: Mutex<VecDeque<AnomalyEvent>>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig, identity: Arc<IdentityStore>, flows: Arc<FlowAggregator>) -> Self {
        Self {
            config,
            identity,
            flows,
            absolute: AbsoluteThresholds::default(),
            recent_events: Mutex::new(VecDeque::new()),
        }
    }

    /// Evaluate one device's current flow stats against its baseline (or
    /// absolute thresholds if none), emitting an [`AnomalyEvent`] iff any
    /// signal crossed a threshold. Reads flow aggregates via a snapshot to
    /// avoid holding a lock during evaluation (spec §5).
    pub async fn evaluate(&self, device_id: &str, window_seconds: i64) -> crate::error::Result<Option<AnomalyEvent>> {
        let stats = self.flows.device_stats(device_id, window_seconds);
        let baseline = self.identity.get_baseline(device_id).await?;

        let signals = match baseline {
            Some(b) => evaluate_with_baseline(&stats, b.mean_pps, b.mean_bps, b.unique_destinations, b.unique_ports),
            None => evaluate_absolute(&stats, &self.absolute),
        };

        if signals.is_empty() {
            return Ok(None);
        }

        let total_score: u32 = signals.iter().map(|s| s.score).sum();
        let anomaly_type = signals.iter().map(|s| s.anomaly_type).min().unwrap();
        let severity = severity_for_score(total_score);
        let indicators = signals.into_iter().map(|s| s.indicator).collect();

        let event = AnomalyEvent {
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            anomaly_type,
            severity,
            score: total_score,
            indicators,
        };

        let mut recent = self.recent_events.lock().await;
        if recent.len() >= self.config.max_retained_events {
            recent.pop_front();
        }
        recent.push_back(event.clone());

        tracing::info!(device_id, ?anomaly_type, ?severity, total_score, "anomaly detected");
        Ok(Some(event))
    }

    /// Last `limit` retained events, most recent last.
    pub async fn recent_events(&self, limit: usize) -> Vec<AnomalyEvent> {
        let recent = self.recent_events.lock().await;
        recent.iter().rev().take(limit).rev().cloned().collect()
    }

    /// Retained events for one device, most recent last; used by C11 to
    /// gather "recent anomaly alerts" (spec §4.11).
    pub async fn recent_events_for(&self, device_id: &str, limit: usize) -> Vec<AnomalyEvent> {
        let recent = self.recent_events.lock().await;
        recent
            .iter()
            .rev()
            .filter(|e| e.device_id == device_id)
            .take(limit)
            .cloned()
            .rev()
            .collect()
    }
}

fn severity_for_score(score: u32) -> Severity {
    if score >= 70 {
        Severity::High
    } else if score >= 40 {
        Severity::Medium
    } else if score >= 20 {
        Severity::Low
    } else {
        Severity::None
    }
}

fn evaluate_with_baseline(
    stats: &DeviceFlowStats,
    baseline_pps: f64,
    baseline_bps: f64,
    baseline_dst: usize,
    baseline_port: usize,
) -> Vec<ScoredSignal> {
    let mut signals = Vec::new();
    let pps_ratio = ratio(stats.avg_pps, baseline_pps);
    let bps_ratio = ratio(stats.avg_bps, baseline_bps);

    if pps_ratio > 10.0 {
        signals.push(ScoredSignal { anomaly_type: AnomalyType::Dos, score: 50, indicator: format!("pps ratio {pps_ratio:.1}x > 10x baseline") });
    } else if pps_ratio > 5.0 {
        signals.push(ScoredSignal { anomaly_type: AnomalyType::Dos, score: 30, indicator: format!("pps ratio {pps_ratio:.1}x > 5x baseline") });
    } else if pps_ratio > 2.0 {
        signals.push(ScoredSignal { anomaly_type: AnomalyType::Dos, score: 15, indicator: format!("pps ratio {pps_ratio:.1}x > 2x baseline") });
    }

    if bps_ratio > 10.0 {
        signals.push(ScoredSignal { anomaly_type: AnomalyType::VolumeAttack, score: 40, indicator: format!("bps ratio {bps_ratio:.1}x > 10x baseline") });
    }

    if stats.unique_destinations as f64 > baseline_dst as f64 * 5.0 && stats.unique_destinations > 20 {
        signals.push(ScoredSignal { anomaly_type: AnomalyType::Scanning, score: 25, indicator: format!("{} unique destinations > 5x baseline ({baseline_dst})", stats.unique_destinations) });
    }

    if stats.unique_ports as f64 > baseline_port as f64 * 3.0 && stats.unique_ports > 10 {
        signals.push(ScoredSignal { anomaly_type: AnomalyType::PortScanning, score: 20, indicator: format!("{} unique ports > 3x baseline ({baseline_port})", stats.unique_ports) });
    }

    signals
}

fn evaluate_absolute(stats: &DeviceFlowStats, thresholds: &AbsoluteThresholds) -> Vec<ScoredSignal> {
    let mut signals = Vec::new();

    if stats.avg_pps > thresholds.pps * 10.0 {
        signals.push(ScoredSignal { anomaly_type: AnomalyType::Dos, score: 50, indicator: format!("pps {:.1} > 10x absolute threshold", stats.avg_pps) });
    } else if stats.avg_pps > thresholds.pps * 5.0 {
        signals.push(ScoredSignal { anomaly_type: AnomalyType::Dos, score: 30, indicator: format!("pps {:.1} > 5x absolute threshold", stats.avg_pps) });
    } else if stats.avg_pps > thresholds.pps * 2.0 {
        signals.push(ScoredSignal { anomaly_type: AnomalyType::Dos, score: 15, indicator: format!("pps {:.1} > 2x absolute threshold", stats.avg_pps) });
    }

    if stats.avg_bps > thresholds.bps * 10.0 {
        signals.push(ScoredSignal { anomaly_type: AnomalyType::VolumeAttack, score: 40, indicator: format!("bps {:.1} > 10x absolute threshold", stats.avg_bps) });
    }

    if stats.unique_destinations as f64 > thresholds.unique_destinations as f64 * 5.0 && stats.unique_destinations > 20 {
        signals.push(ScoredSignal { anomaly_type: AnomalyType::Scanning, score: 25, indicator: format!("{} unique destinations over absolute threshold", stats.unique_destinations) });
    }

    if stats.unique_ports as f64 > thresholds.unique_ports as f64 * 3.0 && stats.unique_ports > 10 {
        signals.push(ScoredSignal { anomaly_type: AnomalyType::PortScanning, score: 20, indicator: format!("{} unique ports over absolute threshold", stats.unique_ports) });
    }

    signals
}

fn ratio(value: f64, baseline: f64) -> f64 {
    if baseline <= 0.0 {
        if value > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        value / baseline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::rule_installer::NullRuleInstaller;
    use crate::config::FlowAggregatorConfig;

    #[tokio::test]
    async fn dos_signal_without_baseline() {
        let identity = Arc::new(IdentityStore::open_in_memory().await.unwrap());
        let flows = Arc::new(FlowAggregator::new(FlowAggregatorConfig::default(), identity.clone(), Arc::new(NullRuleInstaller)));
        let detector = AnomalyDetector::new(AnomalyConfig::default(), identity, flows);

        let stats = DeviceFlowStats { avg_pps: 600.0, avg_bps: 0.0, total_packets: 0, total_bytes: 0, unique_destinations: 0, unique_ports: 0, flow_count: 1 };
        let signals = evaluate_absolute(&stats, &AbsoluteThresholds::default());
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].anomaly_type, AnomalyType::Dos);
        assert_eq!(signals[0].score, 50);
        let _ = detector.recent_events(10).await;
    }

    #[test]
    fn baseline_scanning_signal() {
        let stats = DeviceFlowStats { avg_pps: 1.0, avg_bps: 1.0, total_packets: 0, total_bytes: 0, unique_destinations: 25, unique_ports: 2, flow_count: 1 };
        let signals = evaluate_with_baseline(&stats, 1.0, 1.0, 2, 2);
        assert!(signals.iter().any(|s| s.anomaly_type == AnomalyType::Scanning));
    }

    #[test]
    fn severity_buckets() {
        assert_eq!(severity_for_score(75), Severity::High);
        assert_eq!(severity_for_score(45), Severity::Medium);
        assert_eq!(severity_for_score(20), Severity::Low);
        assert_eq!(severity_for_score(5), Severity::None);
    }
}
