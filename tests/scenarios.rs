//! End-to-end scenarios from spec §8, driven directly against the component
//! APIs (the HTTP surface is out of scope; these exercise the same call
//! sequence a handler would make).

use iot_zt_core::admission::{AdmissionService, NullLinkLayerEventSource, PendingQueue};
use iot_zt_core::anomaly::AnomalyDetector;
use iot_zt_core::attestation::AttestationScheduler;
use iot_zt_core::ca::CertificateAuthority;
use iot_zt_core::collaborators::rule_installer::{FlowQuerySample, NullRuleInstaller, RuleInstaller};
use iot_zt_core::config::{AnomalyConfig, AttestationConfig, FlowAggregatorConfig, ProfilingConfig, SessionConfig};
use iot_zt_core::flows::FlowAggregator;
use iot_zt_core::identity::IdentityStore;
use iot_zt_core::orchestration::TrafficOrchestrator;
use iot_zt_core::policy::PolicyAdapter;
use iot_zt_core::profiling::{BehavioralProfiler, PacketInfo};
use iot_zt_core::session::SessionManager;
use iot_zt_core::trust::TrustScorer;
use iot_zt_core::types::{DeviceStatus, PolicyAction};
use std::collections::HashSet;
use std::sync::Arc;

const MAC: &str = "AA:BB:CC:00:00:01";

#[tokio::test]
async fn s1_admission_then_onboarding() {
    let identity = Arc::new(IdentityStore::open_in_memory().await.unwrap());
    let pending = Arc::new(PendingQueue::open_in_memory().await.unwrap());
    let tmp = tempfile::tempdir().unwrap();
    let ca = Arc::new(CertificateAuthority::open(tmp.path()).await.unwrap());
    let profiler = Arc::new(BehavioralProfiler::new(ProfilingConfig::default(), identity.clone()));

    let admission = AdmissionService::new(
        Default::default(),
        identity.clone(),
        pending.clone(),
        ca.clone(),
        profiler,
        Arc::new(NullLinkLayerEventSource),
    );

    // Simulate one poll tick observing the new MAC directly through C3,
    // since the null link-layer source reports nothing on its own.
    let outcome = pending.enqueue(&MAC.to_string(), "DEV_AA_BB_CC_ABC123", None, None).await.unwrap();
    assert_eq!(outcome, iot_zt_core::admission::EnqueueOutcome::Enqueued);

    let rows = pending.list_pending().await.unwrap();
    assert_eq!(rows.len(), 1);
    let re = regex::Regex::new(r"^DEV_AA_BB_CC_[A-Z0-9]{6}$").unwrap();
    assert!(re.is_match(&rows[0].device_id_candidate));
    assert_eq!(rows[0].status, iot_zt_core::types::PendingStatus::Pending);

    let device_id = admission.approve_and_onboard(&MAC.to_string(), None).await.unwrap();

    assert!(pending.list_pending().await.unwrap().is_empty());

    let device = identity.get_device_by_mac(&MAC.to_string()).await.unwrap().unwrap();
    assert_eq!(device.device_id, device_id);
    assert_eq!(device.status, DeviceStatus::Active);
    assert!(device.cert_ref.is_some());

    assert!(ca.verify(device.cert_ref.as_deref().unwrap()).await.unwrap());
}

#[tokio::test]
async fn s2_token_lifecycle_with_expiry() {
    let identity = Arc::new(IdentityStore::open_in_memory().await.unwrap());
    identity.add_device("DEV_1", MAC, None, None, "sensor", "", None).await.unwrap();
    identity.update_status("DEV_1", DeviceStatus::Active).await.unwrap();
    let pending = Arc::new(PendingQueue::open_in_memory().await.unwrap());

    let session = SessionManager::new(
        SessionConfig { ttl: std::time::Duration::from_secs(300), maintenance_window: None, ..Default::default() },
        identity,
        pending,
        HashSet::new(),
        None,
    );

    let token = session.issue("DEV_1", &MAC.to_string()).await.unwrap();
    assert_eq!(token.len(), 36);

    session.authenticate("DEV_1", &token).await.unwrap();

    tokio::time::pause();
    tokio::time::advance(std::time::Duration::from_secs(301)).await;

    let err = session.authenticate("DEV_1", &token).await.unwrap_err();
    assert!(matches!(err, iot_zt_core::error::Error::Authz { reason } if reason == "session_expired"));
}

#[tokio::test]
async fn s3_rate_limit_rejects_61st_submission() {
    let identity = Arc::new(IdentityStore::open_in_memory().await.unwrap());
    identity.add_device("DEV_1", MAC, None, None, "sensor", "", None).await.unwrap();
    identity.update_status("DEV_1", DeviceStatus::Active).await.unwrap();
    let pending = Arc::new(PendingQueue::open_in_memory().await.unwrap());

    let session = SessionManager::new(
        SessionConfig {
            rate_limit_packets: 60,
            rate_limit_window: std::time::Duration::from_secs(60),
            maintenance_window: None,
            ..Default::default()
        },
        identity,
        pending,
        HashSet::new(),
        None,
    );

    let token = session.issue("DEV_1", &MAC.to_string()).await.unwrap();
    for _ in 0..60 {
        session.submit_data("DEV_1", &token).await.unwrap();
    }
    let err = session.submit_data("DEV_1", &token).await.unwrap_err();
    assert!(matches!(err, iot_zt_core::error::Error::Authz { reason } if reason == "rate_limit_exceeded"));
}

struct FixedRateInstaller(std::sync::Mutex<Vec<FlowQuerySample>>);

#[async_trait::async_trait]
impl RuleInstaller for FixedRateInstaller {
    async fn install(
        &self,
        _: &iot_zt_core::types::DeviceId,
        _: PolicyAction,
        _: &iot_zt_core::types::MatchFields,
        _: Option<u32>,
        _: Option<u64>,
    ) -> iot_zt_core::error::Result<()> {
        Ok(())
    }
    async fn remove(&self, _: &iot_zt_core::types::DeviceId) -> iot_zt_core::error::Result<()> {
        Ok(())
    }
    async fn query_flows(&self, _switch_id: &str) -> iot_zt_core::error::Result<Vec<FlowQuerySample>> {
        Ok(std::mem::take(&mut *self.0.lock().unwrap()))
    }
}

#[tokio::test]
async fn s4_baseline_then_anomaly_detects_dos() {
    let identity = Arc::new(IdentityStore::open_in_memory().await.unwrap());
    identity.add_device("DEV_1", MAC, None, None, "sensor", "", None).await.unwrap();

    // Profile a quiet device: a handful of packets trickling in gives a
    // baseline around 1 pps, matching the scenario's "1 packet/s" window.
    let profiler = BehavioralProfiler::new(
        ProfilingConfig { duration: std::time::Duration::from_millis(10), min_packets_for_confidence: 1, ..Default::default() },
        identity.clone(),
    );
    profiler.begin("DEV_1");
    profiler.record("DEV_1", &PacketInfo { bytes: 100, destination: "10.0.0.5".into(), dest_port: 443, protocol: "tcp".into() });
    tokio::time::sleep(std::time::Duration::from_millis(15)).await;
    let mut baseline = profiler.finalize("DEV_1").await.unwrap();
    baseline.mean_pps = 1.0;
    baseline.mean_bps = 100.0;
    identity.save_baseline("DEV_1", &baseline).await.unwrap();

    // Burst of 12 pps sustained over a 60 s window: 12x the baseline, which
    // the §4.7 threshold table scores as a high-severity dos signal.
    let installer: Arc<dyn RuleInstaller> = Arc::new(FixedRateInstaller(std::sync::Mutex::new(
        (0..12 * 60)
            .map(|_| FlowQuerySample {
                eth_src: MAC.to_string(),
                destination: "10.0.0.5".to_string(),
                dest_port: 443,
                protocol: "tcp".to_string(),
                packets: 1,
                bytes: 100,
                duration_secs: 1.0 / 12.0,
            })
            .collect(),
    )));
    let flows = Arc::new(FlowAggregator::new(
        FlowAggregatorConfig { switch_ids: vec!["sw1".to_string()], window_size: 10_000, ..Default::default() },
        identity.clone(),
        installer,
    ));
    flows.poll_once().await;

    let detector = AnomalyDetector::new(AnomalyConfig::default(), identity, flows);
    let event = detector.evaluate("DEV_1", 3600).await.unwrap().expect("expected an anomaly event");
    assert_eq!(event.anomaly_type, iot_zt_core::types::AnomalyType::Dos);
    assert_eq!(event.severity, iot_zt_core::types::Severity::High);
    assert!(event.score >= 50);
}

#[tokio::test]
async fn s5_trust_cascade_suspicious_then_untrusted() {
    let identity = Arc::new(IdentityStore::open_in_memory().await.unwrap());
    identity.add_device("DEV_1", MAC, None, None, "sensor", "", None).await.unwrap();

    let installer = Arc::new(RecordingInstaller(tokio::sync::Mutex::new(Vec::new())));
    let policy = Arc::new(PolicyAdapter::new(identity.clone(), installer.clone() as Arc<dyn RuleInstaller>));
    let trust = Arc::new(TrustScorer::new(70, identity));
    trust.register_listener(policy.clone() as Arc<dyn iot_zt_core::trust::TrustChangeListener>).await;

    let (_, new) = trust.security_alert("DEV_1", iot_zt_core::types::Severity::High).await.unwrap();
    assert_eq!(new, 30);
    assert_eq!(installer.0.lock().await.last().unwrap().1, PolicyAction::Deny);

    let (_, new) = trust.security_alert("DEV_1", iot_zt_core::types::Severity::High).await.unwrap();
    assert_eq!(new, 0);
    assert_eq!(installer.0.lock().await.last().unwrap().1, PolicyAction::Quarantine);
}

struct RecordingInstaller(tokio::sync::Mutex<Vec<(iot_zt_core::types::DeviceId, PolicyAction)>>);

#[async_trait::async_trait]
impl RuleInstaller for RecordingInstaller {
    async fn install(
        &self,
        device_id: &iot_zt_core::types::DeviceId,
        action: PolicyAction,
        _: &iot_zt_core::types::MatchFields,
        _: Option<u32>,
        _: Option<u64>,
    ) -> iot_zt_core::error::Result<()> {
        self.0.lock().await.push((device_id.clone(), action));
        Ok(())
    }
    async fn remove(&self, _: &iot_zt_core::types::DeviceId) -> iot_zt_core::error::Result<()> {
        Ok(())
    }
    async fn query_flows(&self, _switch_id: &str) -> iot_zt_core::error::Result<Vec<FlowQuerySample>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn s6_persistence_across_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let identity_db = tmp.path().join("identity.db");
    let pending_db = tmp.path().join("pending.db");
    let cert_dir = tmp.path().join("certs");

    // First "run": onboard D1, dock its trust to 42 via one medium-severity alert.
    {
        let identity = Arc::new(IdentityStore::open(identity_db.to_str().unwrap()).await.unwrap());
        let pending = Arc::new(PendingQueue::open(pending_db.to_str().unwrap()).await.unwrap());
        let ca = Arc::new(CertificateAuthority::open(&cert_dir).await.unwrap());
        let profiler = Arc::new(BehavioralProfiler::new(ProfilingConfig::default(), identity.clone()));

        let admission = AdmissionService::new(
            Default::default(),
            identity.clone(),
            pending.clone(),
            ca,
            profiler,
            Arc::new(NullLinkLayerEventSource),
        );
        pending.enqueue(&MAC.to_string(), "DEV_AA_BB_CC_D00001", None, None).await.unwrap();
        let device_id = admission.approve_and_onboard(&MAC.to_string(), None).await.unwrap();

        let trust = TrustScorer::new(70, identity.clone());
        trust.hydrate().await.unwrap();
        // One medium-severity alert docks 20 points (spec §4.8 delta table): 70 -> 50.
        let (_, new) = trust.security_alert(&device_id, iot_zt_core::types::Severity::Medium).await.unwrap();
        assert_eq!(new, 50);
    }

    // "Restart": reopen the same stores fresh.
    let identity = Arc::new(IdentityStore::open(identity_db.to_str().unwrap()).await.unwrap());
    let pending = Arc::new(PendingQueue::open(pending_db.to_str().unwrap()).await.unwrap());
    let ca = Arc::new(CertificateAuthority::open(&cert_dir).await.unwrap());

    assert!(pending.list_pending().await.unwrap().is_empty());

    let device = identity.get_device_by_mac(&MAC.to_string()).await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Active);
    assert_eq!(device.trust_score, 50);

    // P1 (spec §): active devices keep a verifiable credential across a restart.
    let cert_ref = device.cert_ref.clone().expect("onboarded device has a cert_ref");
    assert!(ca.verify(&cert_ref).await.unwrap());

    let trust = TrustScorer::new(70, identity.clone());
    trust.hydrate().await.unwrap();
    assert_eq!(trust.get(&device.device_id).await, 50);
}

#[tokio::test]
async fn attestation_and_orchestrator_compose_for_a_revoked_device() {
    let identity = Arc::new(IdentityStore::open_in_memory().await.unwrap());
    let tmp = tempfile::tempdir().unwrap();
    let ca = Arc::new(CertificateAuthority::open(tmp.path()).await.unwrap());
    let (cert_ref, key_ref) = ca.issue("DEV_1", MAC, None).await.unwrap();
    identity.add_device("DEV_1", MAC, Some(&cert_ref), Some(&key_ref), "sensor", "", None).await.unwrap();

    let trust = Arc::new(TrustScorer::new(70, identity.clone()));
    let scheduler = AttestationScheduler::new(
        AttestationConfig { tick_interval: std::time::Duration::from_secs(300) },
        identity.clone(),
        ca.clone(),
        trust.clone(),
    );
    scheduler.record_heartbeat("DEV_1");
    ca.revoke(&identity, "DEV_1").await.unwrap();

    let passed = scheduler.tick("DEV_1").await.unwrap();
    assert!(!passed);
    assert_eq!(trust.get("DEV_1").await, 50);

    let flows = Arc::new(FlowAggregator::new(FlowAggregatorConfig::default(), identity.clone(), Arc::new(NullRuleInstaller)));
    let anomaly = Arc::new(AnomalyDetector::new(AnomalyConfig::default(), identity.clone(), flows));
    let orchestrator = TrafficOrchestrator::new(identity, trust, anomaly, Arc::new(NullRuleInstaller));
    let action = orchestrator.decide("DEV_1", None).await.unwrap();
    assert_eq!(action, PolicyAction::Redirect);
}
