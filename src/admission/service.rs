//! Admission Service (C4): watches link-layer events, generates device ids,
//! funnels candidates into C3, and drives onboarding through C2 + C1 + C5 on
//! operator approval (spec §4.4).

use super::queue::{EnqueueOutcome, PendingQueue};
use crate::ca::CertificateAuthority;
use crate::config::AdmissionConfig;
use crate::error::{Error, Result};
use crate::identity::IdentityStore;
use crate::mac;
use crate::profiling::BehavioralProfiler;
use crate::types::{DeviceId, Mac, PendingStatus};
use async_trait::async_trait;
use dashmap::DashSet;
use rand::Rng;
use std::sync::Arc;

const DEVICE_ID_ATTEMPTS: usize = 100;
const SUFFIX_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// One candidate MAC observed on the link layer.
#[derive(Debug, Clone)]
pub struct ObservedMac {
    pub mac: String,
    pub device_type: Option<String>,
    pub device_info: Option<String>,
}

/// Source of newly observed link-layer associations: a hostapd-style
/// association log or an ARP-table fallback (spec §4.4). Out of scope beyond
/// this contract, so modeled as a capability with a null default like the
/// spec §6 collaborators.
#[async_trait]
pub trait LinkLayerEventSource: Send + Sync {
    async fn observed_macs(&self) -> Result<Vec<ObservedMac>>;
}

/// Used when no association-log or ARP source is configured.
#[derive(Debug, Default)]
pub struct NullLinkLayerEventSource;

#[async_trait]
impl LinkLayerEventSource for NullLinkLayerEventSource {
    async fn observed_macs(&self) -> Result<Vec<ObservedMac>> {
        Ok(Vec::new())
    }
}

pub struct AdmissionService {
    #[allow(dead_code)]
    config: AdmissionConfig,
    identity: Arc<IdentityStore>,
    pending: Arc<PendingQueue>,
    ca: Arc<CertificateAuthority>,
    profiler: Arc<BehavioralProfiler>,
    event_source: Arc<dyn LinkLayerEventSource>,
    known_macs: DashSet<Mac>,
}

impl AdmissionService {
    pub fn new(
        config: AdmissionConfig,
        identity: Arc<IdentityStore>,
        pending: Arc<PendingQueue>,
        ca: Arc<CertificateAuthority>,
        profiler: Arc<BehavioralProfiler>,
        event_source: Arc<dyn LinkLayerEventSource>,
    ) -> Self {
        Self {
            config,
            identity,
            pending,
            ca,
            profiler,
            event_source,
            known_macs: DashSet::new(),
        }
    }

    /// Hydrate the local known-MAC set from C1 and C3 on startup (spec §4.4).
    pub async fn hydrate(&self) -> Result<()> {
        for device in self.identity.list_devices().await? {
            self.known_macs.insert(device.mac);
        }
        for row in self.pending.list_all(None).await? {
            if !row.status.is_terminal() {
                self.known_macs.insert(row.mac);
            }
        }
        Ok(())
    }

    /// One poll tick: observe candidate MACs, ignore known ones, generate
    /// device ids, and enqueue the rest into C3. Returns the count enqueued.
    pub async fn poll_once(&self) -> Result<usize> {
        let observed = self.event_source.observed_macs().await?;
        let mut enqueued = 0;

        for candidate in observed {
            let mac = match mac::normalize(&candidate.mac) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(mac = %candidate.mac, error = %e, "dropping malformed MAC");
                    continue;
                }
            };

            if self.known_macs.contains(&mac) {
                continue;
            }

            let device_id = self.generate_device_id(&mac).await?;
            let outcome = self
                .pending
                .enqueue(&mac, &device_id, candidate.device_type.as_deref(), candidate.device_info.as_deref())
                .await?;

            self.known_macs.insert(mac.clone());
            if outcome == EnqueueOutcome::Enqueued {
                enqueued += 1;
                tracing::info!(%mac, device_id, "new device enqueued for admission");
            }
        }

        Ok(enqueued)
    }

    /// `DEV_<first-3-octets>_<6-char-A-Z0-9>`, regenerated on collision up to
    /// 100 attempts, falling back to a timestamp suffix (spec §4.4).
    async fn generate_device_id(&self, mac: &Mac) -> Result<DeviceId> {
        let prefix = mac::prefix_octets(mac)?;

        for _ in 0..DEVICE_ID_ATTEMPTS {
            let candidate = format!("DEV_{prefix}_{}", random_suffix(6));
            if !self.device_id_in_use(&candidate).await? {
                return Ok(candidate);
            }
        }

        Ok(format!("DEV_{prefix}_{:X}", chrono::Utc::now().timestamp_millis()))
    }

    async fn device_id_in_use(&self, candidate: &str) -> Result<bool> {
        match self.identity.get_device(candidate).await {
            Ok(_) => return Ok(true),
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let in_pending = self
            .pending
            .list_all(None)
            .await?
            .iter()
            .any(|row| row.device_id_candidate == candidate);
        Ok(in_pending)
    }

    /// Drive onboarding for an approved MAC: `C2.issue → C1.add_device →
    /// C5.begin(device_id)`, then mark the C3 row onboarded (spec §4.4).
    /// Idempotent: re-onboarding an already-onboarded MAC just returns its
    /// existing device id.
    pub async fn approve_and_onboard(&self, mac: &Mac, notes: Option<&str>) -> Result<DeviceId> {
        let row = self
            .pending
            .get_by_mac(mac)
            .await?
            .ok_or_else(|| Error::NotFound(format!("pending row for {mac}")))?;

        if row.status == PendingStatus::Onboarded {
            if let Some(device) = self.identity.get_device_by_mac(mac).await? {
                return Ok(device.device_id);
            }
        }

        self.pending.approve(mac, notes).await?;

        let device_id = row.device_id_candidate.clone();
        let (cert_ref, key_ref) = self.ca.issue(&device_id, mac, None).await?;
        let device_type = row.device_type.as_deref().unwrap_or("");
        let first_seen = chrono::Utc::now();
        let fingerprint = crate::identity::derive_fingerprint(mac, device_type, first_seen);
        self.identity
            .add_device(
                &device_id,
                mac,
                Some(&cert_ref),
                Some(&key_ref),
                device_type,
                row.device_info.as_deref().unwrap_or(""),
                Some(&fingerprint),
            )
            .await?;
        self.profiler.begin(&device_id);
        self.pending.mark_onboarded(mac).await?;

        tracing::info!(%mac, device_id, "device onboarded");
        Ok(device_id)
    }

    /// Reject a pending row; no identity artifacts are created (spec §4.4).
    pub async fn reject(&self, mac: &Mac, notes: Option<&str>) -> Result<()> {
        self.pending.reject(mac, notes).await
    }
}

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}
