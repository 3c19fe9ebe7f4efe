//! Session & Token Manager (C12): issues short-lived opaque session tokens
//! to authenticated devices, enforces a sliding-window rate limit and a
//! maintenance-window block (spec §4.12).

use crate::admission::PendingQueue;
use crate::attestation::AttestationScheduler;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::identity::IdentityStore;
use crate::mac;
use crate::types::{DeviceId, DeviceStatus, Mac, PendingStatus};
use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

struct SessionRecord {
    token: String,
    last_activity: DateTime<Utc>,
}

pub struct SessionManager {
    config: SessionConfig,
    identity: Arc<IdentityStore>,
    pending: Arc<PendingQueue>,
    static_allow_list: HashSet<DeviceId>,
    sessions: DashMap<DeviceId, SessionRecord>,
    rate_windows: DashMap<DeviceId, Mutex<VecDeque<DateTime<Utc>>>>,
    attestation: Option<Arc<AttestationScheduler>>,
}

impl SessionManager {
    /// `attestation` is the heartbeat sink (spec §5): C9 reads the latest
    /// activity timestamp this component observes as its freshness signal
    /// when no dedicated heartbeat channel exists. `None` in tests that don't
    /// need attestation wired in.
    pub fn new(
        config: SessionConfig,
        identity: Arc<IdentityStore>,
        pending: Arc<PendingQueue>,
        static_allow_list: HashSet<DeviceId>,
        attestation: Option<Arc<AttestationScheduler>>,
    ) -> Self {
        Self {
            config,
            identity,
            pending,
            static_allow_list,
            sessions: DashMap::new(),
            rate_windows: DashMap::new(),
            attestation,
        }
    }

    /// Issue a 128-bit opaque token for `device_id`/`mac` (spec §4.12).
    /// Rejects unless the device is active, on the static allow-list, has an
    /// approved pending row for `mac`, or insecure auto-auth is enabled and
    /// `mac` is well-formed.
    pub async fn issue(&self, device_id: &str, mac: &Mac) -> Result<String> {
        if !self.is_authorized_for_issue(device_id, mac).await? {
            return Err(Error::Authz {
                reason: "unknown_device".to_string(),
            });
        }

        let token = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(
            device_id.to_string(),
            SessionRecord {
                token: token.clone(),
                last_activity: Utc::now(),
            },
        );
        Ok(token)
    }

    async fn is_authorized_for_issue(&self, device_id: &str, mac: &Mac) -> Result<bool> {
        if let Ok(device) = self.identity.get_device(device_id).await {
            if device.status == DeviceStatus::Active {
                return Ok(true);
            }
        }
        if self.static_allow_list.contains(device_id) {
            return Ok(true);
        }
        if let Some(row) = self.pending.get_by_mac(mac).await? {
            if row.status == PendingStatus::Approved {
                return Ok(true);
            }
        }
        if self.config.allow_insecure_auto_auth && mac::is_canonical(mac) {
            tracing::warn!(device_id, %mac, "insecure auto-auth admitted an unregistered device");
            return Ok(true);
        }
        Ok(false)
    }

    /// Authenticate a token, refreshing `last_activity` on success (spec §4.12).
    pub async fn authenticate(&self, device_id: &str, token: &str) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(device_id)
            .ok_or_else(|| Error::Authz { reason: "no_session".to_string() })?;

        if session.token != token {
            return Err(Error::Authz { reason: "token_mismatch".to_string() });
        }
        if Utc::now().signed_duration_since(session.last_activity) > chrono_ttl(self.config.ttl) {
            return Err(Error::Authz { reason: "session_expired".to_string() });
        }
        session.last_activity = Utc::now();
        drop(session);

        if let Some(attestation) = &self.attestation {
            attestation.record_heartbeat(device_id);
        }
        Ok(())
    }

    /// Accept one data submission: maintenance window, then authentication,
    /// then the per-device sliding-window rate limit (spec §4.12).
    pub async fn submit_data(&self, device_id: &str, token: &str) -> Result<()> {
        if self.in_maintenance_window() {
            return Err(Error::Authz { reason: "maintenance_window".to_string() });
        }
        self.authenticate(device_id, token).await?;
        self.check_rate_limit(device_id).await
    }

    async fn check_rate_limit(&self, device_id: &str) -> Result<()> {
        let entry = self
            .rate_windows
            .entry(device_id.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut window = entry.lock().await;

        let now = Utc::now();
        let cutoff = now - chrono_ttl(self.config.rate_limit_window);
        while matches!(window.front(), Some(t) if *t < cutoff) {
            window.pop_front();
        }

        if window.len() as u32 >= self.config.rate_limit_packets {
            return Err(Error::Authz { reason: "rate_limit_exceeded".to_string() });
        }
        window.push_back(now);
        Ok(())
    }

    fn in_maintenance_window(&self) -> bool {
        let Some((start, end)) = self.config.maintenance_window else {
            return false;
        };
        let hour = Utc::now().hour();
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}

fn chrono_ttl(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}
