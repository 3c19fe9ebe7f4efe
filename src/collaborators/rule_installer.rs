//! Southbound rule-installation contract (spec §6).

use crate::error::Result;
use crate::types::{DeviceId, MatchFields, PolicyAction};
use async_trait::async_trait;

/// Flow counters returned by a switch for C6 to aggregate.
#[derive(Debug, Clone)]
pub struct FlowQuerySample {
    pub eth_src: String,
    pub destination: String,
    pub dest_port: u16,
    pub protocol: String,
    pub packets: u64,
    pub bytes: u64,
    pub duration_secs: f64,
}

/// The flow-programming layer the core drives but does not implement.
///
/// Must be idempotent per `(device_id, action, match_fields, priority)` and
/// must remove prior rules sharing a `cookie` when overwriting (spec §6).
#[async_trait]
pub trait RuleInstaller: Send + Sync {
    /// Install or overwrite a rule for `device_id`.
    async fn install(
        &self,
        device_id: &DeviceId,
        action: PolicyAction,
        match_fields: &MatchFields,
        priority: Option<u32>,
        cookie: Option<u64>,
    ) -> Result<()>;

    /// Remove all rules for `device_id`. Idempotent.
    async fn remove(&self, device_id: &DeviceId) -> Result<()>;

    /// Pull current flow counters from a switch.
    async fn query_flows(&self, switch_id: &str) -> Result<Vec<FlowQuerySample>>;
}

/// No-op installer used when the data plane is not connected.
///
/// Degrades capability per spec §7 (`CollaboratorUnavailable` is local, not
/// fatal): installs are accepted and logged but never reach hardware, and
/// flow queries return empty.
#[derive(Debug, Default)]
pub struct NullRuleInstaller;

#[async_trait]
impl RuleInstaller for NullRuleInstaller {
    async fn install(
        &self,
        device_id: &DeviceId,
        action: PolicyAction,
        _match_fields: &MatchFields,
        _priority: Option<u32>,
        _cookie: Option<u64>,
    ) -> Result<()> {
        tracing::debug!(%device_id, ?action, "null rule installer: no data plane connected");
        Ok(())
    }

    async fn remove(&self, device_id: &DeviceId) -> Result<()> {
        tracing::debug!(%device_id, "null rule installer: remove is a no-op");
        Ok(())
    }

    async fn query_flows(&self, _switch_id: &str) -> Result<Vec<FlowQuerySample>> {
        Ok(Vec::new())
    }
}
