//! Certificate Authority (C2): self-managed issuance and verification of
//! per-device X.509 credentials (spec §4.2).
//!
//! Unlike the teacher's placeholder "sign a string with Ed25519" certificate,
//! this issues real X.509 via `rcgen`, matching the corpus's preference for
//! the x509/rcgen family of crates over hand-rolled ASN.1. Chain validation
//! stays at the teacher's level of rigor (membership + revocation + validity
//! window, no OCSP/CRL) since the spec explicitly scopes that out for a LAN
//! deployment.

use crate::error::{retry_once, Error, Result};
use crate::identity::IdentityStore;
use crate::types::DeviceStatus;
use rcgen::{
    BasicConstraints, Certificate as RcgenCertificate, CertificateParams, DistinguishedName,
    DnType, IsCa, KeyPair, SanType,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::RwLock;

const CA_VALIDITY_DAYS: i64 = 3650;
const DEFAULT_DEVICE_VALIDITY_DAYS: i64 = 365;

/// Metadata about one issued device credential, kept in memory for fast
/// verification (spec §4.2: membership + validity-window check).
#[derive(Debug, Clone)]
struct IssuedCert {
    mac: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    revoked: bool,
}

/// On-disk shape of one `issued_index.json` row. Kept separate from
/// `IssuedCert` so the runtime struct can use `OffsetDateTime` while the
/// sidecar sticks to plain rfc3339 strings.
///
/// The original `certificate_manager.py::verify_certificate` is stateless and
/// re-reads the cert PEM from disk on every call; this crate's stack has no
/// X.509 parser to recover validity windows from a leaf PEM, so a small
/// sidecar index is used instead to rehydrate `issued` on restart (see
/// DESIGN.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    device_id: String,
    mac: String,
    not_before: String,
    not_after: String,
    revoked: bool,
}

fn index_path(base_dir: &Path) -> PathBuf {
    base_dir.join("issued_index.json")
}

async fn load_index(base_dir: &Path) -> Result<HashMap<String, IssuedCert>> {
    let path = index_path(base_dir);
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = retry_once(|| async {
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Storage(e.to_string()))
    })
    .await?;
    let entries: Vec<IndexEntry> = serde_json::from_str(&raw)
        .map_err(|e| Error::Storage(format!("issued_index.json malformed: {e}")))?;

    let mut issued = HashMap::with_capacity(entries.len());
    for entry in entries {
        let not_before = OffsetDateTime::parse(&entry.not_before, &Rfc3339)
            .map_err(|e| Error::Storage(format!("issued_index.json malformed timestamp: {e}")))?;
        let not_after = OffsetDateTime::parse(&entry.not_after, &Rfc3339)
            .map_err(|e| Error::Storage(format!("issued_index.json malformed timestamp: {e}")))?;
        issued.insert(
            entry.device_id,
            IssuedCert {
                mac: entry.mac,
                not_before,
                not_after,
                revoked: entry.revoked,
            },
        );
    }
    Ok(issued)
}

async fn persist_index(base_dir: &Path, issued: &HashMap<String, IssuedCert>) -> Result<()> {
    let mut entries = Vec::with_capacity(issued.len());
    for (device_id, cert) in issued {
        entries.push(IndexEntry {
            device_id: device_id.clone(),
            mac: cert.mac.clone(),
            not_before: cert
                .not_before
                .format(&Rfc3339)
                .map_err(|e| Error::Storage(e.to_string()))?,
            not_after: cert
                .not_after
                .format(&Rfc3339)
                .map_err(|e| Error::Storage(e.to_string()))?,
            revoked: cert.revoked,
        });
    }
    let raw = serde_json::to_string(&entries)
        .map_err(|e| Error::Storage(format!("failed to serialize issued_index.json: {e}")))?;
    let path = index_path(base_dir);
    retry_once(|| async {
        tokio::fs::write(&path, &raw)
            .await
            .map_err(|e| Error::Storage(e.to_string()))
    })
    .await
}

/// Self-managed certificate authority rooted at `base_dir`.
pub struct CertificateAuthority {
    base_dir: PathBuf,
    ca_signer: RcgenCertificate,
    issued: Arc<RwLock<HashMap<String, IssuedCert>>>,
}

impl CertificateAuthority {
    /// Open (generating if absent) the CA material under `base_dir`.
    /// Rejects startup if key material exists but is unreadable or malformed
    /// (spec §4.2).
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        retry_once(|| async {
            tokio::fs::create_dir_all(&base_dir)
                .await
                .map_err(|e| Error::Storage(e.to_string()))
        })
        .await?;
        retry_once(|| async {
            tokio::fs::create_dir_all(base_dir.join("devices"))
                .await
                .map_err(|e| Error::Storage(e.to_string()))
        })
        .await?;

        let ca_cert_path = base_dir.join("ca_cert.pem");
        let ca_key_path = base_dir.join("ca_key.pem");

        let ca_signer = if ca_cert_path.exists() || ca_key_path.exists() {
            let cert_pem = retry_once(|| async {
                tokio::fs::read_to_string(&ca_cert_path)
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))
            })
            .await
            .map_err(|e| Error::Security(format!("CA certificate unreadable: {e}")))?;
            let key_pem = retry_once(|| async {
                tokio::fs::read_to_string(&ca_key_path)
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))
            })
            .await
            .map_err(|e| Error::Security(format!("CA key unreadable: {e}")))?;
            let key_pair = KeyPair::from_pem(&key_pem)
                .map_err(|e| Error::Security(format!("CA key malformed: {e}")))?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)
                .map_err(|e| Error::Security(format!("CA certificate malformed: {e}")))?;
            RcgenCertificate::from_params(params)
                .map_err(|e| Error::Security(format!("failed to load CA: {e}")))?
        } else {
            let signer = generate_ca()?;
            let cert_pem = signer
                .serialize_pem()
                .map_err(|e| Error::Security(e.to_string()))?;
            retry_once(|| async {
                tokio::fs::write(&ca_cert_path, &cert_pem)
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))
            })
            .await?;
            let key_pem = signer.serialize_private_key_pem();
            retry_once(|| async {
                tokio::fs::write(&ca_key_path, &key_pem)
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))
            })
            .await?;
            tracing::info!("generated new self-signed CA at {}", base_dir.display());
            signer
        };

        let issued = load_index(&base_dir).await?;

        Ok(Self {
            base_dir,
            ca_signer,
            issued: Arc::new(RwLock::new(issued)),
        })
    }

    /// Issue a leaf credential for `device_id`/`mac`, signed by this CA.
    /// Returns `(cert_ref, key_ref)` — stable file paths suitable for
    /// [`crate::types::Device::cert_ref`]/`key_ref`.
    pub async fn issue(
        &self,
        device_id: &str,
        mac: &str,
        validity_days: Option<i64>,
    ) -> Result<(String, String)> {
        let validity_days = validity_days.unwrap_or(DEFAULT_DEVICE_VALIDITY_DAYS);
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + TimeDuration::days(validity_days);

        let mut params = CertificateParams::new(vec![mac.to_string()]);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, device_id);
        dn.push(DnType::OrganizationName, "iot-zt-core");
        params.distinguished_name = dn;
        params.not_before = not_before;
        params.not_after = not_after;
        params.is_ca = IsCa::NoCa;
        params.subject_alt_names = vec![SanType::DnsName(device_id.to_string())];

        let leaf = RcgenCertificate::from_params(params)
            .map_err(|e| Error::Security(format!("failed to build leaf certificate: {e}")))?;

        let cert_pem = leaf
            .serialize_pem_with_signer(&self.ca_signer)
            .map_err(|e| Error::Security(format!("failed to sign certificate: {e}")))?;
        let key_pem = leaf.serialize_private_key_pem();

        let cert_path = self.base_dir.join("devices").join(format!("{device_id}.cert.pem"));
        let key_path = self.base_dir.join("devices").join(format!("{device_id}.key.pem"));

        retry_once(|| async {
            tokio::fs::write(&cert_path, &cert_pem)
                .await
                .map_err(|e| Error::Storage(e.to_string()))
        })
        .await?;
        retry_once(|| async {
            tokio::fs::write(&key_path, &key_pem)
                .await
                .map_err(|e| Error::Storage(e.to_string()))
        })
        .await?;

        let mut issued = self.issued.write().await;
        issued.insert(
            device_id.to_string(),
            IssuedCert {
                mac: mac.to_string(),
                not_before,
                not_after,
                revoked: false,
            },
        );
        persist_index(&self.base_dir, &issued).await?;
        drop(issued);

        tracing::info!(device_id, "issued device credential");

        Ok((
            cert_path.to_string_lossy().to_string(),
            key_path.to_string_lossy().to_string(),
        ))
    }

    /// Verify that `cert_ref` (a `cert_ref` path as returned by [`Self::issue`])
    /// names an unrevoked credential currently within its validity window.
    pub async fn verify(&self, cert_ref: &str) -> Result<bool> {
        let device_id = device_id_from_cert_ref(cert_ref);
        let issued = self.issued.read().await;
        let Some(entry) = issued.get(&device_id) else {
            return Ok(false);
        };
        if entry.revoked {
            return Ok(false);
        }
        let now = OffsetDateTime::now_utc();
        Ok(entry.not_before <= now && now < entry.not_after)
    }

    /// Delete persisted credential material and mark the device `revoked` in
    /// the identity store (spec §4.2).
    pub async fn revoke(&self, identity: &IdentityStore, device_id: &str) -> Result<()> {
        let cert_path = self.base_dir.join("devices").join(format!("{device_id}.cert.pem"));
        let key_path = self.base_dir.join("devices").join(format!("{device_id}.key.pem"));
        let _ = tokio::fs::remove_file(&cert_path).await;
        let _ = tokio::fs::remove_file(&key_path).await;

        let mut issued = self.issued.write().await;
        if let Some(entry) = issued.get_mut(device_id) {
            entry.revoked = true;
        }
        persist_index(&self.base_dir, &issued).await?;
        drop(issued);

        identity.update_status(device_id, DeviceStatus::Revoked).await?;
        tracing::warn!(device_id, "revoked device credential");
        Ok(())
    }
}

fn generate_ca() -> Result<RcgenCertificate> {
    let mut params = CertificateParams::new(Vec::new());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "iot-zt-core Root CA");
    dn.push(DnType::OrganizationName, "iot-zt-core");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + TimeDuration::days(CA_VALIDITY_DAYS);

    RcgenCertificate::from_params(params)
        .map_err(|e| Error::Security(format!("failed to generate CA: {e}")))
}

fn device_id_from_cert_ref(cert_ref: &str) -> String {
    Path::new(cert_ref)
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_suffix(".cert"))
        .unwrap_or(cert_ref)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityStore;

    #[tokio::test]
    async fn issue_then_verify_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::open(tmp.path()).await.unwrap();
        let (cert_ref, key_ref) = ca.issue("DEV_AA_BB_CC_ABC123", "AA:BB:CC:00:00:01", None).await.unwrap();
        assert!(tokio::fs::metadata(&cert_ref).await.is_ok());
        assert!(tokio::fs::metadata(&key_ref).await.is_ok());
        assert!(ca.verify(&cert_ref).await.unwrap());
    }

    #[tokio::test]
    async fn revoke_invalidates_and_marks_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::open(tmp.path()).await.unwrap();
        let identity = IdentityStore::open_in_memory().await.unwrap();
        identity
            .add_device("DEV_AA_BB_CC_ABC123", "AA:BB:CC:00:00:01", None, None, "sensor", "", None)
            .await
            .unwrap();

        let (cert_ref, _) = ca.issue("DEV_AA_BB_CC_ABC123", "AA:BB:CC:00:00:01", None).await.unwrap();
        ca.revoke(&identity, "DEV_AA_BB_CC_ABC123").await.unwrap();

        assert!(!ca.verify(&cert_ref).await.unwrap());
        assert!(tokio::fs::metadata(&cert_ref).await.is_err());
        let device = identity.get_device("DEV_AA_BB_CC_ABC123").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Revoked);
    }

    #[tokio::test]
    async fn unknown_cert_ref_fails_verification() {
        let tmp = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::open(tmp.path()).await.unwrap();
        assert!(!ca.verify("/nonexistent/DEV_X.cert.pem").await.unwrap());
    }

    #[tokio::test]
    async fn reopening_existing_ca_reuses_material() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let ca = CertificateAuthority::open(tmp.path()).await.unwrap();
            ca.issue("DEV_AA_BB_CC_ABC123", "AA:BB:CC:00:00:01", None).await.unwrap();
        }
        let ca2 = CertificateAuthority::open(tmp.path()).await.unwrap();
        let (cert_ref, _) = ca2.issue("DEV_AA_BB_CC_DEF456", "AA:BB:CC:00:00:02", None).await.unwrap();
        assert!(ca2.verify(&cert_ref).await.unwrap());
    }

    #[tokio::test]
    async fn cert_issued_before_restart_still_verifies_after() {
        let tmp = tempfile::tempdir().unwrap();
        let cert_ref = {
            let ca = CertificateAuthority::open(tmp.path()).await.unwrap();
            let (cert_ref, _) = ca.issue("DEV_AA_BB_CC_ABC123", "AA:BB:CC:00:00:01", None).await.unwrap();
            assert!(ca.verify(&cert_ref).await.unwrap());
            cert_ref
        };

        let ca2 = CertificateAuthority::open(tmp.path()).await.unwrap();
        assert!(ca2.verify(&cert_ref).await.unwrap());
    }

    #[tokio::test]
    async fn revocation_survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let identity = IdentityStore::open_in_memory().await.unwrap();
        identity
            .add_device("DEV_AA_BB_CC_ABC123", "AA:BB:CC:00:00:01", None, None, "sensor", "", None)
            .await
            .unwrap();

        let cert_ref = {
            let ca = CertificateAuthority::open(tmp.path()).await.unwrap();
            let (cert_ref, _) = ca.issue("DEV_AA_BB_CC_ABC123", "AA:BB:CC:00:00:01", None).await.unwrap();
            ca.revoke(&identity, "DEV_AA_BB_CC_ABC123").await.unwrap();
            cert_ref
        };

        let ca2 = CertificateAuthority::open(tmp.path()).await.unwrap();
        assert!(!ca2.verify(&cert_ref).await.unwrap());
    }
}
