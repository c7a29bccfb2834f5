//! Entitlement check consulted once before a run starts.
//!
//! The gate is keyed by a stable machine identifier. A run may only start when
//! the gate answers, the record says `active`, and its expiry (if any) lies in
//! the future. Anything else denies.

use crate::error::{HarvestError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationStatus {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ActivationStatus {
    pub fn active() -> Self {
        Self {
            active: true,
            expires_at: None,
        }
    }

    pub fn inactive() -> Self {
        Self {
            active: false,
            expires_at: None,
        }
    }

    /// Builds a status from a stored license record. An expiry that cannot
    /// be read is treated as absent.
    pub fn from_record(active: bool, expires_at: Option<&str>) -> Self {
        Self {
            active,
            expires_at: expires_at.and_then(parse_expiry),
        }
    }

    pub fn permits(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map_or(true, |expiry| expiry > now)
    }
}

/// Accepts RFC 3339 or a naive ISO timestamp (read as UTC).
fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    match NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(naive) => Some(naive.and_utc()),
        Err(_) => {
            warn!("Ignoring unreadable license expiry '{}'", raw);
            None
        }
    }
}

#[async_trait]
pub trait ActivationGate: Send + Sync {
    async fn check(&self, machine_id: &str) -> Result<ActivationStatus>;

    /// Records that the machine used its entitlement. Failures are ignored
    /// by callers.
    async fn record_use(&self, _machine_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Gate with a fixed answer, for offline use and tests.
#[derive(Debug, Clone)]
pub struct StaticGate(pub ActivationStatus);

#[async_trait]
impl ActivationGate for StaticGate {
    async fn check(&self, _machine_id: &str) -> Result<ActivationStatus> {
        Ok(self.0.clone())
    }
}

/// Consults the gate and turns every non-permitting answer into
/// [`HarvestError::ActivationDenied`].
pub async fn ensure_active(gate: &dyn ActivationGate, machine_id: &str) -> Result<ActivationStatus> {
    let status = gate
        .check(machine_id)
        .await
        .map_err(|e| HarvestError::ActivationDenied(format!("check failed for {}: {}", machine_id, e)))?;

    if !status.active {
        return Err(HarvestError::ActivationDenied(format!(
            "license inactive for machine {}",
            machine_id
        )));
    }
    if !status.permits(Utc::now()) {
        return Err(HarvestError::ActivationDenied(format!(
            "license for machine {} expired",
            machine_id
        )));
    }

    if let Err(e) = gate.record_use(machine_id).await {
        debug!("Could not record license use: {}", e);
    }
    info!("Activation confirmed for machine {}", machine_id);
    Ok(status)
}

/// SHA-256 (hex) of host name, architecture, user name and OS.
pub fn machine_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .unwrap_or_default();
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();

    machine_id_from(&host, std::env::consts::ARCH, &user, std::env::consts::OS)
}

fn machine_id_from(host: &str, arch: &str, user: &str, os: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}-{}-{}-{}", host, arch, user, os).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(feature = "http-gate")]
pub use http::HttpActivationGate;

#[cfg(feature = "http-gate")]
mod http {
    use super::*;
    use reqwest::{Client, StatusCode};
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct LicenseRecord {
        #[serde(default)]
        active: bool,
        expires_at: Option<String>,
    }

    /// License records stored as JSON documents under
    /// `{base_url}/licenses/{machine_id}.json`.
    #[derive(Clone)]
    pub struct HttpActivationGate {
        client: Client,
        base_url: String,
    }

    impl HttpActivationGate {
        pub fn new(base_url: impl Into<String>) -> Result<Self> {
            let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
            Ok(Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
            })
        }
    }

    #[async_trait]
    impl ActivationGate for HttpActivationGate {
        async fn check(&self, machine_id: &str) -> Result<ActivationStatus> {
            let url = format!("{}/licenses/{}.json", self.base_url, machine_id);
            let res = self.client.get(&url).send().await?;
            let status = res.status();

            if status == StatusCode::NOT_FOUND {
                return Ok(ActivationStatus::inactive());
            }
            if !status.is_success() {
                let err_text = res.text().await?;
                return Err(HarvestError::ActivationDenied(format!(
                    "license server error (status {}): {}",
                    status, err_text
                )));
            }

            // An unregistered machine comes back as a JSON `null`.
            let record: Option<LicenseRecord> = res.json().await?;
            Ok(match record {
                Some(r) => ActivationStatus::from_record(r.active, r.expires_at.as_deref()),
                None => ActivationStatus::inactive(),
            })
        }

        async fn record_use(&self, machine_id: &str) -> Result<()> {
            let url = format!("{}/licenses/{}/last_used.json", self.base_url, machine_id);
            self.client
                .put(&url)
                .json(&Utc::now().to_rfc3339())
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        }
    }
}
