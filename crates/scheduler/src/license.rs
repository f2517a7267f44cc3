//! Signed-license verification and the CPU-MHz admission gate.
//!
//! The license file is JSON: a `license` object
//! (`{cpuMhzLimit, expiryDate, boltLicenseKey}`) and a base64
//! `signature` — RSA PKCS#1 v1.5 / SHA-256 over the canonical (compact,
//! sorted-key) JSON of the `license` object. Before every job
//! submission the gate re-reads the file, verifies the signature against
//! the embedded public key, checks expiry, and checks that running
//! allocations plus the new request stay under `cpuMhzLimit`.

use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::{DateTime, Utc};
use rsa::pkcs8::DecodePublicKey;
use rsa::Pkcs1v15Sign;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use mb_domain::error::{Error, Result};

use crate::client::SchedulerClient;

const EMBEDDED_PUBLIC_KEY: &str = include_str!("../public_key.pem");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseInfo {
    #[serde(rename = "cpuMhzLimit")]
    pub cpu_mhz_limit: String,
    #[serde(rename = "expiryDate")]
    pub expiry_date: DateTime<Utc>,
    #[serde(rename = "boltLicenseKey")]
    pub bolt_license_key: String,
}

impl LicenseInfo {
    pub fn cpu_limit(&self) -> Result<u64> {
        self.cpu_mhz_limit
            .parse()
            .map_err(|_| Error::Internal(format!("license cpuMhzLimit is not a number: {}", self.cpu_mhz_limit)))
    }
}

#[derive(Debug, Deserialize)]
struct LicenseFile {
    license: serde_json::Value,
    signature: String,
}

/// Compact JSON with lexicographically ordered keys — the byte string
/// the license generator signs.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

pub struct LicenseGate {
    license_path: PathBuf,
    public_key: rsa::RsaPublicKey,
}

impl LicenseGate {
    /// Gate using the embedded public key.
    pub fn new(license_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_public_key(license_path, EMBEDDED_PUBLIC_KEY)
    }

    pub fn with_public_key(license_path: impl Into<PathBuf>, public_key_pem: &str) -> Result<Self> {
        let public_key = rsa::RsaPublicKey::from_public_key_pem(public_key_pem)
            .map_err(|e| Error::Internal(format!("license public key: {e}")))?;
        Ok(Self {
            license_path: license_path.into(),
            public_key,
        })
    }

    /// Read and verify the license file: signature, then expiry.
    pub fn verify(&self) -> Result<LicenseInfo> {
        let file = read_license_file(&self.license_path)?;
        let signature = base64::engine::general_purpose::STANDARD
            .decode(&file.signature)
            .map_err(|e| Error::Internal(format!("license signature is not base64: {e}")))?;

        let canonical = canonical_json(&file.license);
        let digest = Sha256::digest(canonical.as_bytes());
        self.public_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
            .map_err(|_| Error::Internal("license signature verification failed".into()))?;

        let info: LicenseInfo = serde_json::from_value(file.license)
            .map_err(|e| Error::Internal(format!("license payload: {e}")))?;
        if info.expiry_date <= Utc::now() {
            return Err(Error::Internal(format!(
                "license expired at {}",
                info.expiry_date
            )));
        }
        Ok(info)
    }

    /// Admission check before a job submission: running allocations plus
    /// the new request must stay within the licensed CPU budget.
    pub async fn admit(
        &self,
        scheduler: &dyn SchedulerClient,
        requested_cpu_mhz: u64,
    ) -> Result<LicenseInfo> {
        let info = self.verify()?;
        let limit = info.cpu_limit()?;
        let used: u64 = scheduler
            .list_allocations()
            .await?
            .iter()
            .filter(|a| a.is_running())
            .map(|a| a.total_cpu_mhz())
            .sum();
        if used + requested_cpu_mhz > limit {
            return Err(Error::LicenseExhausted(format!(
                "cpu budget exceeded: {used} MHz running + {requested_cpu_mhz} MHz requested > {limit} MHz licensed"
            )));
        }
        Ok(info)
    }
}

fn read_license_file(path: &Path) -> Result<LicenseFile> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Internal(format!("cannot read license {}: {e}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Internal(format!("license file is not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockScheduler;
    use rsa::pkcs8::DecodePrivateKey;

    const TEST_PRIVATE_KEY: &str = include_str!("../tests/data/test_private_key.pem");
    const TEST_PUBLIC_KEY: &str = include_str!("../tests/data/test_public_key.pem");

    fn sign_license(license: &serde_json::Value) -> String {
        let key = rsa::RsaPrivateKey::from_pkcs8_pem(TEST_PRIVATE_KEY).unwrap();
        let digest = Sha256::digest(canonical_json(license).as_bytes());
        let signature = key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap();
        base64::engine::general_purpose::STANDARD.encode(signature)
    }

    fn write_license(dir: &Path, cpu_limit: &str, expiry: DateTime<Utc>) -> PathBuf {
        let license = serde_json::json!({
            "cpuMhzLimit": cpu_limit,
            "expiryDate": expiry.to_rfc3339(),
            "boltLicenseKey": "test-key",
        });
        let file = serde_json::json!({
            "license": license,
            "signature": sign_license(&license),
        });
        let path = dir.join("license.json");
        std::fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();
        path
    }

    fn future() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::days(30)
    }

    #[test]
    fn valid_license_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_license(dir.path(), "4000", future());
        let gate = LicenseGate::with_public_key(path, TEST_PUBLIC_KEY).unwrap();
        let info = gate.verify().unwrap();
        assert_eq!(info.cpu_limit().unwrap(), 4000);
    }

    #[test]
    fn tampered_license_fails_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_license(dir.path(), "4000", future());
        let mut doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        doc["license"]["cpuMhzLimit"] = serde_json::json!("999999");
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let gate = LicenseGate::with_public_key(path, TEST_PUBLIC_KEY).unwrap();
        let err = gate.verify().unwrap_err();
        assert!(err.to_string().contains("signature"));
    }

    #[test]
    fn expired_license_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_license(dir.path(), "4000", Utc::now() - chrono::Duration::days(1));
        let gate = LicenseGate::with_public_key(path, TEST_PUBLIC_KEY).unwrap();
        let err = gate.verify().unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn admission_enforces_cpu_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_license(dir.path(), "1000", future());
        let gate = LicenseGate::with_public_key(path, TEST_PUBLIC_KEY).unwrap();

        let scheduler = MockScheduler::new();
        scheduler.set_running_allocation("deployment-a", 900);

        // 900 running + 500 requested > 1000 licensed.
        let err = gate.admit(&scheduler, 500).await.unwrap_err();
        assert!(err.to_string().starts_with("license_exhausted"));

        // A 100 MHz job still fits.
        gate.admit(&scheduler, 100).await.unwrap();
    }

    #[test]
    fn canonical_json_sorts_keys_compactly() {
        let value = serde_json::json!({"b": 1, "a": {"d": [1, 2], "c": "x"}});
        assert_eq!(canonical_json(&value), r#"{"a":{"c":"x","d":[1,2]},"b":1}"#);
    }
}
