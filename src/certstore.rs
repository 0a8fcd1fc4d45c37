//! Durable certificate store
//!
//! One JSON document holds every issued certificate:
//!
//! ```text
//! {"version":1,"certificates":{"<host>":{"hostname":..,"certificate":..,"private_key":..,"not_after":..,"issuer":..}}}
//! ```
//!
//! Writes go to a temporary file in the same directory which is then renamed
//! over the store, so a crash never leaves a half-written file behind. The
//! store contains private keys unencrypted and is created with mode 0600 on
//! Unix; keep its directory on an encrypted filesystem in production.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("certificate store path '{0}' must not contain '..'")]
    InvalidPath(String),
    #[error("I/O error on certificate store '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("certificate store '{path}' is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("certificate store version {0} is not supported")]
    UnsupportedVersion(u32),
    #[error("invalid certificate for {hostname}: {reason}")]
    InvalidCertificate { hostname: String, reason: String },
}

/// A certificate and its key as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCertificate {
    pub hostname: String,
    /// PEM chain, leaf first
    pub certificate: String,
    /// PEM private key
    pub private_key: String,
    /// Unix seconds
    pub not_after: i64,
    pub issuer: String,
}

impl StoredCertificate {
    /// Build from PEM material, reading expiry and issuer from the leaf
    pub fn from_pem(hostname: &str, certificate: &str, private_key: &str) -> Result<Self, StoreError> {
        let invalid = |reason: String| StoreError::InvalidCertificate {
            hostname: hostname.to_string(),
            reason,
        };
        let chain = parse_chain(certificate);
        let leaf = chain
            .first()
            .ok_or_else(|| invalid("no certificate in PEM".to_string()))?;
        let (not_after, issuer) = leaf_details(leaf).map_err(invalid)?;

        Ok(Self {
            hostname: hostname.to_string(),
            certificate: certificate.to_string(),
            private_key: private_key.to_string(),
            not_after,
            issuer,
        })
    }

    /// Signing material for rustls
    pub fn to_certified_key(&self) -> Result<Arc<CertifiedKey>, StoreError> {
        let invalid = |reason: String| StoreError::InvalidCertificate {
            hostname: self.hostname.clone(),
            reason,
        };
        let chain = parse_chain(&self.certificate);
        if chain.is_empty() {
            return Err(invalid("no certificate in PEM".to_string()));
        }
        let key = load_private_key(self.private_key.as_bytes())
            .ok_or_else(|| invalid("no private key in PEM".to_string()))?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| invalid(format!("unsupported private key: {}", e)))?;
        Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    certificates: BTreeMap<String, StoredCertificate>,
}

/// Certificates keyed by hostname
pub type CertificateMap = BTreeMap<String, StoredCertificate>;

/// The on-disk store
#[derive(Debug, Clone)]
pub struct CertStore {
    path: PathBuf,
}

impl CertStore {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        if path.contains("..") {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(Self {
            path: PathBuf::from(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// ACME account credentials live next to the store
    pub fn account_path(&self) -> PathBuf {
        self.dir().join("account.json")
    }

    /// Read every certificate. A missing store is empty; an unparseable one is an error.
    pub fn load(&self) -> Result<CertificateMap, StoreError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No certificate store yet");
                return Ok(CertificateMap::new());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let file: StoreFile = serde_json::from_str(&data).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        if file.version != STORE_VERSION {
            return Err(StoreError::UnsupportedVersion(file.version));
        }

        info!(
            path = %self.path.display(),
            certificates = file.certificates.len(),
            "Certificate store loaded"
        );
        Ok(file.certificates)
    }

    /// Replace the store with `certificates`
    pub fn save(&self, certificates: &CertificateMap) -> Result<(), StoreError> {
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let dir = self.dir();
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let file = StoreFile {
            version: STORE_VERSION,
            certificates: certificates.clone(),
        };
        let data = serde_json::to_vec_pretty(&file).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(&data).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(io_err)?;
        }

        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        debug!(path = %self.path.display(), certificates = certificates.len(), "Certificate store saved");
        Ok(())
    }
}

pub(crate) fn parse_chain(pem: &str) -> Vec<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .filter_map(|c| c.ok())
        .collect()
}

pub(crate) fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Expiry (unix seconds) and issuer of a DER certificate
fn leaf_details(cert: &CertificateDer<'_>) -> Result<(i64, String), String> {
    use x509_parser::prelude::*;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).map_err(|e| e.to_string())?;
    Ok((
        parsed.validity().not_after.timestamp(),
        parsed.issuer().to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn self_signed(host: &str) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec![host.to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_from_pem_reads_expiry() {
        let (cert, key) = self_signed("a.example.com");
        let stored = StoredCertificate::from_pem("a.example.com", &cert, &key).unwrap();
        // rcgen's default validity runs to 4096
        assert!(stored.not_after > chrono::Utc::now().timestamp());
        assert!(stored.to_certified_key().is_ok());
    }

    #[test]
    fn test_from_pem_rejects_garbage() {
        assert!(StoredCertificate::from_pem("a", "not a cert", "not a key").is_err());
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certs/certificates.json");
        let store = CertStore::new(path.to_str().unwrap()).unwrap();

        let mut certs = CertificateMap::new();
        for host in ["b.example.com", "a.example.com"] {
            let (cert, key) = self_signed(host);
            certs.insert(host.to_string(), StoredCertificate::from_pem(host, &cert, &key).unwrap());
        }
        store.save(&certs).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, certs);

        // keys are written sorted
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.find("a.example.com").unwrap() < raw.find("b.example.com").unwrap());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_missing_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(dir.path().join("none.json").to_str().unwrap()).unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_store_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certificates.json");
        std::fs::write(&path, "{\"version\":1,\"certificates\":").unwrap();
        let store = CertStore::new(path.to_str().unwrap()).unwrap();
        assert!(matches!(store.load(), Err(StoreError::Corrupt { .. })));

        std::fs::write(&path, "{\"version\":9,\"certificates\":{}}").unwrap();
        assert!(matches!(store.load(), Err(StoreError::UnsupportedVersion(9))));
    }

    #[test]
    fn test_rejects_traversal_and_places_account() {
        assert!(CertStore::new("../etc/certs.json").is_err());
        let store = CertStore::new("/var/lib/tidegate/certificates.json").unwrap();
        assert_eq!(store.account_path(), PathBuf::from("/var/lib/tidegate/account.json"));
        let bare = CertStore::new("certificates.json").unwrap();
        assert_eq!(bare.account_path(), PathBuf::from("./account.json"));
    }
}
