//! Certificate authority client
//!
//! [`CertificateAuthority`] is the seam the certificate manager issues through.
//! [`AcmeAuthority`] implements it against an ACME directory (Let's Encrypt by
//! default) using either challenge type:
//! - HTTP-01: the plaintext entry points answer `/.well-known/acme-challenge/<token>`
//! - TLS-ALPN-01: the TLS entry points present a challenge certificate to
//!   clients negotiating `acme-tls/1`
//!
//! Both are served out of the shared [`ChallengeStore`].

use crate::config::{AcmeChallengeType, AcmeConfig};
use async_trait::async_trait;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";
const ACME_ALPN_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 31];

/// Seconds between polls of an order or authorization
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLLS: u32 = 30;

/// Why an issuance attempt did not produce a certificate
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorityError {
    /// Worth retrying: network trouble, rate limits, server errors, timeouts
    #[error("transient authority error: {0}")]
    Transient(String),
    /// The authority refused; retrying now would not help
    #[error("authority rejected the request: {0}")]
    Rejected(String),
}

impl AuthorityError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthorityError::Transient(_))
    }
}

impl From<instant_acme::Error> for AuthorityError {
    fn from(e: instant_acme::Error) -> Self {
        match &e {
            instant_acme::Error::Api(problem) => {
                let kind = problem.r#type.as_deref().unwrap_or_default();
                let retryable = ["rateLimited", "serverInternal", "badNonce"]
                    .iter()
                    .any(|k| kind.ends_with(k));
                if retryable {
                    AuthorityError::Transient(e.to_string())
                } else {
                    AuthorityError::Rejected(e.to_string())
                }
            }
            _ => AuthorityError::Transient(e.to_string()),
        }
    }
}

/// PEM material returned by a successful issuance
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub certificate: String,
    pub private_key: String,
}

/// Lets an authority report how far an issuance has come
pub struct IssuanceProgress {
    on_validating: Box<dyn Fn() + Send + Sync>,
}

impl IssuanceProgress {
    pub fn new(on_validating: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            on_validating: Box::new(on_validating),
        }
    }

    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// The challenge is in place and the authority has been asked to verify it
    pub fn validating(&self) {
        (self.on_validating)()
    }
}

/// Something that can issue a certificate for a hostname
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Name recorded as the issuer source in logs
    fn name(&self) -> &str;

    async fn issue(
        &self,
        hostname: &str,
        progress: &IssuanceProgress,
    ) -> Result<IssuedCertificate, AuthorityError>;
}

/// Pending challenge responses, read by the edge listener
#[derive(Clone, Default)]
pub struct ChallengeStore {
    http01: Arc<DashMap<String, String>>,
    tls_alpn01: Arc<DashMap<String, Arc<CertifiedKey>>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_http01(&self, token: &str, key_authorization: &str) {
        self.http01
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn http01(&self, token: &str) -> Option<String> {
        self.http01.get(token).map(|v| v.value().clone())
    }

    pub fn remove_http01(&self, token: &str) {
        self.http01.remove(token);
    }

    pub fn set_tls_alpn01(&self, domain: &str, cert: Arc<CertifiedKey>) {
        self.tls_alpn01.insert(domain.to_ascii_lowercase(), cert);
    }

    pub fn tls_alpn01(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.tls_alpn01
            .get(&domain.to_ascii_lowercase())
            .map(|v| Arc::clone(v.value()))
    }

    pub fn remove_tls_alpn01(&self, domain: &str) {
        self.tls_alpn01.remove(&domain.to_ascii_lowercase());
    }
}

/// Challenge put in place for one authorization. Removed on drop, so an
/// aborted issuance cleans up too.
struct ActiveChallenge {
    store: ChallengeStore,
    kind: ChallengeKey,
}

enum ChallengeKey {
    Http01(String),
    TlsAlpn01(String),
}

impl Drop for ActiveChallenge {
    fn drop(&mut self) {
        match &self.kind {
            ChallengeKey::Http01(token) => self.store.remove_http01(token),
            ChallengeKey::TlsAlpn01(domain) => self.store.remove_tls_alpn01(domain),
        }
    }
}

/// ACME client
pub struct AcmeAuthority {
    config: AcmeConfig,
    account_path: PathBuf,
    challenges: ChallengeStore,
    account: OnceCell<Account>,
}

impl AcmeAuthority {
    pub fn new(config: AcmeConfig, account_path: PathBuf, challenges: ChallengeStore) -> Self {
        Self {
            config,
            account_path,
            challenges,
            account: OnceCell::new(),
        }
    }

    fn directory_url(&self) -> &str {
        self.config
            .directory_url
            .as_deref()
            .unwrap_or(LetsEncrypt::Production.url())
    }

    async fn account(&self) -> Result<&Account, AuthorityError> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    /// Load or create an ACME account
    async fn load_or_create_account(&self) -> Result<Account, AuthorityError> {
        let transient = |e: String| AuthorityError::Transient(e);

        if self.account_path.exists() {
            debug!(path = %self.account_path.display(), "Loading existing ACME account");
            let data = std::fs::read_to_string(&self.account_path)
                .map_err(|e| transient(format!("reading account: {}", e)))?;
            let credentials: AccountCredentials = serde_json::from_str(&data)
                .map_err(|e| AuthorityError::Rejected(format!("account file is corrupt: {}", e)))?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        info!(directory = %self.directory_url(), "Creating new ACME account");
        let contact = self.config.email.as_ref().map(|e| format!("mailto:{}", e));
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            self.directory_url(),
            None,
        )
        .await?;

        let data = serde_json::to_string_pretty(&credentials)
            .map_err(|e| transient(format!("serializing account: {}", e)))?;
        write_private(&self.account_path, data.as_bytes())
            .map_err(|e| transient(format!("saving account: {}", e)))?;
        info!(path = %self.account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    /// Publish the challenge response for one authorization
    fn prepare_challenge(
        &self,
        order: &mut Order,
        hostname: &str,
        challenge: &instant_acme::Challenge,
    ) -> Result<ActiveChallenge, AuthorityError> {
        let key_auth = order.key_authorization(challenge);

        match self.config.challenge_type {
            AcmeChallengeType::Http01 => {
                debug!(domain = %hostname, token = %challenge.token, "Setting up HTTP-01 challenge");
                self.challenges
                    .set_http01(&challenge.token, key_auth.as_str());
                Ok(ActiveChallenge {
                    store: self.challenges.clone(),
                    kind: ChallengeKey::Http01(challenge.token.clone()),
                })
            }
            AcmeChallengeType::TlsAlpn01 => {
                debug!(domain = %hostname, "Setting up TLS-ALPN-01 challenge");
                let cert = create_tls_alpn01_cert(hostname, key_auth.digest().as_ref())
                    .map_err(|e| AuthorityError::Transient(e.to_string()))?;
                self.challenges.set_tls_alpn01(hostname, cert);
                Ok(ActiveChallenge {
                    store: self.challenges.clone(),
                    kind: ChallengeKey::TlsAlpn01(hostname.to_string()),
                })
            }
        }
    }

    /// Wait for the authorization of `hostname` to become valid
    async fn await_authorization(&self, order: &mut Order, hostname: &str) -> Result<(), AuthorityError> {
        for attempt in 1..=MAX_POLLS {
            tokio::time::sleep(POLL_INTERVAL).await;

            order.refresh().await?;
            let auths = order.authorizations().await?;
            let status = auths
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == hostname))
                .map(|a| &a.status);

            match status {
                Some(AuthorizationStatus::Valid) => {
                    info!(domain = %hostname, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Pending) => {
                    debug!(domain = %hostname, attempt, "Waiting for authorization");
                }
                Some(AuthorizationStatus::Invalid) => {
                    return Err(AuthorityError::Rejected(format!(
                        "authorization failed for {}",
                        hostname
                    )));
                }
                Some(status) => {
                    debug!(domain = %hostname, status = ?status, "Authorization status");
                }
                None => {
                    return Err(AuthorityError::Rejected(format!(
                        "authorization not found for {}",
                        hostname
                    )));
                }
            }
        }
        Err(AuthorityError::Transient(format!(
            "authorization timeout for {}",
            hostname
        )))
    }

    async fn complete_order(&self, order: &mut Order, hostname: &str) -> Result<IssuedCertificate, AuthorityError> {
        // wait for the order to be ready
        let mut polls = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    return Err(AuthorityError::Rejected("order invalid".to_string()))
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    polls += 1;
                    if polls > MAX_POLLS {
                        return Err(AuthorityError::Transient("order timeout".to_string()));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        let csr_error = |e: rcgen::Error| AuthorityError::Transient(format!("building CSR: {}", e));
        let mut params = CertificateParams::new(vec![hostname.to_string()]).map_err(csr_error)?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, hostname.to_string());
        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(csr_error)?;
        let csr = params.serialize_request(&private_key).map_err(csr_error)?;

        order.finalize(csr.der()).await?;

        let mut polls = 0;
        let certificate = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => match order.certificate().await? {
                    Some(cert) => break cert,
                    None => {
                        return Err(AuthorityError::Transient(
                            "order valid but no certificate returned".to_string(),
                        ))
                    }
                },
                OrderStatus::Processing => {
                    polls += 1;
                    if polls > MAX_POLLS {
                        return Err(AuthorityError::Transient("certificate timeout".to_string()));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                _ => {
                    return Err(AuthorityError::Rejected(format!(
                        "unexpected order status: {:?}",
                        order.state().status
                    )))
                }
            }
        };

        Ok(IssuedCertificate {
            certificate,
            private_key: private_key.serialize_pem(),
        })
    }
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    fn name(&self) -> &str {
        "acme"
    }

    async fn issue(
        &self,
        hostname: &str,
        progress: &IssuanceProgress,
    ) -> Result<IssuedCertificate, AuthorityError> {
        let account = self.account().await?;
        info!(domain = %hostname, "Requesting new certificate");

        let identifiers = [Identifier::Dns(hostname.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let wanted = match self.config.challenge_type {
            AcmeChallengeType::Http01 => ChallengeType::Http01,
            AcmeChallengeType::TlsAlpn01 => ChallengeType::TlsAlpn01,
        };

        for authz in order.authorizations().await? {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }
            let domain = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == wanted)
                .ok_or_else(|| {
                    AuthorityError::Rejected(format!(
                        "challenge type {:?} not offered for {}",
                        self.config.challenge_type, domain
                    ))
                })?;

            let active = self.prepare_challenge(&mut order, &domain, challenge)?;
            let outcome: Result<(), AuthorityError> = async {
                order.set_challenge_ready(&challenge.url).await?;
                progress.validating();
                self.await_authorization(&mut order, &domain).await
            }
            .await;
            drop(active);
            outcome?;
        }

        let issued = self.complete_order(&mut order, hostname).await?;
        info!(domain = %hostname, "Certificate obtained successfully");
        Ok(issued)
    }
}

/// Create a TLS-ALPN-01 challenge certificate
pub fn create_tls_alpn01_cert(domain: &str, digest: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    use rcgen::{CustomExtension, IsCa, KeyUsagePurpose};

    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

    // acmeIdentifier extension: OCTET STRING holding the 32-byte digest
    let mut ext_value = vec![0x04, 0x20];
    ext_value.extend_from_slice(digest);
    let mut extension = CustomExtension::from_oid_content(ACME_ALPN_OID, ext_value);
    extension.set_criticality(true);
    params.custom_extensions.push(extension);

    self_signed_key(params)
}

/// Self-signed certificate served while no real one is available
pub fn placeholder_certificate(hostname: &str) -> anyhow::Result<Arc<CertifiedKey>> {
    let mut params = CertificateParams::new(vec![hostname.to_string()])?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, hostname.to_string());
    params
        .distinguished_name
        .push(DnType::OrganizationName, "tidegate placeholder");
    self_signed_key(params)
}

fn self_signed_key(params: CertificateParams) -> anyhow::Result<Arc<CertifiedKey>> {
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;

    Ok(Arc::new(CertifiedKey::new(vec![cert_der], signing_key)))
}

/// Write a file readable only by its owner
fn write_private(path: &std::path::Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        std::io::Write::write_all(&mut file, data)
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)
    }
}
