//! ACME (Let's Encrypt) certificate management
//!
//! The manager is a thin collaborator of the SNI resolver: certificates it
//! has provisioned win over the upload store. Registration is lazy: the
//! first upload that carries a `letsencryptmail` fixes the account email and
//! the host set; later registrations are logged and ignored. Account
//! credentials and issued certificates persist in a single JSON cache file
//! (`letsencrypt.cache` by default) in the server's working directory.
//!
//! Only the HTTP-01 challenge is implemented; the plain-HTTP proxy serves
//! pending tokens at `/.well-known/acme-challenge/`.

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use parking_lot::RwLock;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Renewal sweep cadence.
const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Renew certificates with less than this many days left.
const RENEW_BEFORE_DAYS: u64 = 30;

#[derive(Clone, Serialize, Deserialize)]
struct CachedCert {
    chain_pem: String,
    key_pem: String,
}

/// On-disk shape of the cache file.
#[derive(Default, Serialize, Deserialize)]
struct CacheFile {
    email: Option<String>,
    hosts: Vec<String>,
    credentials: Option<serde_json::Value>,
    #[serde(default)]
    certs: HashMap<String, CachedCert>,
}

#[derive(Default)]
struct AcmeInner {
    email: Option<String>,
    hosts: Vec<String>,
    credentials: Option<serde_json::Value>,
    cert_pems: HashMap<String, CachedCert>,
    certs: HashMap<String, Arc<CertifiedKey>>,
}

/// Lazily registered Let's Encrypt manager.
pub struct AcmeManager {
    cache_path: PathBuf,
    inner: RwLock<AcmeInner>,
    /// Pending HTTP-01 tokens: token -> key authorization.
    challenges: RwLock<HashMap<String, String>>,
}

impl AcmeManager {
    /// Load (or start empty) state from the cache file.
    pub fn new(cache_path: PathBuf) -> anyhow::Result<Arc<Self>> {
        let mut inner = AcmeInner::default();

        if cache_path.exists() {
            let data = std::fs::read_to_string(&cache_path)?;
            let cache: CacheFile = serde_json::from_str(&data)?;
            for (host, cached) in &cache.certs {
                match crate::tls::parse_cert_pair(cached.chain_pem.as_bytes(), cached.key_pem.as_bytes()) {
                    Ok(key) => {
                        inner.certs.insert(host.clone(), key);
                    }
                    Err(err) => {
                        warn!(host = %host, error = %err, "dropping unusable cached certificate");
                    }
                }
            }
            inner.email = cache.email;
            inner.hosts = cache.hosts;
            inner.credentials = cache.credentials;
            inner.cert_pems = cache.certs;
            info!(path = %cache_path.display(), certs = inner.certs.len(), "loaded ACME cache");
        }

        Ok(Arc::new(Self {
            cache_path,
            inner: RwLock::new(inner),
            challenges: RwLock::new(HashMap::new()),
        }))
    }

    pub fn registered(&self) -> bool {
        self.inner.read().email.is_some()
    }

    /// Fix the account email and host set. First registration wins; later
    /// calls are ignored so the host set never changes underneath an order.
    pub fn register(self: &Arc<Self>, email: &str, hosts: &[String]) {
        {
            let mut inner = self.inner.write();
            if inner.email.is_some() {
                info!("letsencrypt already registered");
                return;
            }
            info!(email, ?hosts, "registering at letsencrypt.org");
            inner.email = Some(email.to_string());
            inner.hosts = hosts.to_vec();
        }
        self.persist();

        let manager = self.clone();
        tokio::spawn(async move {
            manager.provision_missing().await;
        });
    }

    /// Certificate for an SNI name, if this manager provisioned one.
    pub fn certificate_for(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let name = server_name?.trim_end_matches('.').to_lowercase();
        self.inner.read().certs.get(&name).cloned()
    }

    /// Key authorization for a pending HTTP-01 token.
    pub fn http01_key_auth(&self, token: &str) -> Option<String> {
        self.challenges.read().get(token).cloned()
    }

    /// Renewal loop: provisions missing certificates and renews expiring
    /// ones until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            self.provision_missing().await;
            tokio::select! {
                _ = tokio::time::sleep(RENEWAL_INTERVAL) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn provision_missing(&self) {
        let (email, hosts) = {
            let inner = self.inner.read();
            match &inner.email {
                Some(email) => (email.clone(), inner.hosts.clone()),
                None => return,
            }
        };
        if hosts.is_empty() {
            return;
        }

        let due: Vec<String> = {
            let inner = self.inner.read();
            hosts
                .iter()
                .filter(|host| match inner.cert_pems.get(*host) {
                    None => true,
                    Some(cached) => !chain_valid_for_days(cached.chain_pem.as_bytes(), RENEW_BEFORE_DAYS),
                })
                .cloned()
                .collect()
        };
        if due.is_empty() {
            return;
        }

        let account = match self.account(&email).await {
            Ok(account) => account,
            Err(err) => {
                error!(error = %err, "ACME account unavailable");
                return;
            }
        };

        for host in due {
            match self.order_certificate(&account, &host).await {
                Ok(()) => info!(host = %host, "certificate provisioned"),
                Err(err) => error!(host = %host, error = %err, "certificate order failed"),
            }
        }
    }

    /// Load the account from cached credentials or create a fresh one.
    async fn account(&self, email: &str) -> anyhow::Result<Account> {
        let cached = self.inner.read().credentials.clone();
        if let Some(value) = cached {
            let credentials: AccountCredentials = serde_json::from_value(value)?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        info!(email, "creating ACME account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            LetsEncrypt::Production.url(),
            None,
        )
        .await?;

        self.inner.write().credentials = Some(serde_json::to_value(&credentials)?);
        self.persist();
        Ok(account)
    }

    async fn order_certificate(&self, account: &Account, host: &str) -> anyhow::Result<()> {
        let identifiers = [Identifier::Dns(host.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        for authz in order.authorizations().await? {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("no HTTP-01 challenge offered for {}", host))?;

            let key_auth = order.key_authorization(challenge);
            self.challenges
                .write()
                .insert(challenge.token.clone(), key_auth.as_str().to_string());
            debug!(host, token = %challenge.token, "HTTP-01 challenge armed");

            order.set_challenge_ready(&challenge.url).await?;

            let result = self.await_authorization(&mut order, host).await;
            self.challenges.write().remove(&challenge.token);
            result?;
        }

        // Wait for the order to become finalizable.
        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("order for {} became invalid", host),
                _ => {
                    attempts += 1;
                    if attempts > 30 {
                        anyhow::bail!("order for {} timed out", host);
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    order.refresh().await?;
                }
            }
        }

        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&key_pair)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let chain_pem = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("order valid but no certificate returned for {}", host);
                }
                OrderStatus::Invalid => anyhow::bail!("finalized order for {} became invalid", host),
                _ => {
                    attempts += 1;
                    if attempts > 30 {
                        anyhow::bail!("certificate for {} timed out", host);
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        };

        let key_pem = key_pair.serialize_pem();
        let key = crate::tls::parse_cert_pair(chain_pem.as_bytes(), key_pem.as_bytes())?;

        {
            let mut inner = self.inner.write();
            inner.certs.insert(host.to_string(), key);
            inner.cert_pems.insert(host.to_string(), CachedCert { chain_pem, key_pem });
        }
        self.persist();
        Ok(())
    }

    async fn await_authorization(
        &self,
        order: &mut instant_acme::Order,
        host: &str,
    ) -> anyhow::Result<()> {
        let mut attempts = 0;
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;
            order.refresh().await?;

            let auths = order.authorizations().await?;
            let status = auths
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == host))
                .map(|a| &a.status);

            match status {
                Some(AuthorizationStatus::Valid) => return Ok(()),
                Some(AuthorizationStatus::Invalid) => {
                    anyhow::bail!("authorization failed for {}", host)
                }
                Some(_) | None => {
                    attempts += 1;
                    if attempts > 30 {
                        anyhow::bail!("authorization timed out for {}", host);
                    }
                    debug!(host, attempts, "waiting for authorization");
                }
            }
        }
    }

    fn persist(&self) {
        let cache = {
            let inner = self.inner.read();
            CacheFile {
                email: inner.email.clone(),
                hosts: inner.hosts.clone(),
                credentials: inner.credentials.clone(),
                certs: inner.cert_pems.clone(),
            }
        };
        match serde_json::to_string_pretty(&cache) {
            Ok(data) => {
                if let Err(err) = std::fs::write(&self.cache_path, data) {
                    error!(path = %self.cache_path.display(), error = %err, "writing ACME cache");
                }
            }
            Err(err) => error!(error = %err, "encoding ACME cache"),
        }
    }
}

/// Does the leaf of a PEM chain stay valid for at least `days` more days?
fn chain_valid_for_days(chain_pem: &[u8], days: u64) -> bool {
    use x509_parser::prelude::*;

    let mut reader = std::io::BufReader::new(chain_pem);
    let Some(Ok(leaf)) = rustls_pemfile::certs(&mut reader).next() else {
        return false;
    };
    let leaf: CertificateDer<'_> = leaf;

    let Ok((_, parsed)) = X509Certificate::from_der(leaf.as_ref()) else {
        return false;
    };

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let remaining = parsed.validity().not_after.timestamp() - now;
    remaining > 0 && (remaining as u64) / (24 * 60 * 60) >= days
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn self_signed_pems(host: &str) -> (String, String) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    #[tokio::test]
    async fn starts_unregistered_without_cache() {
        let temp = TempDir::new().unwrap();
        let manager = AcmeManager::new(temp.path().join("letsencrypt.cache")).unwrap();
        assert!(!manager.registered());
        assert!(manager.certificate_for(Some("example.com")).is_none());
        assert!(manager.http01_key_auth("token").is_none());
    }

    #[tokio::test]
    async fn first_registration_wins() {
        let temp = TempDir::new().unwrap();
        let manager = AcmeManager::new(temp.path().join("letsencrypt.cache")).unwrap();

        manager.register("ops@example.com", &["example.com".to_string()]);
        assert!(manager.registered());

        // The second registration must not replace email or hosts.
        manager.register("other@example.net", &["other.net".to_string()]);
        let inner = manager.inner.read();
        assert_eq!(inner.email.as_deref(), Some("ops@example.com"));
        assert_eq!(inner.hosts, vec!["example.com"]);
    }

    #[tokio::test]
    async fn cache_round_trips_registration_and_certs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("letsencrypt.cache");

        {
            let manager = AcmeManager::new(path.clone()).unwrap();
            manager.register("ops@example.com", &["example.com".to_string()]);

            let (chain_pem, key_pem) = self_signed_pems("example.com");
            let key = crate::tls::parse_cert_pair(chain_pem.as_bytes(), key_pem.as_bytes()).unwrap();
            {
                let mut inner = manager.inner.write();
                inner.certs.insert("example.com".to_string(), key);
                inner
                    .cert_pems
                    .insert("example.com".to_string(), CachedCert { chain_pem, key_pem });
            }
            manager.persist();
        }

        let reloaded = AcmeManager::new(path).unwrap();
        assert!(reloaded.registered());
        assert!(reloaded.certificate_for(Some("example.com")).is_some());
        assert!(reloaded.certificate_for(Some("other.net")).is_none());
    }

    #[test]
    fn fresh_self_signed_is_valid_for_30_days() {
        let (chain_pem, _) = self_signed_pems("example.com");
        // rcgen's default validity is measured in years.
        assert!(chain_valid_for_days(chain_pem.as_bytes(), 30));
        assert!(!chain_valid_for_days(b"not a pem", 30));
    }

    #[test]
    fn challenge_map() {
        let temp = TempDir::new().unwrap();
        let manager = AcmeManager::new(temp.path().join("c.cache")).unwrap();
        manager
            .challenges
            .write()
            .insert("tok".to_string(), "tok.auth".to_string());
        assert_eq!(manager.http01_key_auth("tok").as_deref(), Some("tok.auth"));
        assert!(manager.http01_key_auth("other").is_none());
    }
}
