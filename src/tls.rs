//! Certificate store and SNI resolution
//!
//! Uploaded cert/key pairs are kept in a de-duplicated set keyed by the MD5
//! of cert || key. SNI resolution tries the ACME manager first, then an
//! exact hostname match, then wildcard label replacement left-to-right, and
//! falls back to the first stored certificate. Returning no certificate
//! fails the handshake, which is the only way to say "no TLS site
//! configured" at this layer.

use crate::acme::AcmeManager;
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::io::BufReader;
use std::sync::Arc;
use tracing::{debug, warn};

/// 16-byte digest identifying a cert/key pair.
pub type CertId = [u8; 16];

struct StoredCert {
    key: Arc<CertifiedKey>,
    id: CertId,
}

#[derive(Default)]
struct StoreInner {
    entries: Vec<StoredCert>,
    /// DNS name (exact or wildcard, as it appears in the leaf) to entry
    /// index; rebuilt on every insert.
    names: HashMap<String, usize>,
}

/// De-duplicated set of served certificates.
#[derive(Default)]
pub struct CertStore {
    inner: RwLock<StoreInner>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, id: &CertId) -> bool {
        self.inner.read().entries.iter().any(|e| &e.id == id)
    }

    /// Insert a certificate; idempotent by id.
    pub fn add(&self, key: Arc<CertifiedKey>, id: CertId) {
        let mut inner = self.inner.write();
        if inner.entries.iter().any(|e| e.id == id) {
            return;
        }
        inner.entries.push(StoredCert { key, id });
        rebuild_names(&mut inner);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Resolve a certificate for an SNI name.
    pub fn resolve(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let inner = self.inner.read();
        if inner.entries.is_empty() {
            return None;
        }
        if inner.entries.len() == 1 {
            return Some(inner.entries[0].key.clone());
        }

        let name = server_name
            .unwrap_or("")
            .trim_end_matches('.')
            .to_lowercase();

        if let Some(&at) = inner.names.get(&name) {
            return Some(inner.entries[at].key.clone());
        }

        // Replace labels with wildcards until something matches.
        let mut labels: Vec<&str> = name.split('.').collect();
        for i in 0..labels.len() {
            labels[i] = "*";
            let candidate = labels.join(".");
            if let Some(&found) = inner.names.get(&candidate) {
                return Some(inner.entries[found].key.clone());
            }
        }

        // Nothing matched; hand out the first certificate.
        Some(inner.entries[0].key.clone())
    }
}

fn rebuild_names(inner: &mut StoreInner) {
    inner.names.clear();
    for (at, entry) in inner.entries.iter().enumerate() {
        let Some(leaf) = entry.key.cert.first() else {
            continue;
        };
        for name in leaf_dns_names(leaf) {
            inner.names.insert(name.to_lowercase(), at);
        }
    }
}

/// DNS names a leaf certificate answers for: subject alternative names,
/// falling back to the common name when there are none.
fn leaf_dns_names(cert: &CertificateDer<'_>) -> Vec<String> {
    use x509_parser::prelude::*;

    let Ok((_, parsed)) = X509Certificate::from_der(cert.as_ref()) else {
        warn!("stored certificate does not parse as X.509");
        return Vec::new();
    };

    let mut names = Vec::new();
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for entry in &san.value.general_names {
            if let GeneralName::DNSName(dns) = entry {
                names.push(dns.to_string());
            }
        }
    }
    if names.is_empty() {
        for cn in parsed.subject().iter_common_name() {
            if let Ok(value) = cn.as_str() {
                names.push(value.to_string());
            }
        }
    }
    names
}

/// Parse a PEM cert chain + PEM private key into a servable key pair.
pub fn parse_cert_pair(cert_pem: &[u8], key_pem: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificate in PEM data");
    }

    let key = read_private_key(key_pem)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("unsupported private key: {}", e))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn read_private_key(key_pem: &[u8]) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(key_pem);
    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            Some(_) => continue,
            None => anyhow::bail!("no private key in PEM data"),
        }
    }
}

/// SNI callback: ACME-provisioned certificates win, then the upload store.
pub struct SniResolver {
    store: Arc<CertStore>,
    acme: Option<Arc<AcmeManager>>,
}

impl SniResolver {
    pub fn new(store: Arc<CertStore>, acme: Option<Arc<AcmeManager>>) -> Self {
        Self { store, acme }
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();

        if let Some(acme) = &self.acme {
            if let Some(key) = acme.certificate_for(server_name) {
                debug!(?server_name, "serving ACME certificate");
                return Some(key);
            }
        }

        let resolved = self.store.resolve(server_name);
        if resolved.is_none() {
            debug!(?server_name, "no tls site configured");
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(names: &[&str]) -> (Arc<CertifiedKey>, Vec<u8>, Vec<u8>) {
        let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(
            names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        let cert_pem = cert.pem().into_bytes();
        let key_pem = key_pair.serialize_pem().into_bytes();
        let key = parse_cert_pair(&cert_pem, &key_pem).unwrap();
        (key, cert_pem, key_pem)
    }

    fn id(byte: u8) -> CertId {
        [byte; 16]
    }

    #[test]
    fn parse_pair_round_trips() {
        let (_key, cert_pem, key_pem) = self_signed(&["example.com"]);
        assert!(parse_cert_pair(&cert_pem, &key_pem).is_ok());
        assert!(parse_cert_pair(b"garbage", &key_pem).is_err());
        assert!(parse_cert_pair(&cert_pem, b"garbage").is_err());
    }

    #[test]
    fn add_is_idempotent_by_id() {
        let store = CertStore::new();
        let (key, _, _) = self_signed(&["example.com"]);

        assert!(!store.has(&id(1)));
        store.add(key.clone(), id(1));
        assert!(store.has(&id(1)));
        store.add(key, id(1));
        assert_eq!(store.inner.read().entries.len(), 1);
    }

    #[test]
    fn empty_store_resolves_nothing() {
        let store = CertStore::new();
        assert!(store.resolve(Some("example.com")).is_none());
        assert!(store.resolve(None).is_none());
    }

    #[test]
    fn single_cert_serves_everything() {
        let store = CertStore::new();
        let (key, _, _) = self_signed(&["example.com"]);
        store.add(key.clone(), id(1));

        let got = store.resolve(Some("other.org")).unwrap();
        assert!(Arc::ptr_eq(&got, &key));
        assert!(store.resolve(None).is_some());
    }

    #[test]
    fn exact_name_match() {
        let store = CertStore::new();
        let (a, _, _) = self_signed(&["a.example.com"]);
        let (b, _, _) = self_signed(&["b.example.com"]);
        store.add(a.clone(), id(1));
        store.add(b.clone(), id(2));

        let got = store.resolve(Some("b.example.com")).unwrap();
        assert!(Arc::ptr_eq(&got, &b));
        // Trailing dot and case are normalized away.
        let got = store.resolve(Some("B.EXAMPLE.COM.")).unwrap();
        assert!(Arc::ptr_eq(&got, &b));
    }

    #[test]
    fn wildcard_match() {
        let store = CertStore::new();
        let (plain, _, _) = self_signed(&["other.org"]);
        let (wild, _, _) = self_signed(&["*.example.com"]);
        store.add(plain, id(1));
        store.add(wild.clone(), id(2));

        let got = store.resolve(Some("api.example.com")).unwrap();
        assert!(Arc::ptr_eq(&got, &wild));
    }

    #[test]
    fn unmatched_name_falls_back_to_first() {
        let store = CertStore::new();
        let (first, _, _) = self_signed(&["a.com"]);
        let (second, _, _) = self_signed(&["b.com"]);
        store.add(first.clone(), id(1));
        store.add(second, id(2));

        let got = store.resolve(Some("unrelated.net")).unwrap();
        assert!(Arc::ptr_eq(&got, &first));
    }

    #[test]
    fn leaf_names_extracted() {
        let (key, _, _) = self_signed(&["example.com", "www.example.com"]);
        let names = leaf_dns_names(key.cert.first().unwrap());
        assert!(names.contains(&"example.com".to_string()));
        assert!(names.contains(&"www.example.com".to_string()));
    }
}
