//! Certificate store for TLS termination
//!
//! Certificates are picked by exact SNI name, then by a `*.parent` wildcard
//! entry, then the default certificate.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, RwLock};

use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificates found in {0}")]
    NoCertificates(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("Unsupported private key: {0}")]
    UnsupportedKey(String),

    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),
}

#[derive(Debug, Default)]
pub struct CertStore {
    by_name: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    default: RwLock<Option<Arc<CertifiedKey>>>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose default is a freshly generated self-signed certificate for `domains`
    pub fn self_signed(domains: &[String]) -> Result<Self, CertError> {
        let (chain, key) = generate_self_signed(domains)?;
        let store = Self::new();
        store.set_default(certified_key(chain, key)?);
        info!("Using self-signed certificate for {:?}", domains);
        Ok(store)
    }

    /// A store whose default certificate is loaded from PEM files
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let store = Self::new();
        store.set_default(load_pem(cert_path, key_path)?);
        Ok(store)
    }

    /// Serve `key` for `name`, which may be a `*.parent` wildcard
    pub fn insert(&self, name: &str, key: CertifiedKey) {
        let mut by_name = self.by_name.write().unwrap_or_else(|e| e.into_inner());
        by_name.insert(name.to_ascii_lowercase(), Arc::new(key));
    }

    pub fn set_default(&self, key: CertifiedKey) {
        let mut default = self.default.write().unwrap_or_else(|e| e.into_inner());
        *default = Some(Arc::new(key));
    }

    pub fn len(&self) -> usize {
        self.by_name.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Certificate for a servername, falling back to the default
    pub fn lookup(&self, servername: Option<&str>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = servername {
            let name = name.to_ascii_lowercase();
            let by_name = self.by_name.read().unwrap_or_else(|e| e.into_inner());
            if let Some(key) = by_name.get(&name) {
                return Some(key.clone());
            }
            if let Some((_, parent)) = name.split_once('.') {
                if let Some(key) = by_name.get(&format!("*.{}", parent)) {
                    return Some(key.clone());
                }
            }
        }

        let default = self.default.read().unwrap_or_else(|e| e.into_inner());
        if default.is_none() {
            debug!(servername = ?servername, "No certificate available");
        }
        default.clone()
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.lookup(client_hello.server_name())
    }
}

/// Load a certificate chain and private key from PEM files
pub fn load_pem(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, CertError> {
    let cert_name = cert_path.display().to_string();
    let key_name = key_path.display().to_string();

    let mut reader = open(cert_path)?;
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertError::Read {
            path: cert_name.clone(),
            source,
        })?;
    if chain.is_empty() {
        return Err(CertError::NoCertificates(cert_name));
    }

    let mut reader = open(key_path)?;
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|source| CertError::Read {
            path: key_name.clone(),
            source,
        })?
        .ok_or(CertError::NoPrivateKey(key_name))?;

    certified_key(chain, key)
}

fn open(path: &Path) -> Result<BufReader<File>, CertError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CertError::Read {
            path: path.display().to_string(),
            source,
        })
}

fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<CertifiedKey, CertError> {
    let signing_key = any_supported_type(&key).map_err(|e| CertError::UnsupportedKey(e.to_string()))?;
    Ok(CertifiedKey::new(chain, signing_key))
}

/// Generate a self-signed certificate valid for `domains`
pub fn generate_self_signed(
    domains: &[String],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), CertError> {
    let names = if domains.is_empty() {
        vec!["localhost".to_string()]
    } else {
        domains.to_vec()
    };

    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)
        .map_err(|e| CertError::GenerationFailed(e.to_string()))?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((vec![cert.der().clone()], key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn key_for(domain: &str) -> CertifiedKey {
        let (chain, key) = generate_self_signed(&[domain.to_string()]).unwrap();
        certified_key(chain, key).unwrap()
    }

    #[test]
    fn test_lookup_order() {
        let store = CertStore::new();
        store.insert("api.example.com", key_for("api.example.com"));
        store.insert("*.example.com", key_for("*.example.com"));
        store.set_default(key_for("localhost"));

        let exact = store.lookup(Some("API.example.com")).unwrap();
        let wildcard = store.lookup(Some("web.example.com")).unwrap();
        let fallback = store.lookup(Some("other.test")).unwrap();
        let no_sni = store.lookup(None).unwrap();

        assert_ne!(exact.cert[0], wildcard.cert[0]);
        assert_ne!(wildcard.cert[0], fallback.cert[0]);
        assert_eq!(fallback.cert[0], no_sni.cert[0]);
    }

    #[test]
    fn test_empty_store_resolves_nothing() {
        let store = CertStore::new();
        assert!(store.lookup(Some("example.com")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_pem_files() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(generated.cert.pem().as_bytes()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file
            .write_all(generated.key_pair.serialize_pem().as_bytes())
            .unwrap();

        let store = CertStore::from_pem_files(cert_file.path(), key_file.path()).unwrap();
        assert!(store.lookup(Some("localhost")).is_some());
    }

    #[test]
    fn test_load_pem_without_key() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(generated.cert.pem().as_bytes()).unwrap();

        assert!(matches!(
            load_pem(cert_file.path(), cert_file.path()),
            Err(CertError::NoPrivateKey(_))
        ));
    }
}
