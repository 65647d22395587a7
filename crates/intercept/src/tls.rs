//! Leaf cache and TLS plumbing
//!
//! Minted leaves are cached per host for the life of the process, tagged
//! with the root generation that signed them. A cache hit whose generation
//! is stale (the root rotated since the leaf was signed) is discarded and
//! re-minted, so a leaf from an old root is never served.
//!
//! ALPN is pinned to HTTP/1.1 on the accept side: the relay is a plain
//! bidirectional byte copy and must not let clients negotiate H2 framing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, trace, warn};

use crate::authority::RootAuthority;
use crate::error::{Error, Result};

/// Per-host cache of leaves signed by the current root.
pub struct LeafCache {
    cache: RwLock<HashMap<String, (u64, Arc<CertifiedKey>)>>,
    authority: Arc<RootAuthority>,
}

impl LeafCache {
    pub fn new(authority: Arc<RootAuthority>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            authority,
        }
    }

    /// Return the cached leaf for `host`, minting one when absent or when
    /// the cached entry was signed by a rotated-out root.
    pub fn get_or_mint(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        let host = host.to_lowercase();
        let current = self.authority.ensure_current()?;

        {
            let cache = self.cache.read().expect("leaf cache lock poisoned");
            if let Some((generation, key)) = cache.get(&host) {
                if *generation == current {
                    trace!(host, "leaf cache hit");
                    return Ok(key.clone());
                }
                debug!(host, stale = generation, current, "discarding stale leaf");
            }
        }

        let minted = self.authority.mint_leaf(&host)?;

        let cert_chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut minted.cert_pem.as_bytes())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::Tls(format!("parsing leaf certificate: {e}")))?;
        if cert_chain.is_empty() {
            return Err(Error::Tls("minted leaf produced no certificate".into()));
        }

        let private_key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut minted.key_pem.as_bytes())
                .map_err(|e| Error::Tls(format!("parsing leaf key: {e}")))?
                .ok_or_else(|| Error::Tls("minted leaf produced no key".into()))?;

        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
            .map_err(|e| Error::Tls(format!("building signing key: {e}")))?;

        let certified = Arc::new(CertifiedKey::new(cert_chain, signing_key));

        let mut cache = self.cache.write().expect("leaf cache lock poisoned");
        // Another connection may have rotated the root while we minted;
        // keep the generation the mint actually used so the next lookup
        // re-checks against whatever is current then.
        cache.insert(host, (minted.generation, certified.clone()));
        Ok(certified)
    }

    pub fn len(&self) -> usize {
        self.cache.read().expect("leaf cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// SNI-driven resolver with a CONNECT-host fallback for SNI-less clients.
pub struct DynamicCertResolver {
    cache: Arc<LeafCache>,
    host_hint: Option<String>,
}

impl DynamicCertResolver {
    pub fn new(cache: Arc<LeafCache>) -> Self {
        Self {
            cache,
            host_hint: None,
        }
    }

    pub fn with_host_hint(cache: Arc<LeafCache>, host: String) -> Self {
        Self {
            cache,
            host_hint: Some(host),
        }
    }
}

impl ResolvesServerCert for DynamicCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello
            .server_name()
            .map(|s| s.to_string())
            .or_else(|| self.host_hint.clone())?;

        match self.cache.get_or_mint(&host) {
            Ok(key) => Some(key),
            Err(e) => {
                error!(host, error = %e, "leaf mint failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for DynamicCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCertResolver")
            .field("host_hint", &self.host_hint)
            .field("cached_leaves", &self.cache.len())
            .finish()
    }
}

/// Server config presenting minted leaves, ALPN pinned to HTTP/1.1.
pub fn server_config(cache: Arc<LeafCache>, host_hint: Option<String>) -> Arc<ServerConfig> {
    let resolver: Arc<dyn ResolvesServerCert> = match host_hint {
        Some(host) => Arc::new(DynamicCertResolver::with_host_hint(cache, host)),
        None => Arc::new(DynamicCertResolver::new(cache)),
    };

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Acceptor over [`server_config`].
pub fn tls_acceptor(cache: Arc<LeafCache>, host_hint: Option<String>) -> TlsAcceptor {
    TlsAcceptor::from(server_config(cache, host_hint))
}

/// Connector for the real upstream, trusting the native root store.
pub fn tls_connector() -> Result<TlsConnector> {
    let mut root_store = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in native.errors {
        warn!(error = %err, "native certificate skipped");
    }
    for cert in native.certs {
        if let Err(e) = root_store.add(cert) {
            warn!(error = %e, "certificate rejected by root store");
        }
    }
    if root_store.is_empty() {
        return Err(Error::Tls("no native root certificates available".into()));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Convert a hostname into a TLS server name.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::Tls(format!("invalid server name: {host}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, Arc<RootAuthority>, LeafCache) {
        let dir = tempfile::tempdir().unwrap();
        let authority = Arc::new(RootAuthority::open(dir.path().to_path_buf()).unwrap());
        let cache = LeafCache::new(authority.clone());
        (dir, authority, cache)
    }

    #[test]
    fn second_mint_returns_identical_cached_leaf() {
        let (_dir, _authority, cache) = cache();
        let first = cache.get_or_mint("a.example").unwrap();
        let second = cache.get_or_mint("a.example").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn hosts_are_case_insensitive() {
        let (_dir, _authority, cache) = cache();
        cache.get_or_mint("a.example").unwrap();
        cache.get_or_mint("A.EXAMPLE").unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn root_rotation_invalidates_cached_leaf() {
        let (dir, authority, cache) = cache();
        let old_leaf = cache.get_or_mint("a.example").unwrap();

        std::fs::remove_file(dir.path().join("root.crt")).unwrap();
        std::fs::remove_file(dir.path().join("root.key")).unwrap();

        let new_leaf = cache.get_or_mint("a.example").unwrap();
        assert!(!Arc::ptr_eq(&old_leaf, &new_leaf));
        assert_eq!(authority.generation(), 2);

        // And the new leaf is now the stable cached one.
        let again = cache.get_or_mint("a.example").unwrap();
        assert!(Arc::ptr_eq(&new_leaf, &again));
    }

    #[test]
    fn acceptor_builds_with_and_without_hint() {
        let (_dir, _authority, cache) = cache();
        let cache = Arc::new(cache);
        let _with = tls_acceptor(cache.clone(), Some("a.example".into()));
        let _without = tls_acceptor(cache, None);
    }

    #[test]
    fn server_name_rejects_garbage() {
        assert!(server_name("a.example").is_ok());
        assert!(server_name("").is_err());
    }
}
