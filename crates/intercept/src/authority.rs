//! Persisted root authority for leaf signing
//!
//! The root key pair and certificate live on disk at a fixed directory and
//! survive restarts, so clients only need to trust the root once. If the
//! files disappear mid-run (operator rotation by deletion), the authority
//! lazily regenerates on the next mint and bumps its generation counter;
//! leaf caches keyed by generation then discard everything signed by the
//! old root.
//!
//! The key file is written 0600 inside a 0700 directory. Regeneration holds
//! the write lock for the whole swap, so concurrent mints observe either the
//! old root or the new one, never a half-written state.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const CERT_FILE: &str = "root.crt";
const KEY_FILE: &str = "root.key";

/// Root certificate validity (10 years).
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Leaf certificate validity (7 days).
const LEAF_VALIDITY_DAYS: i64 = 7;

struct Inner {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    generation: u64,
}

/// Long-lived signing authority backing every minted leaf.
pub struct RootAuthority {
    dir: PathBuf,
    inner: RwLock<Inner>,
}

/// A freshly signed leaf, PEM-encoded, tagged with the root generation that
/// signed it.
pub struct MintedLeaf {
    pub cert_pem: String,
    pub key_pem: String,
    pub generation: u64,
}

impl RootAuthority {
    /// Load the persisted root from `dir`, generating and persisting a new
    /// one if the files are absent or unparsable.
    pub fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;

        let inner = match Self::load_from_disk(&dir) {
            Ok(Some((issuer, cert_pem))) => {
                info!(dir = %dir.display(), "loaded persisted root authority");
                Inner {
                    issuer,
                    cert_pem,
                    generation: 1,
                }
            }
            Ok(None) => Self::generate_and_persist(&dir, 1)?,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "persisted root unusable, regenerating");
                Self::generate_and_persist(&dir, 1)?
            }
        };

        Ok(Self {
            dir,
            inner: RwLock::new(inner),
        })
    }

    /// Current root generation.
    pub fn generation(&self) -> u64 {
        self.inner.read().expect("root authority lock poisoned").generation
    }

    /// Root certificate PEM, for client trust injection.
    pub fn cert_pem(&self) -> String {
        self.inner
            .read()
            .expect("root authority lock poisoned")
            .cert_pem
            .clone()
    }

    /// Re-check the persisted files, regenerating the root if an operator
    /// deleted them. Returns the generation that is current after the check.
    pub fn ensure_current(&self) -> Result<u64> {
        {
            let inner = self.inner.read().expect("root authority lock poisoned");
            if self.dir.join(CERT_FILE).is_file() && self.dir.join(KEY_FILE).is_file() {
                return Ok(inner.generation);
            }
        }

        let mut inner = self.inner.write().expect("root authority lock poisoned");
        // Another mint may have completed the swap while we waited.
        if self.dir.join(CERT_FILE).is_file() && self.dir.join(KEY_FILE).is_file() {
            return Ok(inner.generation);
        }

        warn!(dir = %self.dir.display(), "root authority files deleted, rotating");
        fs::create_dir_all(&self.dir)?;
        fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        *inner = Self::generate_and_persist(&self.dir, inner.generation + 1)?;
        metrics::counter!("intercept_root_rotations_total").increment(1);
        Ok(inner.generation)
    }

    /// Sign a leaf for `host`, regenerating the root first if its files are
    /// gone.
    pub fn mint_leaf(&self, host: &str) -> Result<MintedLeaf> {
        self.ensure_current()?;

        let inner = self.inner.read().expect("root authority lock poisoned");

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| Error::Mint {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(host.to_string()));
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(host.try_into().map_err(
            |e: rcgen::Error| Error::Mint {
                host: host.to_string(),
                message: e.to_string(),
            },
        )?)];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params.signed_by(&leaf_key, &inner.issuer).map_err(|e| Error::Mint {
            host: host.to_string(),
            message: e.to_string(),
        })?;

        debug!(host, generation = inner.generation, "minted leaf certificate");
        metrics::counter!("intercept_leaf_mints_total").increment(1);

        Ok(MintedLeaf {
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
            generation: inner.generation,
        })
    }

    fn load_from_disk(dir: &Path) -> Result<Option<(Issuer<'static, KeyPair>, String)>> {
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);
        if !cert_path.is_file() || !key_path.is_file() {
            return Ok(None);
        }

        let cert_pem = fs::read_to_string(&cert_path)?;
        let key_pem = fs::read_to_string(&key_path)?;

        let key = KeyPair::from_pem(&key_pem).map_err(|e| Error::Authority(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key)
            .map_err(|e| Error::Authority(e.to_string()))?;

        Ok(Some((issuer, cert_pem)))
    }

    fn generate_and_persist(dir: &Path, generation: u64) -> Result<Inner> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| Error::Authority(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("session-gateway interception root".to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

        let cert = params
            .clone()
            .self_signed(&key)
            .map_err(|e| Error::Authority(e.to_string()))?;
        let cert_pem = cert.pem();

        fs::write(dir.join(CERT_FILE), &cert_pem)?;
        write_restricted(&dir.join(KEY_FILE), &key.serialize_pem())?;

        info!(dir = %dir.display(), generation, "root authority generated and persisted");

        Ok(Inner {
            issuer: Issuer::new(params, key),
            cert_pem,
            generation,
        })
    }
}

fn write_restricted(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}
