// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

//! Certificate authority for interception.
//!
//! One root signs short-lived leaf certificates, one per intercepted host.
//! Leaves are cached until they enter the renewal window; rotating the root
//! drops the whole cache so no leaf chains to a retired root.

use crate::error::{ProxyError, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type as aws_any_supported_type;
use rustls::pki_types::PrivateKeyDer;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info};

const CA_COMMON_NAME: &str = "prism-proxy CA";
const CA_ORG_NAME: &str = "prism-proxy";

/// Leaf lifetime. Short on purpose: a leaked leaf key ages out quickly.
const LEAF_VALIDITY: Duration = Duration::from_secs(12 * 60 * 60);
/// A cached leaf this close to expiry is reissued instead of served.
const RENEW_MARGIN: Duration = Duration::from_secs(60 * 60);

struct RootMaterial {
    cert_pem: String,
    key_pair: KeyPair,
}

struct CachedLeaf {
    key: Arc<rustls::sign::CertifiedKey>,
    expires_at: SystemTime,
}

/// Root CA plus the per-host leaf cache.
pub struct CertificateAuthority {
    root: RwLock<RootMaterial>,
    cache: RwLock<HashMap<String, CachedLeaf>>,
    leaf_validity: Duration,
    /// Where the root is persisted; `None` for ephemeral (test) roots.
    persist: Option<(PathBuf, PathBuf)>,
}

impl CertificateAuthority {
    /// Loads the root from the given paths, or generates and persists a new
    /// one if either file is missing.
    pub async fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        Self::load_or_generate_with_validity(cert_path, key_path, LEAF_VALIDITY).await
    }

    /// Same as `load_or_generate` with an explicit leaf lifetime.
    pub async fn load_or_generate_with_validity(
        cert_path: &Path,
        key_path: &Path,
        leaf_validity: Duration,
    ) -> Result<Arc<Self>> {
        let root = if cert_path.exists() && key_path.exists() {
            info!(cert = %cert_path.display(), "loading existing CA root");
            Self::load_root(cert_path, key_path).await?
        } else {
            info!(cert = %cert_path.display(), "generating new CA root");
            let root = Self::generate_root()?;
            Self::persist_root(&root, cert_path, key_path).await?;
            root
        };
        Ok(Arc::new(Self {
            root: RwLock::new(root),
            cache: RwLock::new(HashMap::new()),
            leaf_validity,
            persist: Some((cert_path.to_path_buf(), key_path.to_path_buf())),
        }))
    }

    /// In-memory root that never touches disk.
    pub fn ephemeral() -> Result<Arc<Self>> {
        Self::ephemeral_with_validity(LEAF_VALIDITY)
    }

    pub fn ephemeral_with_validity(leaf_validity: Duration) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            root: RwLock::new(Self::generate_root()?),
            cache: RwLock::new(HashMap::new()),
            leaf_validity,
            persist: None,
        }))
    }

    async fn load_root(cert_path: &Path, key_path: &Path) -> Result<RootMaterial> {
        let cert_pem = fs::read_to_string(cert_path)
            .await
            .map_err(|e| ProxyError::Ca(format!("failed to read CA cert: {e}")))?;
        let key_pem = fs::read_to_string(key_path)
            .await
            .map_err(|e| ProxyError::Ca(format!("failed to read CA key: {e}")))?;
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| ProxyError::Ca(format!("failed to parse CA key pair: {e}")))?;
        Ok(RootMaterial { cert_pem, key_pair })
    }

    fn generate_root() -> Result<RootMaterial> {
        let params = ca_params()?;
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(ca_err)?;
        let cert = params.self_signed(&key_pair).map_err(ca_err)?;
        Ok(RootMaterial {
            cert_pem: cert.pem(),
            key_pair,
        })
    }

    async fn persist_root(root: &RootMaterial, cert_path: &Path, key_path: &Path) -> Result<()> {
        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(cert_path, &root.cert_pem).await?;
        fs::write(key_path, root.key_pair.serialize_pem()).await?;
        Ok(())
    }

    /// Issues (or serves from cache) a leaf for the given host.
    ///
    /// Cached leaves are reused until they are within `RENEW_MARGIN` of
    /// expiry; two calls for the same fresh host return the same `Arc`.
    pub fn issue_leaf(&self, host: &str) -> Result<Arc<rustls::sign::CertifiedKey>> {
        let now = SystemTime::now();
        {
            let cache = read_lock(&self.cache);
            if let Some(leaf) = cache.get(host) {
                if leaf.expires_at > now + RENEW_MARGIN {
                    return Ok(leaf.key.clone());
                }
                debug!(host, "cached leaf inside renewal window, reissuing");
            }
        }

        let key = self.sign_leaf(host)?;
        let mut cache = write_lock(&self.cache);
        // A racing issuer may have refilled the entry; last writer wins and
        // both leaves are valid.
        cache.insert(
            host.to_string(),
            CachedLeaf {
                key: key.clone(),
                expires_at: now + self.leaf_validity,
            },
        );
        Ok(key)
    }

    fn sign_leaf(&self, host: &str) -> Result<Arc<rustls::sign::CertifiedKey>> {
        let mut params = CertificateParams::new(vec![host.to_string()]).map_err(ca_err)?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);
        params.use_authority_key_identifier_extension = false;
        let not_before = time::OffsetDateTime::now_utc() - time::Duration::minutes(5);
        params.not_before = not_before;
        params.not_after = not_before + time::Duration::minutes(5) + self.leaf_validity;

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(ca_err)?;

        let root = read_lock(&self.root);
        let issuer = Issuer::new(ca_params()?, &root.key_pair);
        let cert = params.signed_by(&key_pair, &issuer).map_err(ca_err)?;
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();
        drop(root);

        let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Ca(format!("leaf PEM reparse failed: {e}")))?;
        let leaf_cert = certs
            .into_iter()
            .next()
            .ok_or_else(|| ProxyError::Ca("no certificate in generated leaf PEM".into()))?;

        let keys: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Ca(format!("leaf key reparse failed: {e}")))?;
        let leaf_key = keys
            .into_iter()
            .next()
            .ok_or_else(|| ProxyError::Ca("no private key in generated leaf PEM".into()))?;

        let signer = aws_any_supported_type(&PrivateKeyDer::from(leaf_key))
            .map_err(|e| ProxyError::Ca(format!("leaf key rejected by rustls: {e}")))?;
        Ok(Arc::new(rustls::sign::CertifiedKey::new(
            vec![leaf_cert],
            signer,
        )))
    }

    /// Replaces the root and invalidates every cached leaf. Existing TLS
    /// sessions keep their handshaken certificates; new handshakes chain to
    /// the new root.
    pub async fn rotate_root(&self) -> Result<()> {
        let root = Self::generate_root()?;
        if let Some((cert_path, key_path)) = &self.persist {
            Self::persist_root(&root, cert_path, key_path).await?;
        }
        *write_lock(&self.root) = root;
        write_lock(&self.cache).clear();
        info!("CA root rotated, leaf cache cleared");
        Ok(())
    }

    /// Root certificate in PEM form, for client trust-store installation.
    pub fn ca_cert_pem(&self) -> String {
        read_lock(&self.root).cert_pem.clone()
    }
}

fn ca_params() -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![]).map_err(ca_err)?;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    params
        .distinguished_name
        .push(DnType::OrganizationName, CA_ORG_NAME);
    Ok(params)
}

fn ca_err(e: rcgen::Error) -> ProxyError {
    ProxyError::Ca(e.to_string())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
