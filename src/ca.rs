//! Certificate issuance for intercepted TLS connections.
//!
//! The proxy only needs one capability: a certificate and key a client will
//! accept for a given host. [`GeneratedAuthority`] signs them in process with
//! a locally stored root, [`ScriptAuthority`] delegates to an external
//! program that writes them to fixed paths.
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use crate::errors::{Error, Result};
use crate::tls;

/// Leaf validity, one year.
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Root validity, ten years.
const ROOT_TTL_DAYS: i64 = 3650;
/// Leaves are backdated to tolerate clock skew.
const NOT_BEFORE_OFFSET_SECS: i64 = 60;
const CACHE_CAPACITY: u64 = 1000;

const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";

/// A server identity for one host, leaf certificate first.
#[derive(Debug)]
pub struct IssuedCertificate {
  /// certificate chain, leaf first
  pub chain: Vec<CertificateDer<'static>>,
  /// private key of the leaf
  pub key: PrivateKeyDer<'static>,
}

impl Clone for IssuedCertificate {
  fn clone(&self) -> Self {
    IssuedCertificate {
      chain: self.chain.clone(),
      key: self.key.clone_key(),
    }
  }
}

/// Issues certificates the intercepted client trusts.
///
/// A failure is fatal only to the connection that asked for it.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
  /// Certificate and key for `host`, a DNS name or an IP literal.
  async fn issue_certificate(&self, host: &str) -> Result<IssuedCertificate>;
}

/// Signs per-host certificates with a root stored under a directory.
///
/// The root is created on first use and reused afterwards; the directory
/// holds `ca_cert.pem` and `ca_key.pem`. Clients must trust
/// [`GeneratedAuthority::ca_cert_pem`].
pub struct GeneratedAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  storage_path: PathBuf,
  leaves: Cache<String, Arc<IssuedCertificate>>,
}

impl GeneratedAuthority {
  /// Load the root stored under `storage_path`, generating it when missing.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    tokio::fs::create_dir_all(&storage_path).await?;
    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);
    let (cert_pem, key_pair) = if cert_path.exists() && key_path.exists() {
      let cert_pem = tokio::fs::read_to_string(&cert_path).await?;
      let key_pem = tokio::fs::read_to_string(&key_path).await?;
      let key_pair = KeyPair::from_pem(&key_pem)
        .map_err(|e| Error::certificate_error(format!("invalid root key: {}", e)))?;
      tracing::debug!("loaded root certificate from {}", cert_path.display());
      (cert_pem, key_pair)
    } else {
      let (cert_pem, key_pair) = generate_root()?;
      tokio::fs::write(&cert_path, cert_pem.as_bytes()).await?;
      tokio::fs::write(&key_path, key_pair.serialize_pem().as_bytes()).await?;
      tracing::info!("generated root certificate {}", cert_path.display());
      (cert_pem, key_pair)
    };
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("no certificate in root PEM"))?
      .map_err(|e| Error::certificate_error(format!("invalid root PEM: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("unusable root certificate: {}", e)))?;
    let leaves = Cache::builder()
      .max_capacity(CACHE_CAPACITY)
      .time_to_live(std::time::Duration::from_secs((LEAF_TTL_SECS / 2) as u64))
      .build();
    Ok(GeneratedAuthority {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem,
      storage_path,
      leaves,
    })
  }

  /// The root certificate in PEM form, for installing into clients.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Where the root certificate is stored.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }

  fn sign_leaf(&self, host: &str) -> Result<IssuedCertificate> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    params.subject_alt_names = match host.parse::<IpAddr>() {
      Ok(ip) => vec![SanType::IpAddress(ip)],
      Err(_) => vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate_error(format!("invalid host name {:?}", host))
      })?)],
    };
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET_SECS);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);
    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("key generation failed: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("signing {} failed: {}", host, e)))?;
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|e| Error::certificate_error(format!("unusable leaf key: {}", e)))?;
    Ok(IssuedCertificate {
      chain: vec![CertificateDer::from(cert.der().to_vec()), self.ca_cert_der.clone()],
      key,
    })
  }
}

#[async_trait]
impl CertificateAuthority for GeneratedAuthority {
  async fn issue_certificate(&self, host: &str) -> Result<IssuedCertificate> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Some(cached) = self.leaves.get(host).await {
      return Ok(cached.as_ref().clone());
    }
    let issued = self.sign_leaf(host)?;
    tracing::debug!("issued certificate for {}", host);
    self
      .leaves
      .insert(host.to_string(), Arc::new(issued.clone()))
      .await;
    Ok(issued)
  }
}

fn generate_root() -> Result<(String, KeyPair)> {
  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, "snare interception CA");
  dn.push(DnType::OrganizationName, "snare");
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
  let now = OffsetDateTime::now_utc();
  params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET_SECS);
  params.not_after = now + Duration::days(ROOT_TTL_DAYS);
  let key_pair = KeyPair::generate()
    .map_err(|e| Error::certificate_error(format!("key generation failed: {}", e)))?;
  let cert = params
    .self_signed(&key_pair)
    .map_err(|e| Error::certificate_error(format!("root generation failed: {}", e)))?;
  Ok((cert.pem(), key_pair))
}

/// Runs `<script> <host> <token>` and loads what it wrote to fixed paths.
///
/// Calls are serialized since every run overwrites the same files.
#[derive(Debug)]
pub struct ScriptAuthority {
  script: PathBuf,
  cert_path: PathBuf,
  key_path: PathBuf,
  lock: Mutex<()>,
}

impl ScriptAuthority {
  /// Use `script`, which writes the chain to `cert_path` and the key to
  /// `key_path`.
  pub fn new(
    script: impl Into<PathBuf>,
    cert_path: impl Into<PathBuf>,
    key_path: impl Into<PathBuf>,
  ) -> Self {
    ScriptAuthority {
      script: script.into(),
      cert_path: cert_path.into(),
      key_path: key_path.into(),
      lock: Mutex::new(()),
    }
  }
}

#[async_trait]
impl CertificateAuthority for ScriptAuthority {
  async fn issue_certificate(&self, host: &str) -> Result<IssuedCertificate> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || host.starts_with('-') {
      return Err(Error::certificate_error(format!("refusing host {:?}", host)));
    }
    let _guard = self.lock.lock().await;
    let token = rand::thread_rng().gen::<u32>();
    let output = tokio::process::Command::new(&self.script)
      .arg(host)
      .arg(token.to_string())
      .output()
      .await
      .map_err(|e| {
        Error::certificate_error(format!("failed to run {}: {}", self.script.display(), e))
      })?;
    if !output.status.success() {
      return Err(Error::certificate_error(format!(
        "{} {} exited with {}: {}",
        self.script.display(),
        host,
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
      )));
    }
    let chain = tls::load_cert_chain(&self.cert_path)?;
    let key = tls::load_private_key(&self.key_path)?;
    tracing::debug!("{} issued certificate for {}", self.script.display(), host);
    Ok(IssuedCertificate { chain, key })
  }
}
