//! Configuration file handling.
//!
//! Every section and key is optional; what the file leaves out keeps its
//! default. See `config/default.toml` for the full set.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ca::{CertificateAuthority, GeneratedAuthority, ScriptAuthority};
use crate::client::{Client, ClientBuilder};
use crate::errors::{Error, Result};
use crate::redirect::Policy;
use crate::scan::BaselinePolicy;
use crate::tls::Certificate;

/// The whole configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// proxy listener
  pub proxy: ProxySection,
  /// admin API listener
  pub api: ApiSection,
  /// certificate authority
  pub ca: CaSection,
  /// origin client used for proxying, replay and scans
  pub client: ClientSection,
  /// scan engine
  pub scan: ScanSection,
}

/// `[proxy]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
  /// listen address
  pub listen: String,
}

impl Default for ProxySection {
  fn default() -> Self {
    ProxySection {
      listen: "0.0.0.0:8080".to_string(),
    }
  }
}

/// `[api]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
  /// listen address
  pub listen: String,
}

impl Default for ApiSection {
  fn default() -> Self {
    ApiSection {
      listen: "0.0.0.0:8000".to_string(),
    }
  }
}

/// `[ca]`, selected by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CaSection {
  /// in-process root stored under `storage_path`
  Generated {
    /// directory of `ca_cert.pem` and `ca_key.pem`
    #[serde(default = "default_storage_path")]
    storage_path: PathBuf,
  },
  /// external issuance script
  Script {
    /// program run as `<script> <host> <token>`
    #[serde(default = "default_script")]
    script: PathBuf,
    /// where the script writes the certificate chain
    #[serde(default = "default_cert_path")]
    cert_path: PathBuf,
    /// where the script writes the key
    #[serde(default = "default_key_path")]
    key_path: PathBuf,
  },
}

fn default_storage_path() -> PathBuf {
  PathBuf::from(".snare-ca")
}

fn default_script() -> PathBuf {
  PathBuf::from("/certs/gen_cert.sh")
}

fn default_cert_path() -> PathBuf {
  PathBuf::from("/certs/nck.crt")
}

fn default_key_path() -> PathBuf {
  PathBuf::from("/certs/cert.key")
}

impl Default for CaSection {
  fn default() -> Self {
    CaSection::Generated {
      storage_path: default_storage_path(),
    }
  }
}

impl CaSection {
  /// Build the configured authority.
  pub async fn authority(&self) -> Result<Arc<dyn CertificateAuthority>> {
    Ok(match self {
      CaSection::Generated { storage_path } => Arc::new(GeneratedAuthority::new(storage_path).await?),
      CaSection::Script {
        script,
        cert_path,
        key_path,
      } => Arc::new(ScriptAuthority::new(script, cert_path, key_path)),
    })
  }
}

/// `[client]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
  /// bound on one whole exchange, `0` disables it
  pub timeout_secs: u64,
  /// bound on connecting and the TLS handshake, `0` disables it
  pub connect_timeout_secs: u64,
  /// redirects followed by replays and probes, `0` follows none
  pub max_redirects: usize,
  /// accept any origin certificate
  pub accept_invalid_certs: bool,
  /// PEM files with roots trusted next to the platform roots
  pub extra_root_certs: Vec<PathBuf>,
}

impl Default for ClientSection {
  fn default() -> Self {
    ClientSection {
      timeout_secs: 30,
      connect_timeout_secs: 10,
      max_redirects: 10,
      accept_invalid_certs: false,
      extra_root_certs: vec![],
    }
  }
}

fn seconds(secs: u64) -> Option<Duration> {
  (secs > 0).then(|| Duration::from_secs(secs))
}

impl ClientSection {
  /// A client builder with these settings; the extra roots are read here.
  pub fn client_builder(&self) -> Result<ClientBuilder> {
    let mut builder = Client::builder()
      .timeout(seconds(self.timeout_secs))
      .connect_timeout(seconds(self.connect_timeout_secs))
      .redirect(Policy::limited(self.max_redirects))
      .danger_accept_invalid_certs(self.accept_invalid_certs);
    for path in &self.extra_root_certs {
      for cert in Certificate::from_pem_file(path)? {
        builder = builder.add_root_certificate(cert);
      }
    }
    Ok(builder)
  }
}

/// `[scan]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSection {
  /// what probe responses are compared against
  pub baseline: BaselinePolicy,
}

impl Config {
  /// Parse a TOML document.
  pub fn from_toml(content: &str) -> Result<Config> {
    toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
  }

  /// Read and parse the file at `path`.
  pub fn from_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
      .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
    Self::from_toml(&content)
  }
}
