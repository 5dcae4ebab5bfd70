//! TLS configuration for both legs of an intercepted connection: the
//! client-facing server side presenting issued certificates, and the
//! origin-facing client side.
//!
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls;
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, RootCertStore,
  SignatureScheme,
};

use crate::errors::{Error, Result};

/// Represents a server X509 certificate that an origin connection trusts in
/// addition to the platform roots.
#[derive(Clone, Debug)]
pub struct Certificate {
  der: CertificateDer<'static>,
}

impl Certificate {
  /// Create a `Certificate` from a binary DER encoded certificate
  pub fn from_der(der: &[u8]) -> Certificate {
    Certificate {
      der: CertificateDer::from(der.to_vec()),
    }
  }

  /// Create a collection of `Certificate`s from a PEM encoded certificate bundle.
  /// Example byte sources may be `.crt`, `.cer` or `.pem` files.
  pub fn from_pem_bundle(pem_bundle: &[u8]) -> Result<Vec<Certificate>> {
    let mut reader = pem_bundle;
    let certs = read_pem_certs(&mut reader)?;
    if certs.is_empty() {
      return Err(Error::certificate_error("no certificate found in PEM data"));
    }
    Ok(certs.into_iter().map(|der| Certificate { der }).collect())
  }

  /// Load every certificate of a PEM file.
  pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Vec<Certificate>> {
    let pem = std::fs::read(path.as_ref()).map_err(|e| {
      Error::certificate_error(format!("failed to read {}: {}", path.as_ref().display(), e))
    })?;
    Self::from_pem_bundle(&pem)
  }

  pub(crate) fn add_to_tls(&self, root_cert_store: &mut RootCertStore) -> Result<()> {
    root_cert_store.add(self.der.clone())?;
    Ok(())
  }
}

fn read_pem_certs(reader: &mut impl BufRead) -> Result<Vec<CertificateDer<'static>>> {
  rustls_pemfile::certs(reader)
    .map(|result| {
      result.map_err(|e| Error::certificate_error(format!("invalid certificate encoding: {e}")))
    })
    .collect()
}

/// Load a certificate chain, leaf first, from a PEM file.
pub fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
  let pem = std::fs::read(path)
    .map_err(|e| Error::certificate_error(format!("failed to read {}: {}", path.display(), e)))?;
  let chain = read_pem_certs(&mut pem.as_slice())?;
  if chain.is_empty() {
    return Err(Error::certificate_error(format!(
      "no certificate found in {}",
      path.display()
    )));
  }
  Ok(chain)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
  let pem = std::fs::read(path)
    .map_err(|e| Error::certificate_error(format!("failed to read {}: {}", path.display(), e)))?;
  rustls_pemfile::private_key(&mut pem.as_slice())
    .map_err(|e| Error::certificate_error(format!("invalid key in {}: {}", path.display(), e)))?
    .ok_or_else(|| Error::certificate_error(format!("no private key found in {}", path.display())))
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
  rustls::crypto::CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Server side configuration presenting `cert_chain` to the intercepted
/// client.
pub(crate) fn server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<Arc<rustls::ServerConfig>> {
  let mut config = rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| Error::tls_error(format!("failed to create TLS config: {}", e)))?;
  // only one HTTP/1.1 exchange is relayed per tunnel
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(Arc::new(config))
}

/// Client side configuration for origin connections.
///
/// Trusts the platform roots plus `extra_roots`; with `accept_invalid_certs`
/// every server certificate is accepted.
pub(crate) fn client_config(
  extra_roots: &[Certificate],
  accept_invalid_certs: bool,
) -> Result<Arc<rustls::ClientConfig>> {
  let builder = rustls::ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("invalid TLS versions: {}", e)))?;
  let config = if accept_invalid_certs {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  } else {
    let mut root_cert_store = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
      tracing::debug!("skipping native root certificates: {}", err);
    }
    let (added, ignored) = root_cert_store.add_parsable_certificates(native.certs);
    tracing::debug!("loaded {} native roots, ignored {}", added, ignored);
    for cert in extra_roots {
      cert.add_to_tls(&mut root_cert_store)?;
    }
    builder
      .with_root_certificates(root_cert_store)
      .with_no_client_auth()
  };
  Ok(Arc::new(config))
}

/// Server name for the origin handshake; IP literals are accepted.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
  let host = host.trim_start_matches('[').trim_end_matches(']');
  ServerName::try_from(host.to_owned())
    .map_err(|e| Error::tls_error(format!("invalid server name {}: {}", host, e)))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    provider()
      .signature_verification_algorithms
      .supported_schemes()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn server_names_accept_hosts_and_ip_literals() {
    assert!(server_name("example.test").is_ok());
    assert!(matches!(
      server_name("127.0.0.1").unwrap(),
      ServerName::IpAddress(_)
    ));
    assert!(matches!(
      server_name("[::1]").unwrap(),
      ServerName::IpAddress(_)
    ));
  }

  #[test]
  fn empty_pem_bundle_is_rejected() {
    assert!(Certificate::from_pem_bundle(b"not a certificate").is_err());
  }

  #[test]
  fn client_config_without_verification_builds() {
    assert!(client_config(&[], true).is_ok());
  }
}
