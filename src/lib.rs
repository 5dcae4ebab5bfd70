#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # snare
//!
//! An intercepting HTTP/HTTPS proxy that records every exchange it relays,
//! replays recorded requests and probes them for quote injection.
//!
//! - [`ProxyServer`] accepts plain proxy requests and `CONNECT` tunnels. A
//!   tunnel is terminated with a certificate from a [`CertificateAuthority`]
//!   and its single request is relayed to the origin over a second TLS
//!   connection.
//! - [`Recorder`] turns each relayed exchange into a
//!   [`RequestRecord`](record::RequestRecord) and a
//!   [`ResponseRecord`](record::ResponseRecord) and saves them through a
//!   [`Repo`].
//! - [`Replayer`] sends a stored request again; [`Scanner`] mutates every
//!   parameter, cookie and header of a stored request with `'` and `"` and
//!   reports the first one that changes the response.
//! - [`api`] exposes all of it over HTTP.
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use snare::{GeneratedAuthority, MemoryRepo, ProxyServer, Recorder};
//!
//! # async fn run() -> snare::Result<()> {
//! let authority = GeneratedAuthority::new(".snare-ca").await?;
//! println!("trust this root:\n{}", authority.ca_cert_pem());
//! let repo = Arc::new(MemoryRepo::new());
//! let handle = ProxyServer::builder()
//!   .authority(Arc::new(authority))
//!   .recorder(Recorder::new(repo))
//!   .bind("127.0.0.1:8080")
//!   .await?
//!   .start();
//! // ...
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Scanning a recorded request
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use snare::{MemoryRepo, Replayer, Scanner};
//!
//! # async fn run() -> snare::Result<()> {
//! let repo = Arc::new(MemoryRepo::new());
//! let scanner = Scanner::new(Replayer::new(repo));
//! match scanner.scan(1).await? {
//!   Some(finding) => println!("{}", finding),
//!   None => println!("nothing found"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Redirect Policies
//!
//! The proxy never follows redirects. Replays and scan probes follow up to
//! 10 by default; use a [`redirect::Policy`][redirect] on the
//! [`ClientBuilder`] given to [`Replayer::client_builder`] to change that.
//!
/// Administrative HTTP API
pub mod api;
mod body;
/// Certificate issuance
pub mod ca;
/// Record conversion and recording
pub mod capture;
mod client;
/// Configuration file
pub mod config;
mod connector;
mod cookies;
mod errors;
/// record info
pub mod record;
/// Redirect Handling
pub mod redirect;
mod replay;
/// Record storage
pub mod repo;
mod request;
mod response;
/// Injection scanning
pub mod scan;
mod server;
mod socket;
/// TLS helpers
pub mod tls;

pub use api::{ApiServer, ApiState};
pub use body::Body;
pub use ca::{CertificateAuthority, GeneratedAuthority, IssuedCertificate, ScriptAuthority};
pub use capture::Recorder;
pub use client::{Client, ClientBuilder};
pub use config::Config;
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, Result};
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use replay::Replayer;
pub use repo::{MemoryRepo, Repo};
pub use request::Request;
pub use response::Response;
pub use scan::{BaselinePolicy, Finding, Scanner};
pub use server::{ProxyServer, ProxyServerBuilder, ServerHandle};
pub use socket::Socket;
pub use tls::Certificate;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
/// Written to the client once a `CONNECT` is accepted.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
