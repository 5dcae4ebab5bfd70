//! snare - intercepting proxy with replay and injection scanning

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use snare::config::CaSection;
use snare::{
  ApiServer, ApiState, Config, Error, GeneratedAuthority, MemoryRepo, ProxyServer, Recorder,
  Replayer, Repo, Scanner,
};

/// Intercepting HTTP/HTTPS proxy that records, replays and scans traffic
#[derive(Parser)]
#[command(name = "snare", version, about, long_about = None)]
struct Cli {
  /// Path to the configuration file
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Proxy listen address, overrides the configuration
  #[arg(long)]
  proxy_listen: Option<String>,

  /// Admin API listen address, overrides the configuration
  #[arg(long)]
  api_listen: Option<String>,

  /// Print the root certificate clients must trust and exit
  #[arg(long)]
  print_ca: bool,
}

#[tokio::main]
async fn main() -> snare::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("snare=info")),
    )
    .with_writer(std::io::stderr)
    .with_target(false)
    .init();

  let cli = Cli::parse();
  let mut config = match &cli.config {
    Some(path) => Config::from_file(path)?,
    None => Config::default(),
  };
  if let Some(listen) = cli.proxy_listen {
    config.proxy.listen = listen;
  }
  if let Some(listen) = cli.api_listen {
    config.api.listen = listen;
  }

  if cli.print_ca {
    return match &config.ca {
      CaSection::Generated { storage_path } => {
        let authority = GeneratedAuthority::new(storage_path).await?;
        print!("{}", authority.ca_cert_pem());
        Ok(())
      }
      CaSection::Script { .. } => Err(Error::Config(
        "--print-ca needs a generated certificate authority".to_string(),
      )),
    };
  }

  let authority = config.ca.authority().await?;
  let client = config.client.client_builder()?;
  let repo: Arc<dyn Repo> = Arc::new(MemoryRepo::new());

  let proxy = ProxyServer::builder()
    .authority(authority)
    .configure_client({
      let client = client.clone();
      move |_| client
    })
    .recorder(Recorder::new(repo.clone()))
    .bind(config.proxy.listen.as_str())
    .await?
    .start();

  let scanner =
    Scanner::new(Replayer::new(repo).client_builder(client)).baseline(config.scan.baseline);
  let api = ApiServer::bind(config.api.listen.as_str(), ApiState::new(scanner))
    .await?
    .start();

  tokio::signal::ctrl_c().await?;
  tracing::info!("shutting down");
  proxy.shutdown().await;
  api.shutdown().await;
  Ok(())
}
