use anyhow::{bail, Context};
use clap::Parser;
use csi_proto::v1::{
  controller_server::ControllerServer, identity_server::IdentityServer, node_server::NodeServer,
};
use ebs_cloud::{Ec2Cloud, Metadata, DEFAULT_METADATA_ENDPOINT};
use ebs_csi_driver::Driver;
use mount_utils::OsMounter;
use std::{
  fs,
  path::{Path, PathBuf},
  sync::Arc,
};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ebs-csi-driver", version, about = "CSI driver for Amazon Elastic Block Store")]
struct Args {
  /// CSI endpoint, e.g. unix:///var/lib/csi/sockets/pluginproxy/csi.sock
  #[arg(long)]
  endpoint: Option<String>,
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  // Unknown flags exit 2 through clap; a missing endpoint is startup
  // misconfiguration and exits 1.
  let args = Args::parse();
  let Some(endpoint) = args.endpoint else {
    eprintln!("--endpoint is required");
    std::process::exit(1);
  };

  if let Err(e) = run(&endpoint).await {
    error!("driver failed: {e:#}");
    std::process::exit(1);
  }
}

async fn run(endpoint: &str) -> anyhow::Result<()> {
  let socket_path = parse_endpoint(endpoint)?;

  let metadata = Metadata::probe(DEFAULT_METADATA_ENDPOINT)
    .await
    .context("could not read instance metadata")?;
  let cloud = Arc::new(Ec2Cloud::new(metadata.region()).await);
  let driver = Driver::new(cloud, Arc::new(OsMounter::new()), metadata);

  if let Some(parent) = socket_path.parent() {
    fs::create_dir_all(parent)
      .with_context(|| format!("could not create socket directory {}", parent.display()))?;
  }
  // A leftover socket from a previous run would fail the bind.
  match fs::remove_file(&socket_path) {
    Ok(()) => info!(path = %socket_path.display(), "removed stale socket"),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
    Err(e) => return Err(e).context("could not remove stale socket"),
  }

  let listener = UnixListener::bind(&socket_path)
    .with_context(|| format!("could not bind {}", socket_path.display()))?;
  info!(path = %socket_path.display(), "listening");

  Server::builder()
    .add_service(IdentityServer::new(driver.clone()))
    .add_service(ControllerServer::new(driver.clone()))
    .add_service(NodeServer::new(driver))
    .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown_signal())
    .await
    .context("server error")?;

  info!("shut down cleanly");
  Ok(())
}

fn parse_endpoint(endpoint: &str) -> anyhow::Result<PathBuf> {
  let path = endpoint
    .strip_prefix("unix://")
    .or_else(|| endpoint.strip_prefix("unix:"))
    .with_context(|| format!("endpoint {endpoint:?} must be a unix:// URL"))?;

  if path.is_empty() {
    bail!("endpoint {endpoint:?} carries no socket path");
  }

  Ok(Path::new(path).to_path_buf())
}

async fn shutdown_signal() {
  use tokio::signal::unix::{signal, SignalKind};

  let terminate = async {
    match signal(SignalKind::terminate()) {
      Ok(mut sigterm) => {
        sigterm.recv().await;
      }
      Err(e) => {
        error!("could not install SIGTERM handler: {e}");
        std::future::pending::<()>().await;
      }
    }
  };

  tokio::select! {
    _ = tokio::signal::ctrl_c() => {},
    _ = terminate => {},
  }
  info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn endpoint_accepts_unix_urls() {
    assert_eq!(
      parse_endpoint("unix:///csi/csi.sock").unwrap(),
      PathBuf::from("/csi/csi.sock")
    );
    assert_eq!(
      parse_endpoint("unix:/csi/csi.sock").unwrap(),
      PathBuf::from("/csi/csi.sock")
    );
  }

  #[test]
  fn endpoint_rejects_other_schemes() {
    assert!(parse_endpoint("tcp://127.0.0.1:10000").is_err());
    assert!(parse_endpoint("unix://").is_err());
    assert!(parse_endpoint("/csi/csi.sock").is_err());
  }
}
