//! The controller daemon.
//!
//! First boot generates the API auth key, creates the `system` deployment
//! and runs the bootstrap plugins, then exits so the operator can record
//! the key. Every boot after that serves the HTTP API.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;

use stevedore_backend_docker::DockerBackend;
use stevedore_engine::default_plugins;
use stevedore_runtime::{Config, Controller, SdutilDiscovery, logging, resolve_host_ip};

#[derive(Parser)]
#[command(
    name = "stevedored",
    about = "Single-host container deployment controller"
)]
struct Cli {
    /// Address the HTTP API binds to (host:port).
    #[arg(long)]
    bind: Option<String>,

    /// Configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "daemon failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    let host_ip = resolve_host_ip(&config)?;
    let backend = Arc::new(DockerBackend::connect(config.docker_host.as_deref())?);
    let discovery = Arc::new(SdutilDiscovery::new(host_ip.clone()));
    let controller = Arc::new(Controller::new(
        config,
        host_ip,
        backend,
        discovery,
        default_plugins(),
    )?);

    let (auth_key, generated) = controller.ensure_auth_key()?;
    if generated {
        println!("Generated auth key: {auth_key}");
    }

    // First boot only initializes; the operator restarts to serve.
    if controller.bootstrap_system().await? {
        println!("Initialized system.");
        println!("Auth key is: {auth_key}");
        return Ok(());
    }

    controller.register_self().await?;
    stevedore_api::serve(controller).await?;
    Ok(())
}
