//! Conveyor: a Kubernetes operator that runs user-declared workflows as
//! DAGs of batch jobs.

use anyhow::Result;
use clap::Parser;
use conveyor_core::job::JobFactory;
use kube::CustomResourceExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

mod cluster;
mod config;
mod handlers;
mod monitor;
mod watch;

#[cfg(test)]
mod testutil;

use cluster::KubeClusterClient;
use config::OperatorConfig;
use handlers::Reconciler;
use monitor::MonitorRegistry;
use watch::Operator;

#[derive(Parser, Debug)]
#[command(name = "conveyor")]
#[command(about = "Runs workflow resources as DAGs of batch jobs", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "conveyor.toml")]
    config: PathBuf,

    /// Print the Workflow CustomResourceDefinition as YAML and exit
    #[arg(long)]
    print_crd: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor=info".into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    if args.print_crd {
        print!("{}", serde_yaml::to_string(&conveyor_core::Workflow::crd())?);
        return Ok(());
    }

    let config = OperatorConfig::load(&args.config)?;
    tracing::info!("Starting Conveyor workflow operator");

    let client = kube::Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let cluster = Arc::new(KubeClusterClient::new(client.clone()));
    let reconciler = Arc::new(Reconciler::new(
        cluster.clone(),
        JobFactory::new(config.backoff_limit),
    ));
    let monitors = Arc::new(MonitorRegistry::new(cluster, config.monitor_config()));

    let operator = Operator::new(reconciler, monitors.clone());
    let mut run = tokio::spawn(operator.run(client));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, shutting down");
        }
        result = &mut run => {
            match result {
                Ok(Ok(())) => tracing::info!("Watch streams ended"),
                Ok(Err(e)) => tracing::error!("Operator error: {}", e),
                Err(e) => tracing::error!("Operator task panicked: {}", e),
            }
        }
    }

    run.abort();
    monitors.shutdown();
    tracing::info!("Workflow operator shutdown complete");

    Ok(())
}
