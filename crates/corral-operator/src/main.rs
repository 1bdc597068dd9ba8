//! Corral Operator - converges platform components on a Kubernetes cluster

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use corral_common::crd::all_crds;
use corral_common::kube_utils::create_client;
use corral_common::telemetry::{init_telemetry, TelemetryConfig};
use corral_common::{OperatorConfig, FIELD_MANAGER};
use corral_operator::controller_runner::build_controllers;

/// Corral - CRD-driven operator for platform component lifecycle
#[derive(Parser, Debug)]
#[command(name = "corral", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Path to a kubeconfig; in-cluster configuration is used when unset
    #[arg(long, env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Emit human-readable logs instead of JSON
    #[arg(long, env = "CORRAL_LOG_PRETTY", global = true)]
    pretty_logs: bool,

    #[command(flatten)]
    config: OperatorConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Installs the corral CRDs and reconciles every CorralComponent and
    /// CorralVolume in the configured namespace until interrupted.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in all_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "corral-operator".to_string(),
        json: !cli.pretty_logs,
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.config, cli.kubeconfig).await,
    }
}

/// Ensure all corral CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply,
/// so the stored schema always matches the running operator.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("CRD without a name"))?;
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("All corral CRDs installed/updated");
    Ok(())
}

async fn run_controller(config: OperatorConfig, kubeconfig: Option<PathBuf>) -> anyhow::Result<()> {
    let client = create_client(kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, cancelling in-flight passes");
                signal_token.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Failed to listen for interrupt"),
        }
    });

    tracing::info!("Starting controllers:");
    let controllers = build_controllers(client, Arc::new(config), shutdown);
    futures::future::select_all(controllers).await;

    tracing::info!("Controller stopped");
    Ok(())
}
