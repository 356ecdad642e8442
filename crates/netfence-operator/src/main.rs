//! netfence operator - projects SecurityPolicy resources onto a networking backend

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use netfence_common::crd::SecurityPolicy;
use netfence_common::telemetry::{init_telemetry, TelemetryConfig};
use netfence_operator::config::Cli;
use netfence_operator::controller::{error_policy, reconcile, run_garbage_collector, PolicyContext};
use netfence_policy::{HttpBackend, PolicyBuilder, SecurityPolicyService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&SecurityPolicy::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "netfence-operator".to_string(),
        ..Default::default()
    })?;

    cli.validate().map_err(|e| anyhow::anyhow!(e))?;
    run_controller(cli).await
}

/// Install the SecurityPolicy CRD with server-side apply
///
/// Keeps the installed schema in step with the running operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("netfence-controller").force();

    tracing::info!("Installing SecurityPolicy CRD...");
    crds.patch(
        "securitypolicies.netfence.dev",
        &params,
        &Patch::Apply(&SecurityPolicy::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install SecurityPolicy CRD: {}", e))?;

    Ok(())
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!(cluster = %cli.cluster, domain = %cli.domain, "starting netfence operator");

    let backend = Arc::new(HttpBackend::new(cli.backend_config())?);
    let builder = PolicyBuilder::new(cli.cluster.clone(), cli.domain.clone());

    // Stores must be warm before the first reconcile reads them
    let service = SecurityPolicyService::initialize(backend, builder)
        .await
        .map_err(|e| anyhow::anyhow!("initial backend sync failed: {}", e))?;
    let service = Arc::new(service);

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;
    ensure_crd_installed(&client).await?;

    let ctx = Arc::new(PolicyContext::new(client.clone(), service));
    let policies: Api<SecurityPolicy> = Api::all(client);

    tracing::info!("Starting SecurityPolicy controller");
    let controller = Controller::new(policies, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "SecurityPolicy reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "SecurityPolicy reconciliation error");
                }
            }
        });

    let gc = run_garbage_collector(ctx, cli.gc_interval());

    tokio::select! {
        _ = controller => {
            tracing::info!("SecurityPolicy controller completed");
        }
        _ = gc => {
            tracing::info!("Garbage collector stopped");
        }
    }

    Ok(())
}
