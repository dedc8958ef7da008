//! OrderTask Controller
//!
//! Runs the steps of every OrderTask strictly one after another inside a
//! single pod.
//!
//! Architecture:
//! - Configuration: flags with environment fallbacks
//! - Bootstrap: registers the OrderTask resource type once at startup
//! - Repositories: trait-based access to pods, tasks and CRDs
//! - Builder: turns a task into its pod, resolving image defaults
//! - Reconciler: advances each pod's order marker from container exit codes
//!
//! Step containers wait on a downward-API file mirroring the pod's order
//! annotation; the controller is the only writer of that annotation.

mod bootstrap;
mod builder;
mod config;
mod error;
mod reconciler;
mod repository;

use anyhow::{Context as _, Result};
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{Controller, controller, watcher};
use kube::{Api, Client, CustomResourceExt};
use ordertask_core::domain::task::OrderTask;
use ordertask_registry::{ImageCache, ImageResolver, RegistryClient};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bootstrap::install_crd;
use crate::builder::{MANAGED_BY_LABEL, MANAGER, PodBuilder};
use crate::config::{Args, Config};
use crate::reconciler::{Context, error_policy, reconcile};
use crate::repository::{KubeCrdRepository, KubePodRepository, KubeTaskRepository};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ordertask_controller=info,ordertask_registry=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting OrderTask Controller");

    let config = Config::from_args(Args::parse()).context("Invalid configuration")?;
    info!(
        "Loaded configuration: namespace={}, platform={}, wait_mode={}",
        config.namespace.as_deref().unwrap_or("<all>"),
        config.platform,
        config.wait_mode
    );

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    if config.skip_crd_install {
        info!("Skipping OrderTask CRD registration");
    } else {
        let crds = KubeCrdRepository::new(client.clone());
        if let Err(e) = install_crd(&crds, &OrderTask::crd(), config.bootstrap_settings()).await {
            if e.is_timeout() {
                warn!("OrderTask CRD was not established in time, raise --crd-timeout-secs if the API server is slow");
            }
            return Err(e).context("Failed to register the OrderTask resource type");
        }
    }

    let registry =
        RegistryClient::new(config.registry_config()).context("Failed to create registry client")?;
    let resolver = ImageResolver::new(
        Arc::new(registry),
        ImageCache::new(config.image_cache_size),
    );

    let ctx = Arc::new(Context {
        pods: Arc::new(KubePodRepository::new(client.clone())),
        tasks: Arc::new(KubeTaskRepository::new(client.clone())),
        builder: PodBuilder::new(Arc::new(resolver), config.build_settings()),
        settings: config.reconcile_settings(),
    });

    info!("Controller initialized, concurrency={}", config.concurrency);
    run_controller(client, &config, ctx).await;

    info!("Controller stopped");
    Ok(())
}

/// Watches tasks and their pods until a shutdown signal arrives
async fn run_controller(client: Client, config: &Config, ctx: Arc<Context>) {
    let (tasks, pods): (Api<OrderTask>, Api<Pod>) = match &config.namespace {
        Some(namespace) => (
            Api::namespaced(client.clone(), namespace),
            Api::namespaced(client, namespace),
        ),
        None => (Api::all(client.clone()), Api::all(client)),
    };

    let owned_pods =
        watcher::Config::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGER));

    Controller::new(tasks, watcher::Config::default())
        .owns(pods, owned_pods)
        .with_config(controller::Config::default().concurrency(config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((task, action)) => debug!("Reconciled {}: {:?}", task, action),
                Err(e) => warn!("Reconcile loop error: {}", e),
            }
        })
        .await;
}
