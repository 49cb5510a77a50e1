//! # KubeAll Controller
//!
//! A Kubernetes controller managing virtual machine images on top of
//! Longhorn.
//!
//! ## Overview
//!
//! Three controller loops run side by side:
//!
//! 1. **Image controller** - Provisions a Longhorn backing image and a
//!    storage class for every Image resource, and tears both down on
//!    deletion
//! 2. **VirtualMachine controller** - Creates and deletes the persistent
//!    volume claims declared in a machine's PVC template annotation
//! 3. **Status correlator** - Projects backing image transfer progress back
//!    onto the owning Image's status
//!
//! ## Features
//!
//! - **Finalizer-gated lifecycle**: Provisioned resources are always cleaned
//!   up before a resource is allowed to disappear
//! - **Streaming uploads**: Image content is streamed to the Longhorn upload
//!   endpoint with bounded memory
//! - **Prometheus metrics**: Exposes metrics for monitoring and observability
//! - **Health probes**: HTTP endpoints for liveness and readiness checks

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use kube::Client;
use tracing::{error, info};

use kubeall_controller::constants::DEFAULT_METRICS_PORT;
use kubeall_controller::provisioner::ImageProvisioner;
use kubeall_controller::server::{start_server, ServerState};
use kubeall_controller::upload::Uploader;
use kubeall_controller::{backing_image, image, metrics, vm};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kubeall_controller=info".into()),
        )
        .init();

    info!("Starting KubeAll Controller");

    metrics::register_metrics()?;

    let server_state = Arc::new(ServerState {
        is_ready: Arc::new(AtomicBool::new(false)),
    });

    let server_state_clone = server_state.clone();
    let server_port = std::env::var("METRICS_PORT")
        .unwrap_or_else(|_| DEFAULT_METRICS_PORT.to_string())
        .parse::<u16>()
        .unwrap_or(DEFAULT_METRICS_PORT);

    tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let uploader = Uploader::from_env().context("Failed to configure uploader")?;
    let provisioner = Arc::new(ImageProvisioner::new(client.clone(), uploader));

    server_state.is_ready.store(true, Ordering::Relaxed);

    tokio::join!(
        image::run(client.clone(), provisioner.clone()),
        vm::run(client.clone()),
        backing_image::run(client, provisioner),
    );

    info!("Controller stopped");

    Ok(())
}
