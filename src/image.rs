//! # Image controller
//!
//! Drives the Image lifecycle through the shared reconcile engine: a live
//! image gets a Longhorn backing image plus a storage class provisioning
//! from it, and deletion tears both down before the finalizer is released.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Config};
use kube_runtime::{reflector, watcher, Controller, WatchStreamExt};
use tracing::{debug, error, info, warn};

use crate::constants::{MAX_CONCURRENT_RECONCILES, RECONCILE_ERROR_REQUEUE};
use crate::provisioner::ImageProvisioner;
use crate::reconciler::{self, Error, ReconcileHook};
use crate::{metrics, predicates, Image};

pub struct ImageHook {
    client: Client,
    provisioner: Arc<ImageProvisioner>,
}

impl ImageHook {
    pub fn new(client: Client, provisioner: Arc<ImageProvisioner>) -> Self {
        Self {
            client,
            provisioner,
        }
    }
}

#[async_trait]
impl ReconcileHook for ImageHook {
    type Resource = Image;

    fn kind(&self) -> &'static str {
        "Image"
    }

    async fn fetch(&self, namespace: &str, name: &str) -> Result<Option<Image>, kube::Error> {
        Api::<Image>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn set_finalizers(
        &self,
        resource: &Image,
        finalizers: Vec<String>,
    ) -> Result<(), kube::Error> {
        let namespace = resource.namespace().unwrap_or_default();
        let api: Api<Image> = Api::namespaced(self.client.clone(), &namespace);
        reconciler::patch_finalizers(&api, resource, finalizers).await
    }

    async fn on_change(&self, image: &Image) -> anyhow::Result<()> {
        self.provisioner.ensure_image_resources(image).await
    }

    async fn on_remove(&self, image: &Image) -> anyhow::Result<()> {
        self.provisioner.delete_image_resources(image).await
    }
}

async fn reconcile(image: Arc<Image>, hook: Arc<ImageHook>) -> Result<Action, Error> {
    metrics::increment_reconciliations("Image");
    reconciler::reconcile_with(hook.as_ref(), image).await
}

fn error_policy(image: Arc<Image>, error: &Error, _hook: Arc<ImageHook>) -> Action {
    error!(image = %image.name_any(), %error, "image reconciliation failed");
    metrics::increment_reconciliation_errors();
    match error {
        Error::CleanupFailed {
            retry_after: Some(delay),
            ..
        } => Action::requeue(*delay),
        _ => Action::requeue(RECONCILE_ERROR_REQUEUE),
    }
}

/// Run the Image controller until shutdown.
///
/// The event filter drops status-only echoes, so the correlator writing
/// progress back onto images does not feed this loop.
pub async fn run(client: Client, provisioner: Arc<ImageProvisioner>) {
    let api: Api<Image> = Api::all(client.clone());
    let hook = Arc::new(ImageHook::new(client, provisioner));

    info!("starting image controller");

    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::image_change);

    Controller::for_stream(stream, reader)
        .with_config(Config::default().concurrency(MAX_CONCURRENT_RECONCILES))
        .shutdown_on_signal()
        .run(reconcile, error_policy, hook)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => debug!(image = %obj.name, "image reconciled"),
                Err(e) => warn!(error = %e, "image reconcile dropped"),
            }
        })
        .await;

    info!("image controller stopped");
}
