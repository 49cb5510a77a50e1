//! # Reconciler
//!
//! The finalizer-gated lifecycle engine shared by every managed-resource
//! controller. A reconcile request is converted into exactly one of four
//! actions, decided purely from the freshly fetched state of the resource:
//!
//! 1. resource gone → no-op (not-found is not an error);
//! 2. being deleted and carrying our finalizer → run the hook's cleanup,
//!    then remove the finalizer;
//! 3. live without our finalizer → add the finalizer and stop, deferring
//!    provisioning to the pass triggered by that patch's own watch event;
//! 4. live with our finalizer → run the hook's idempotent ensure logic.
//!
//! Splitting "add finalizer" and "ensure" across two passes means a crash
//! between provisioning and finalizer placement cannot leave resources that
//! nothing will ever clean up.
//!
//! Finalizer patches embed the observed `resourceVersion`, so a concurrent
//! writer turns the patch into a 409 and the pass is simply retried on the
//! next event.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use kube_runtime::controller::Action;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::constants;

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to ensure related resources for {kind} {namespace}/{name}: {source}")]
    EnsureFailed {
        kind: &'static str,
        namespace: String,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to clean up related resources for {kind} {namespace}/{name}: {source}")]
    CleanupFailed {
        kind: &'static str,
        namespace: String,
        name: String,
        /// Delay hint for the scheduling layer, when the hook wants a
        /// tighter retry than the default requeue
        retry_after: Option<Duration>,
        #[source]
        source: anyhow::Error,
    },
}

/// Per-resource-kind capabilities consumed by [`reconcile_with`].
///
/// A hook supplies fetch/patch access for its kind plus the two side-effect
/// procedures; the engine owns every lifecycle decision. `on_change` must be
/// idempotent: duplicate or stale requests re-run it against current state.
#[async_trait]
pub trait ReconcileHook: Send + Sync {
    type Resource: Resource + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static;

    /// Kind name used in log and error context
    fn kind(&self) -> &'static str;

    /// Finalizer marker owned by this controller
    fn finalizer(&self) -> &str {
        constants::DEFAULT_FINALIZER
    }

    /// Fetch the current state of the resource; `None` when it no longer
    /// exists
    async fn fetch(&self, namespace: &str, name: &str)
        -> Result<Option<Self::Resource>, kube::Error>;

    /// Replace the resource's finalizer list with a conditional patch
    /// against the observed version
    async fn set_finalizers(
        &self,
        resource: &Self::Resource,
        finalizers: Vec<String>,
    ) -> Result<(), kube::Error>;

    /// Idempotent ensure-resources-exist logic for a live resource
    async fn on_change(&self, resource: &Self::Resource) -> anyhow::Result<()>;

    /// Cleanup of everything the hook provisioned, run before the finalizer
    /// is released
    async fn on_remove(&self, resource: &Self::Resource) -> anyhow::Result<()>;

    /// Delay hint applied when `on_remove` fails
    fn cleanup_retry_delay(&self) -> Option<Duration> {
        None
    }
}

/// The mutually exclusive lifecycle actions of one reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Place the finalizer, defer provisioning to the next pass
    AddFinalizer,
    /// Run the hook's ensure logic
    Ensure,
    /// Run the hook's cleanup, then release the finalizer
    Cleanup,
    /// Nothing to do (being deleted without our finalizer)
    Idle,
}

/// Decide the action for one pass purely from resource metadata.
pub fn classify(meta: &ObjectMeta, finalizer: &str) -> Step {
    let has_finalizer = meta
        .finalizers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|f| f == finalizer);

    if meta.deletion_timestamp.is_some() {
        if has_finalizer {
            Step::Cleanup
        } else {
            Step::Idle
        }
    } else if has_finalizer {
        Step::Ensure
    } else {
        Step::AddFinalizer
    }
}

/// Run one reconcile pass for `obj` against `hook`.
///
/// `obj` only provides the request key; current state is always re-fetched
/// so duplicate and stale requests are harmless.
pub async fn reconcile_with<H: ReconcileHook>(
    hook: &H,
    obj: Arc<H::Resource>,
) -> Result<Action, Error> {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    let Some(resource) = hook.fetch(&namespace, &name).await? else {
        return Ok(Action::await_change());
    };

    match classify(resource.meta(), hook.finalizer()) {
        Step::AddFinalizer => {
            let mut finalizers = resource.finalizers().to_vec();
            finalizers.push(hook.finalizer().to_string());
            hook.set_finalizers(&resource, finalizers).await?;
            info!(
                kind = hook.kind(),
                %namespace,
                %name,
                "finalizer added, provisioning deferred to next pass"
            );
            Ok(Action::await_change())
        }
        Step::Ensure => {
            hook.on_change(&resource)
                .await
                .map_err(|source| Error::EnsureFailed {
                    kind: hook.kind(),
                    namespace: namespace.clone(),
                    name: name.clone(),
                    source,
                })?;
            info!(kind = hook.kind(), %namespace, %name, "resource reconciled");
            Ok(Action::await_change())
        }
        Step::Cleanup => {
            hook.on_remove(&resource)
                .await
                .map_err(|source| Error::CleanupFailed {
                    kind: hook.kind(),
                    namespace: namespace.clone(),
                    name: name.clone(),
                    retry_after: hook.cleanup_retry_delay(),
                    source,
                })?;

            let finalizers: Vec<String> = resource
                .finalizers()
                .iter()
                .filter(|f| f.as_str() != hook.finalizer())
                .cloned()
                .collect();
            hook.set_finalizers(&resource, finalizers).await?;
            info!(kind = hook.kind(), %namespace, %name, "resource removed");
            Ok(Action::await_change())
        }
        Step::Idle => Ok(Action::await_change()),
    }
}

/// Conditional finalizer patch shared by the production hooks.
///
/// The merge patch carries the observed `resourceVersion`; a conflict means
/// someone else wrote first and the pass retries on their event.
pub async fn patch_finalizers<K>(
    api: &Api<K>,
    resource: &K,
    finalizers: Vec<String>,
) -> Result<(), kube::Error>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    let patch = serde_json::json!({
        "metadata": {
            "resourceVersion": resource.resource_version(),
            "finalizers": finalizers,
        }
    });
    api.patch(
        &resource.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}
