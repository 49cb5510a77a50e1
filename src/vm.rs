//! # VirtualMachine disk controller
//!
//! Manages the persistent volume claims backing a KubeVirt virtual machine.
//! The claims are declared up-front as a JSON array of PVC manifests in the
//! `kubeall.io/pvcTemplates` annotation; this controller materializes them
//! when the machine appears and deletes them when it goes away.
//!
//! The VM spec itself is owned by KubeVirt, so spec updates never enqueue
//! here (see the event filter): only creation and deletion drive this loop.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::PostParams;
use kube::{Api, Client, CustomResource, ResourceExt};
use kube_runtime::controller::{Action, Config};
use kube_runtime::{reflector, watcher, Controller, WatchStreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::constants::{
    ANNOTATION_PVC_TEMPLATES, MAX_CONCURRENT_RECONCILES, RECONCILE_ERROR_REQUEUE,
    VM_CLEANUP_RETRY_DELAY,
};
use crate::reconciler::{self, Error, ReconcileHook};
use crate::{metrics, predicates};

/// KubeVirt VirtualMachine, reduced to the fields this controller touches.
/// The domain template is carried opaquely; KubeVirt owns its schema.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<serde_json::Value>,
}

/// Parse the PVC templates declared on a virtual machine.
///
/// No annotation means no managed disks, which is valid. A present but
/// malformed annotation is an error: silently skipping it would strand the
/// machine without the disks its domain template references.
pub fn pvc_templates(vm: &VirtualMachine) -> anyhow::Result<Vec<PersistentVolumeClaim>> {
    let Some(raw) = vm.annotations().get(ANNOTATION_PVC_TEMPLATES) else {
        return Ok(Vec::new());
    };
    let templates: Vec<PersistentVolumeClaim> = serde_json::from_str(raw)?;
    Ok(templates)
}

pub struct VmHook {
    client: Client,
}

impl VmHook {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ReconcileHook for VmHook {
    type Resource = VirtualMachine;

    fn kind(&self) -> &'static str {
        "VirtualMachine"
    }

    async fn fetch(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachine>, kube::Error> {
        Api::<VirtualMachine>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn set_finalizers(
        &self,
        resource: &VirtualMachine,
        finalizers: Vec<String>,
    ) -> Result<(), kube::Error> {
        let namespace = resource.namespace().unwrap_or_default();
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), &namespace);
        reconciler::patch_finalizers(&api, resource, finalizers).await
    }

    async fn on_change(&self, vm: &VirtualMachine) -> anyhow::Result<()> {
        let namespace = vm.namespace().unwrap_or_default();
        let api = self.claims(&namespace);

        for mut template in pvc_templates(vm)? {
            template.metadata.namespace = Some(namespace.clone());
            let claim_name = template.name_any();

            match api.create(&PostParams::default(), &template).await {
                Ok(_) => {
                    info!(vm = %vm.name_any(), claim = %claim_name, "disk claim created");
                }
                Err(e) if is_already_exists(&e) => {
                    debug!(vm = %vm.name_any(), claim = %claim_name, "disk claim already present");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn on_remove(&self, vm: &VirtualMachine) -> anyhow::Result<()> {
        let namespace = vm.namespace().unwrap_or_default();
        let api = self.claims(&namespace);

        for template in pvc_templates(vm)? {
            let claim_name = template.name_any();
            match api.delete(&claim_name, &Default::default()).await {
                Ok(_) => {
                    info!(vm = %vm.name_any(), claim = %claim_name, "disk claim deleted");
                }
                Err(e) if is_not_found(&e) => {
                    debug!(vm = %vm.name_any(), claim = %claim_name, "disk claim already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn cleanup_retry_delay(&self) -> Option<Duration> {
        // disk deletion races the VM's own teardown; retry quickly rather
        // than waiting out the default requeue
        Some(VM_CLEANUP_RETRY_DELAY)
    }
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 409)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 404)
}

async fn reconcile(vm: Arc<VirtualMachine>, hook: Arc<VmHook>) -> Result<Action, Error> {
    metrics::increment_reconciliations("VirtualMachine");
    reconciler::reconcile_with(hook.as_ref(), vm).await
}

fn error_policy(vm: Arc<VirtualMachine>, error: &Error, _hook: Arc<VmHook>) -> Action {
    error!(vm = %vm.name_any(), %error, "virtual machine reconciliation failed");
    metrics::increment_reconciliation_errors();
    match error {
        Error::CleanupFailed {
            retry_after: Some(delay),
            ..
        } => Action::requeue(*delay),
        _ => Action::requeue(RECONCILE_ERROR_REQUEUE),
    }
}

/// Run the VirtualMachine controller until shutdown.
pub async fn run(client: Client) {
    let api: Api<VirtualMachine> = Api::all(client.clone());
    let hook = Arc::new(VmHook::new(client));

    info!("starting virtual machine controller");

    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::vm_change);

    Controller::for_stream(stream, reader)
        .with_config(Config::default().concurrency(MAX_CONCURRENT_RECONCILES))
        .shutdown_on_signal()
        .run(reconcile, error_policy, hook)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => debug!(vm = %obj.name, "virtual machine reconciled"),
                Err(e) => warn!(error = %e, "virtual machine reconcile dropped"),
            }
        })
        .await;

    info!("virtual machine controller stopped");
}
