//! # Backing image status correlator
//!
//! Watches the status of Longhorn backing images and projects it onto the
//! owning Image's status subresource, so users see upload/download progress
//! on the resource they created.
//!
//! The projection works off one representative per-disk entry: the
//! lexicographically smallest disk key. In steady state a backing image
//! managed here has exactly one replica entry, so the choice only matters
//! for determinism.

use std::sync::Arc;

use futures::StreamExt;
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Config};
use kube_runtime::{reflector, watcher, Controller, WatchStreamExt};
use tracing::{debug, error, info};

use crate::constants::{
    BACKING_IMAGE_NAMESPACE, MAX_CONCURRENT_RECONCILES, RECONCILE_ERROR_REQUEUE,
};
use crate::longhorn::{BackingImage, BackingImageState};
use crate::provisioner::ImageProvisioner;
use crate::reconciler::Error;
use crate::{metrics, predicates, ImageStatus};

/// Map a backing image's reported status to the owning image's status.
///
/// Size is propagated unconditionally; virtual size only once the file is
/// ready, since it is meaningless before the image is fully materialized.
/// Progress is clamped to 99 while the state is not yet ready: 100% of the
/// bytes being transferred does not mean post-processing has finished, and
/// reporting 100 early reads as "done" to the user.
pub fn project_status(backing_image: &BackingImage) -> Option<ImageStatus> {
    let status = backing_image.status.as_ref()?;
    let (_, file) = status.disk_file_status_map.first_key_value()?;

    let ready = file.state == BackingImageState::Ready;
    let progress = if !ready && file.progress == 100 {
        99
    } else {
        file.progress
    };

    Some(ImageStatus {
        progress,
        size: status.size,
        virtual_size: if ready { status.virtual_size } else { 0 },
        state: file.state.to_string(),
        message: file.message.clone(),
        last_state_transition_time: file.last_state_transition_time.clone(),
    })
}

struct Context {
    api: Api<BackingImage>,
    provisioner: Arc<ImageProvisioner>,
}

async fn correlate(
    backing_image: Arc<BackingImage>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = backing_image.name_any();
    debug!(backing_image = %name, "backing image status event");

    // re-fetch; the trigger object may be stale
    let Some(backing_image) = ctx.api.get_opt(&name).await? else {
        return Ok(Action::await_change());
    };

    if !predicates::worth_correlating(&backing_image) {
        return Ok(Action::await_change());
    }

    let Some(status) = project_status(&backing_image) else {
        return Ok(Action::await_change());
    };

    ctx.provisioner
        .update_image_status(&status, &backing_image)
        .await?;
    metrics::increment_status_propagations();
    Ok(Action::await_change())
}

fn error_policy(backing_image: Arc<BackingImage>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(backing_image = %backing_image.name_any(), %error, "status correlation failed");
    metrics::increment_reconciliation_errors();
    Action::requeue(RECONCILE_ERROR_REQUEUE)
}

/// Run the correlator until shutdown. Only status movement passes the event
/// filter, so the loop stays quiet while nothing is transferring.
pub async fn run(client: Client, provisioner: Arc<ImageProvisioner>) {
    let api: Api<BackingImage> = Api::namespaced(client, BACKING_IMAGE_NAMESPACE);
    let ctx = Arc::new(Context {
        api: api.clone(),
        provisioner,
    });

    info!("starting backing image status correlator");

    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::backing_image_status);

    Controller::for_stream(stream, reader)
        .with_config(Config::default().concurrency(MAX_CONCURRENT_RECONCILES))
        .shutdown_on_signal()
        .run(correlate, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(backing_image = %obj.name, "status correlated");
                }
                Err(e) => {
                    debug!(error = %e, "correlator event dropped");
                }
            }
        })
        .await;

    info!("backing image status correlator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::longhorn::{
        BackingImageDiskFileStatus, BackingImageSpec, BackingImageStatus,
    };
    use std::collections::BTreeMap;

    fn backing_image_with(
        entries: Vec<(&str, BackingImageState, i32)>,
        size: i64,
        virtual_size: i64,
    ) -> BackingImage {
        let mut bi = BackingImage::new("bi-img-a", BackingImageSpec::default());
        bi.status = Some(BackingImageStatus {
            size,
            virtual_size,
            disk_file_status_map: entries
                .into_iter()
                .map(|(disk, state, progress)| {
                    (
                        disk.to_string(),
                        BackingImageDiskFileStatus {
                            state,
                            progress,
                            message: String::new(),
                            last_state_transition_time: String::new(),
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
        });
        bi
    }

    #[test]
    fn uploading_at_100_is_clamped_to_99() {
        let bi = backing_image_with(
            vec![("disk-1", BackingImageState::InProgress, 100)],
            4096,
            8192,
        );
        let status = project_status(&bi).unwrap();
        assert_eq!(status.progress, 99);
        assert_eq!(status.state, "in-progress");
        assert_eq!(status.size, 4096);
        assert_eq!(status.virtual_size, 0, "virtual size withheld before ready");
    }

    #[test]
    fn ready_at_100_reports_100_and_virtual_size() {
        let bi = backing_image_with(vec![("disk-1", BackingImageState::Ready, 100)], 4096, 8192);
        let status = project_status(&bi).unwrap();
        assert_eq!(status.progress, 100);
        assert_eq!(status.virtual_size, 8192);
        assert_eq!(status.state, "ready");
    }

    #[test]
    fn partial_progress_passes_through() {
        let bi = backing_image_with(vec![("disk-1", BackingImageState::InProgress, 37)], 0, 0);
        assert_eq!(project_status(&bi).unwrap().progress, 37);
    }

    #[test]
    fn representative_entry_is_smallest_disk_key() {
        let bi = backing_image_with(
            vec![
                ("disk-b", BackingImageState::Ready, 100),
                ("disk-a", BackingImageState::InProgress, 50),
            ],
            0,
            0,
        );
        let status = project_status(&bi).unwrap();
        assert_eq!(status.progress, 50);
        assert_eq!(status.state, "in-progress");
    }

    #[test]
    fn no_status_or_empty_map_projects_nothing() {
        let bi = BackingImage::new("bi-img-a", BackingImageSpec::default());
        assert!(project_status(&bi).is_none());

        let bi = backing_image_with(vec![], 0, 0);
        assert!(project_status(&bi).is_none());
    }
}
