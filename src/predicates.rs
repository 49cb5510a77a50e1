//! # Event filter predicates
//!
//! Change-hash predicates for `WatchStreamExt::predicate_filter`, deciding
//! which watch notifications are worth a reconcile pass. kube delivers
//! level-triggered apply events without the previous object, so "did the
//! interesting part change" is expressed as a hash over that part: an event
//! whose hash matches the last one seen for the same key is dropped, and the
//! first event for a key always passes.
//!
//! Without the Image filter, every status patch written by the correlator
//! would wake the Image controller again, which would re-run provisioning
//! for a change that cannot affect it. The filter breaks that feedback loop
//! while still passing the events the lifecycle engine depends on: spec
//! edits, deletion, and the engine's own finalizer patch (the deferred
//! ensure pass is triggered by exactly that event).

use std::hash::{DefaultHasher, Hash, Hasher};

use kube::{Resource, ResourceExt};

use crate::longhorn::BackingImage;
use crate::vm::VirtualMachine;
use crate::Image;

fn hash_of(value: impl Hash) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Revision of everything the Image controller reacts to: spec, deletion
/// timestamp and the finalizer set. Status-only echoes hash identically and
/// are filtered.
pub fn image_change(image: &Image) -> Option<u64> {
    let deleting = image.meta().deletion_timestamp.is_some();
    Some(hash_of((&image.spec, deleting, image.finalizers())))
}

/// Revision of what the VirtualMachine controller reacts to. Only creation
/// and deletion drive the VM lifecycle; spec updates are intentionally not
/// hashed and therefore never enqueue.
pub fn vm_change(vm: &VirtualMachine) -> Option<u64> {
    let deleting = vm.meta().deletion_timestamp.is_some();
    Some(hash_of((deleting, vm.finalizers())))
}

/// Revision of a backing image's status; only status movement wakes the
/// correlator.
pub fn backing_image_status(bi: &BackingImage) -> Option<u64> {
    Some(hash_of(&bi.status))
}

/// Whether a backing image status event carries anything worth projecting:
/// a resource being deleted reports no further useful progress, and an
/// empty status map has nothing to project yet.
pub fn worth_correlating(bi: &BackingImage) -> bool {
    if bi.meta().deletion_timestamp.is_some() {
        return false;
    }
    bi.status
        .as_ref()
        .is_some_and(|s| !s.disk_file_status_map.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::longhorn::{BackingImageDiskFileStatus, BackingImageSpec, BackingImageStatus};
    use crate::{ImageSourceType, ImageSpec, ImageStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn sample_image() -> Image {
        Image::new(
            "img-a",
            ImageSpec {
                os_type: "linux".to_string(),
                os_version: String::new(),
                image_type: crate::ImageType::Disk,
                storage_class_name: String::new(),
                image_storage_class_name: String::new(),
                storage_backend: crate::StorageBackend::BackingImage,
                image_from: ImageSourceType::Download,
                source_storage_class_name: String::new(),
                storage_class_parameters: Default::default(),
            },
        )
    }

    #[test]
    fn status_only_update_hashes_identically() {
        let before = sample_image();
        let mut after = sample_image();
        after.status = Some(ImageStatus {
            progress: 42,
            state: "in-progress".to_string(),
            ..Default::default()
        });
        assert_eq!(image_change(&before), image_change(&after));
    }

    #[test]
    fn spec_change_alters_the_hash() {
        let before = sample_image();
        let mut after = sample_image();
        after.spec.image_from = ImageSourceType::Upload;
        assert_ne!(image_change(&before), image_change(&after));
    }

    #[test]
    fn deletion_alters_the_hash() {
        let before = sample_image();
        let mut after = sample_image();
        after.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_ne!(image_change(&before), image_change(&after));
    }

    #[test]
    fn finalizer_placement_alters_the_hash() {
        // the deferred ensure pass depends on the finalizer patch passing
        // the filter
        let before = sample_image();
        let mut after = sample_image();
        after.metadata.finalizers = Some(vec![crate::constants::DEFAULT_FINALIZER.to_string()]);
        assert_ne!(image_change(&before), image_change(&after));
    }

    fn backing_image(status: Option<BackingImageStatus>) -> BackingImage {
        let mut bi = BackingImage::new("bi-img-a", BackingImageSpec::default());
        bi.status = status;
        bi
    }

    #[test]
    fn backing_image_status_movement_alters_the_hash() {
        let before = backing_image(Some(BackingImageStatus {
            disk_file_status_map: [(
                "disk-1".to_string(),
                BackingImageDiskFileStatus {
                    progress: 10,
                    ..Default::default()
                },
            )]
            .into(),
            ..Default::default()
        }));
        let mut after = before.clone();
        after
            .status
            .as_mut()
            .unwrap()
            .disk_file_status_map
            .get_mut("disk-1")
            .unwrap()
            .progress = 20;

        assert_ne!(backing_image_status(&before), backing_image_status(&after));
    }

    #[test]
    fn deleting_backing_image_is_not_worth_correlating() {
        let mut bi = backing_image(Some(BackingImageStatus {
            disk_file_status_map: [("disk-1".to_string(), BackingImageDiskFileStatus::default())]
                .into(),
            ..Default::default()
        }));
        bi.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(!worth_correlating(&bi));
    }

    #[test]
    fn empty_status_map_is_not_worth_correlating() {
        assert!(!worth_correlating(&backing_image(Some(
            BackingImageStatus::default()
        ))));
        assert!(!worth_correlating(&backing_image(None)));
    }

    #[test]
    fn reported_progress_is_worth_correlating() {
        let bi = backing_image(Some(BackingImageStatus {
            disk_file_status_map: [("disk-1".to_string(), BackingImageDiskFileStatus::default())]
                .into(),
            ..Default::default()
        }));
        assert!(worth_correlating(&bi));
    }
}
