//! # Image provisioner
//!
//! Side effects behind the Image lifecycle: ensures the Longhorn backing
//! image and the storage class provisioning from it exist, tears both down
//! on deletion, and carries the status write path used by the correlator.
//!
//! Every operation is idempotent. Ensure calls re-run on every reconcile
//! pass and create only what is missing; deletes treat not-found as done.

use std::collections::BTreeMap;

use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::constants::{
    BACKING_IMAGE_NAMESPACE, BACKING_IMAGE_NAME_MAX_LEN, BACKING_IMAGE_PREFIX, LABEL_IMAGE,
    LABEL_IMAGE_NAMESPACE, LONGHORN_DRIVER, PARAM_BACKING_IMAGE, READINESS_POLL_INTERVAL,
    READINESS_POLL_RETRIES,
};
use crate::longhorn::{BackingImage, BackingImageSpec};
use crate::upload::{wait_ready, ClusterDataSource, UploadError, Uploader};
use crate::{metrics, Image, ImageStatus, ImageType};

/// Derive the backing image name for an image name.
///
/// Deterministic: fixed prefix, then truncated to Longhorn's naming limit so
/// the same logical name always maps to the same physical name.
pub fn backing_image_name(image_name: &str) -> String {
    let mut name = format!("{BACKING_IMAGE_PREFIX}-{image_name}");
    name.truncate(BACKING_IMAGE_NAME_MAX_LEN);
    name
}

/// Name of the storage class provisioned for an image: the spec override
/// when set, the image name otherwise. Used for get, create and delete alike.
pub fn storage_class_name(image: &Image) -> String {
    if image.spec.storage_class_name.is_empty() {
        image.name_any()
    } else {
        image.spec.storage_class_name.clone()
    }
}

/// Provisioning and status operations for images
pub struct ImageProvisioner {
    client: Client,
    uploader: Uploader,
}

impl ImageProvisioner {
    pub fn new(client: Client, uploader: Uploader) -> Self {
        Self { client, uploader }
    }

    fn backing_images(&self) -> Api<BackingImage> {
        Api::namespaced(self.client.clone(), BACKING_IMAGE_NAMESPACE)
    }

    /// Ensure the backing image and its storage class exist for `image`.
    pub async fn ensure_image_resources(&self, image: &Image) -> anyhow::Result<()> {
        let backing_image = self.ensure_backing_image(image).await?;
        debug!(backing_image = %backing_image.name_any(), "backing image present");
        self.ensure_storage_class(image, &backing_image).await?;
        Ok(())
    }

    async fn ensure_backing_image(&self, image: &Image) -> anyhow::Result<BackingImage> {
        let image_name = image.name_any();
        let bi_name = backing_image_name(&image_name);
        let api = self.backing_images();

        if let Some(existing) = api.get_opt(&bi_name).await? {
            return Ok(existing);
        }

        let backing_image = BackingImage {
            metadata: ObjectMeta {
                name: Some(bi_name.clone()),
                namespace: Some(BACKING_IMAGE_NAMESPACE.to_string()),
                labels: Some(BTreeMap::from([
                    (LABEL_IMAGE.to_string(), image_name.clone()),
                    (
                        LABEL_IMAGE_NAMESPACE.to_string(),
                        image.namespace().unwrap_or_default(),
                    ),
                ])),
                ..Default::default()
            },
            spec: BackingImageSpec {
                source_type: serde_json::to_value(image.spec.image_from)?
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                source_parameters: BTreeMap::new(),
            },
            status: None,
        };
        let created = api.create(&PostParams::default(), &backing_image).await?;
        info!(image = %image_name, backing_image = %bi_name, "backing image created");
        Ok(created)
    }

    async fn ensure_storage_class(
        &self,
        image: &Image,
        backing_image: &BackingImage,
    ) -> anyhow::Result<()> {
        let sc_name = storage_class_name(image);
        let api: Api<StorageClass> = Api::all(self.client.clone());

        if api.get_opt(&sc_name).await?.is_some() {
            return Ok(());
        }

        let mut parameters = BTreeMap::from([(
            PARAM_BACKING_IMAGE.to_string(),
            backing_image.name_any(),
        )]);
        parameters.extend(image.spec.storage_class_parameters.clone());

        let storage_class = StorageClass {
            metadata: ObjectMeta {
                name: Some(sc_name.clone()),
                ..Default::default()
            },
            provisioner: LONGHORN_DRIVER.to_string(),
            parameters: Some(parameters),
            reclaim_policy: Some("Delete".to_string()),
            allow_volume_expansion: Some(true),
            volume_binding_mode: Some("Immediate".to_string()),
            ..Default::default()
        };
        api.create(&PostParams::default(), &storage_class).await?;
        info!(image = %image.name_any(), storage_class = %sc_name, "storage class created");
        Ok(())
    }

    /// Tear down everything provisioned for `image`. Not-found is not an
    /// error: cleanup may run more than once.
    pub async fn delete_image_resources(&self, image: &Image) -> anyhow::Result<()> {
        let bi_name = backing_image_name(&image.name_any());
        if let Err(e) = self.backing_images().delete(&bi_name, &Default::default()).await {
            if !is_not_found(&e) {
                return Err(e.into());
            }
        }

        let sc_api: Api<StorageClass> = Api::all(self.client.clone());
        if let Err(e) = sc_api.delete(&storage_class_name(image), &Default::default()).await {
            if !is_not_found(&e) {
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Status write path of the correlator: resolve the owning image from
    /// the backing image's correlation labels and merge-patch its status
    /// subresource.
    ///
    /// A missing label or image means a dangling backing image and is
    /// skipped. The patch itself is best-effort: the next status event
    /// retries it, and a patch failure must not block the backing image's
    /// own controller loop.
    pub async fn update_image_status(
        &self,
        status: &ImageStatus,
        backing_image: &BackingImage,
    ) -> Result<(), kube::Error> {
        let labels = backing_image.labels();
        let (Some(image_name), Some(image_namespace)) =
            (labels.get(LABEL_IMAGE), labels.get(LABEL_IMAGE_NAMESPACE))
        else {
            debug!(
                backing_image = %backing_image.name_any(),
                "no correlation labels, skipping status update"
            );
            return Ok(());
        };

        let api: Api<Image> = Api::namespaced(self.client.clone(), image_namespace);
        let Some(image) = api.get_opt(image_name).await? else {
            debug!(
                image = %image_name,
                backing_image = %backing_image.name_any(),
                "owning image is gone, skipping status update"
            );
            return Ok(());
        };

        let patch = serde_json::json!({ "status": status });
        if let Err(e) = api
            .patch_status(
                &image.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
        {
            warn!(image = %image_name, error = %e, "failed to patch image status");
            return Ok(());
        }

        info!(image = %image_name, state = %status.state, progress = status.progress,
            "image status updated");
        Ok(())
    }

    /// List the images of one type in a namespace (thin helper for the REST
    /// facade).
    pub async fn list_images_by_type(
        &self,
        namespace: &str,
        image_type: ImageType,
    ) -> Result<Vec<Image>, kube::Error> {
        let api: Api<Image> = Api::namespaced(self.client.clone(), namespace);
        let images = api.list(&ListParams::default()).await?;
        Ok(images
            .items
            .into_iter()
            .filter(|img| img.spec.image_type == image_type)
            .collect())
    }

    /// Upload image content: wait for the data source to be ready, then
    /// stream the payload to the Longhorn upload endpoint.
    pub async fn upload<R>(&self, image_name: &str, source: R, size: u64) -> Result<(), UploadError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        metrics::increment_uploads();
        let started = std::time::Instant::now();

        let data_source = ClusterDataSource::new(self.client.clone());
        let result = async {
            wait_ready(
                &data_source,
                &backing_image_name(image_name),
                READINESS_POLL_RETRIES,
                READINESS_POLL_INTERVAL,
            )
            .await?;
            self.uploader.upload(image_name, source, size).await
        }
        .await;

        match &result {
            Ok(()) => metrics::observe_upload_duration(started.elapsed().as_secs_f64()),
            Err(_) => metrics::increment_upload_errors(),
        }
        result
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ImageSourceType, ImageSpec, StorageBackend};

    fn image_named(name: &str, sc_override: &str) -> Image {
        Image::new(
            name,
            ImageSpec {
                os_type: String::new(),
                os_version: String::new(),
                image_type: ImageType::Disk,
                storage_class_name: sc_override.to_string(),
                image_storage_class_name: String::new(),
                storage_backend: StorageBackend::BackingImage,
                image_from: ImageSourceType::Upload,
                source_storage_class_name: String::new(),
                storage_class_parameters: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn backing_image_name_is_prefixed() {
        assert_eq!(backing_image_name("win11"), "bi-win11");
    }

    #[test]
    fn backing_image_name_is_length_bounded_and_deterministic() {
        let long = "a".repeat(100);
        let derived = backing_image_name(&long);
        assert_eq!(derived.len(), BACKING_IMAGE_NAME_MAX_LEN);
        assert!(derived.starts_with("bi-aaa"));
        assert_eq!(derived, backing_image_name(&long));
    }

    #[test]
    fn short_names_are_not_padded() {
        assert!(backing_image_name("x").len() < BACKING_IMAGE_NAME_MAX_LEN);
    }

    #[test]
    fn storage_class_name_defaults_to_image_name() {
        let img = image_named("ubuntu-22", "");
        assert_eq!(storage_class_name(&img), "ubuntu-22");
    }

    #[test]
    fn storage_class_name_honors_override() {
        let img = image_named("ubuntu-22", "fast-ssd");
        assert_eq!(storage_class_name(&img), "fast-ssd");
    }
}
