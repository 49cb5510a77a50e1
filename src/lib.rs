//! Kubeall controller library
//!
//! Controllers that keep the `kubeall.io` managed resources in sync with the
//! cluster and with Longhorn:
//!
//! - **Image**: each Image is realized as a Longhorn BackingImage plus a
//!   StorageClass provisioning from it. Creation and spec changes are driven
//!   by a finalizer-gated reconciler ([`reconciler`]); upload-type images
//!   receive their content through the streaming pipeline in [`upload`].
//! - **BackingImage status**: a correlator ([`backing_image`]) projects the
//!   backing image's per-disk upload progress back onto the owning Image's
//!   status subresource.
//! - **VirtualMachine**: disks declared through the PVC templates annotation
//!   are created and cleaned up alongside the VM ([`vm`]).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod backing_image;
pub mod constants;
pub mod image;
pub mod longhorn;
pub mod metrics;
pub mod predicates;
pub mod provisioner;
pub mod reconciler;
pub mod server;
pub mod upload;
pub mod vm;

/// Content type of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Iso,
    Disk,
}

/// Storage backend realizing an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[serde(rename = "backingimage")]
    BackingImage,
    Cdi,
}

/// How an image gets its content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ImageSourceType {
    Upload,
    Download,
    Restore,
    Clone,
    ExportFromVolume,
}

/// Image Custom Resource Definition
///
/// The user-facing managed entity. The controller provisions a Longhorn
/// backing image and a storage class for every Image and tears both down
/// when the Image is deleted.
#[derive(CustomResource, Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubeall.io",
    version = "v1",
    kind = "Image",
    namespaced,
    status = "ImageStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Progress", "type":"integer", "jsonPath":".status.progress"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Guest OS family, informational only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os_type: String,
    /// Guest OS version, informational only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os_version: String,
    /// Content type of the image
    #[serde(default = "default_image_type")]
    pub image_type: ImageType,
    /// Override for the name of the storage class provisioned for this image.
    /// Defaults to the image name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class_name: String,
    /// Storage class backing the image's own volume, if any
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_storage_class_name: String,
    /// Storage backend realizing the image
    #[serde(rename = "backend", default = "default_backend")]
    pub storage_backend: StorageBackend,
    /// How the image's content is obtained
    pub image_from: ImageSourceType,
    /// Storage class of the source volume for clone/export sources
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_storage_class_name: String,
    /// Extra parameters merged into the provisioned storage class
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub storage_class_parameters: std::collections::BTreeMap<String, String>,
}

fn default_image_type() -> ImageType {
    ImageType::Disk
}

fn default_backend() -> StorageBackend {
    StorageBackend::BackingImage
}

/// Observed state of an Image
///
/// Written only by the status correlator; never read back to make
/// provisioning decisions.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    /// Transfer progress, 0-100
    #[serde(default)]
    pub progress: i32,
    /// Observed size in bytes
    #[serde(default)]
    pub size: i64,
    /// Observed virtual size in bytes, reported once the image is ready
    #[serde(default)]
    pub virtual_size: i64,
    /// Lifecycle state mirrored from the backing image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    /// Human readable message from the backing image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Timestamp of the last state transition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_state_transition_time: String,
}
