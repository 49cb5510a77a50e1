//! # Longhorn resource types
//!
//! Typed definitions for the external Longhorn CRDs this controller consumes.
//! Only the fields the controller reads or writes are modeled; everything
//! else is left to the server.

use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a backing image file or data source
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum BackingImageState {
    Pending,
    Starting,
    InProgress,
    ReadyForTransfer,
    Ready,
    Failed,
    FailedAndCleanUp,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for BackingImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::InProgress => "in-progress",
            Self::ReadyForTransfer => "ready-for-transfer",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::FailedAndCleanUp => "failed-and-clean-up",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Longhorn BackingImage
///
/// The provisioning artifact created one-to-one from an Image. Carries the
/// correlation labels pointing back at its owner.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "longhorn.io",
    version = "v1beta2",
    kind = "BackingImage",
    namespaced,
    status = "BackingImageStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BackingImageSpec {
    /// How the backing image obtains its content, mirrors the Image's source
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_type: String,
    /// Source-type specific parameters (e.g. download URL)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackingImageStatus {
    /// Size of the image file in bytes
    #[serde(default)]
    pub size: i64,
    /// Virtual size of the image in bytes, known once fully materialized
    #[serde(default)]
    pub virtual_size: i64,
    /// Per-disk replica state keyed by disk UUID; ordered so that the first
    /// entry is stable across reads
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub disk_file_status_map: BTreeMap<String, BackingImageDiskFileStatus>,
}

/// Upload/download state of one replica of a backing image
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackingImageDiskFileStatus {
    #[serde(default)]
    pub state: BackingImageState,
    /// Bytes-transferred progress, 0-100
    #[serde(default)]
    pub progress: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_state_transition_time: String,
}

/// Longhorn BackingImageDataSource
///
/// Tracks where a backing image's first file comes from. For upload sources
/// its state gates when the content transfer may start.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "longhorn.io",
    version = "v1beta2",
    kind = "BackingImageDataSource",
    namespaced,
    status = "BackingImageDataSourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BackingImageDataSourceSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackingImageDataSourceStatus {
    #[serde(default)]
    pub current_state: BackingImageState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_wire_names() {
        let s: BackingImageState = serde_json::from_str("\"in-progress\"").unwrap();
        assert_eq!(s, BackingImageState::InProgress);
        assert_eq!(s.to_string(), "in-progress");

        let s: BackingImageState = serde_json::from_str("\"ready\"").unwrap();
        assert_eq!(s, BackingImageState::Ready);
    }

    #[test]
    fn unrecognized_state_maps_to_unknown() {
        let s: BackingImageState = serde_json::from_str("\"some-new-state\"").unwrap();
        assert_eq!(s, BackingImageState::Unknown);
    }

    #[test]
    fn disk_file_status_map_is_ordered() {
        let status = BackingImageStatus {
            disk_file_status_map: BTreeMap::from([
                ("zzz".to_string(), BackingImageDiskFileStatus::default()),
                ("aaa".to_string(), BackingImageDiskFileStatus::default()),
            ]),
            ..Default::default()
        };
        let (first, _) = status.disk_file_status_map.first_key_value().unwrap();
        assert_eq!(first, "aaa");
    }
}
