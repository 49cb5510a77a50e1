//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! environment variables where applicable.

use std::time::Duration;

/// Finalizer marker gating deletion of managed resources until cleanup ran
pub const DEFAULT_FINALIZER: &str = "kubeall.io/finalizer";

/// Correlation label on a backing image naming its owning image
pub const LABEL_IMAGE: &str = "kubeall.io/image";

/// Correlation label on a backing image naming the owning image's namespace
pub const LABEL_IMAGE_NAMESPACE: &str = "kubeall.io/imageNamespace";

/// Annotation on a virtual machine carrying its PVC templates (JSON array)
pub const ANNOTATION_PVC_TEMPLATES: &str = "kubeall.io/pvcTemplates";

/// Namespace where Longhorn keeps backing images and their data sources
pub const BACKING_IMAGE_NAMESPACE: &str = "longhorn-system";

/// Name prefix for backing images derived from an image name
pub const BACKING_IMAGE_PREFIX: &str = "bi";

/// Longhorn's naming limit for backing images
pub const BACKING_IMAGE_NAME_MAX_LEN: usize = 40;

/// CSI provisioner for storage classes created per image
pub const LONGHORN_DRIVER: &str = "driver.longhorn.io";

/// Storage class parameter naming the backing image to provision from
pub const PARAM_BACKING_IMAGE: &str = "backingImage";

/// Environment variable overriding the backing image upload endpoint
pub const VAR_UPLOAD_ENDPOINT: &str = "LONGHORN_UPLOAD_URL_PREFIX";

/// Default backing image upload endpoint (Longhorn backend service)
pub const DEFAULT_UPLOAD_ENDPOINT: &str =
    "http://longhorn-backend.longhorn-system:9500/v1/backingimages";

/// Per-controller reconcile concurrency
pub const MAX_CONCURRENT_RECONCILES: u16 = 2;

/// Default requeue interval for reconciliation errors
pub const RECONCILE_ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Delay before retrying a failed disk cleanup for a virtual machine
pub const VM_CLEANUP_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Poll interval while waiting for a backing image data source
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Poll budget while waiting for a backing image data source
pub const READINESS_POLL_RETRIES: u32 = 20;

/// In-process pipe capacity for streaming uploads
pub const UPLOAD_PIPE_CAPACITY: usize = 32 * 1024 * 1024;

/// Read chunk size when draining the upload pipe into the request body
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Request timeout for a single upload; sized for very large images
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 8080;
