//! # Upload pipeline
//!
//! Streams image content to the Longhorn backing image upload endpoint.
//!
//! The inbound byte stream is re-encoded as a multipart body through an
//! in-process pipe: a producer task writes the framing and copies the source
//! into one end, the request body drains the other. Peak memory is bounded
//! by the pipe capacity no matter whether the file is megabytes or hundreds
//! of gigabytes, and a full pipe blocks the producer (back-pressure) instead
//! of growing.
//!
//! Before any byte moves, [`wait_ready`] polls the backing image data source
//! until it is ready to receive content.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::{Api, Client};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{
    self, BACKING_IMAGE_NAMESPACE, UPLOAD_CHUNK_SIZE, UPLOAD_PIPE_CAPACITY, UPLOAD_TIMEOUT,
};
use crate::longhorn::{BackingImageDataSource, BackingImageState};
use crate::provisioner::backing_image_name;

#[derive(Debug, Error)]
pub enum UploadError {
    /// The data source reported a terminal failed state; surfaced to the
    /// caller as a distinct, user-visible condition
    #[error("backing image data source for {0} reported a failed state")]
    SourceFailed(String),

    /// The endpoint answered with a non-2xx status
    #[error("upload rejected by storage endpoint: {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    /// Reading or re-encoding the inbound stream failed
    #[error("failed to stream image content: {0}")]
    Stream(#[source] std::io::Error),

    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
}

/// Readiness query against a backing image data source.
///
/// `Ok(None)` means the data source object has not been materialized yet,
/// which is distinct from a transport failure.
#[async_trait]
pub trait DataSourceQuery: Send + Sync {
    async fn current_state(&self, name: &str) -> Result<Option<BackingImageState>, kube::Error>;
}

/// Production query backed by the cluster
pub struct ClusterDataSource {
    api: Api<BackingImageDataSource>,
}

impl ClusterDataSource {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::namespaced(client, BACKING_IMAGE_NAMESPACE),
        }
    }
}

#[async_trait]
impl DataSourceQuery for ClusterDataSource {
    async fn current_state(&self, name: &str) -> Result<Option<BackingImageState>, kube::Error> {
        let ds = self.api.get_opt(name).await?;
        Ok(ds.map(|ds| {
            ds.status
                .map(|s| s.current_state)
                .unwrap_or(BackingImageState::Unknown)
        }))
    }
}

/// Poll the data source until it can receive an upload.
///
/// `pending` means the receiving side is provisioned and waiting → proceed.
/// `failed` aborts with [`UploadError::SourceFailed`]. Not-found keeps
/// polling, since the data source object appears asynchronously after the
/// backing image is created. When the budget runs out the transfer proceeds
/// anyway: for upload sources the data source regularly only settles once
/// bytes start flowing, so a hard timeout here would reject working uploads.
pub async fn wait_ready<Q>(
    query: &Q,
    name: &str,
    retries: u32,
    interval: Duration,
) -> Result<(), UploadError>
where
    Q: DataSourceQuery + ?Sized,
{
    for _ in 0..retries {
        match query.current_state(name).await? {
            None => {
                debug!(%name, "backing image data source not found yet, retrying");
            }
            Some(BackingImageState::Pending) => {
                info!(%name, "backing image data source is pending, ready for upload");
                return Ok(());
            }
            Some(BackingImageState::Failed | BackingImageState::FailedAndCleanUp) => {
                warn!(%name, "backing image data source reported a failed state");
                return Err(UploadError::SourceFailed(name.to_string()));
            }
            Some(state) => {
                debug!(%name, %state, "backing image data source not pending yet");
            }
        }
        tokio::time::sleep(interval).await;
    }
    warn!(%name, "readiness poll budget exhausted, proceeding with upload");
    Ok(())
}

/// HTTP client for the backing image upload endpoint
#[derive(Debug, Clone)]
pub struct Uploader {
    http: reqwest::Client,
    endpoint: String,
}

impl Uploader {
    pub fn new(endpoint: String) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder().timeout(UPLOAD_TIMEOUT).build()?;
        Ok(Self { http, endpoint })
    }

    /// Endpoint from `LONGHORN_UPLOAD_URL_PREFIX`, falling back to the
    /// in-cluster Longhorn backend service
    pub fn from_env() -> Result<Self, UploadError> {
        let endpoint = std::env::var(constants::VAR_UPLOAD_ENDPOINT)
            .unwrap_or_else(|_| constants::DEFAULT_UPLOAD_ENDPOINT.to_string());
        Self::new(endpoint)
    }

    /// Stream `source` to the backing image derived from `image_name`.
    ///
    /// The destination name uses the same truncation rule as provisioning,
    /// so the caller's logical name and Longhorn's physical name always
    /// correspond.
    pub async fn upload<R>(
        &self,
        image_name: &str,
        source: R,
        size: u64,
    ) -> Result<(), UploadError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let target = backing_image_name(image_name);
        let url = format!("{}/{}?action=upload&size={}", self.endpoint, target, size);

        let boundary = format!("----------------------{}", Uuid::new_v4().simple());
        let (mut tx, rx) = tokio::io::duplex(UPLOAD_PIPE_CAPACITY);

        // Producer failures are parked here and read back once the request
        // settles; the transport error alone would only say "body ended".
        let failure: Arc<Mutex<Option<std::io::Error>>> = Arc::new(Mutex::new(None));
        let producer_failure = Arc::clone(&failure);
        let producer_boundary = boundary.clone();
        tokio::spawn(async move {
            if let Err(e) = write_multipart(&mut tx, source, &producer_boundary).await {
                *producer_failure.lock().await = Some(e);
            }
            // tx drops here, closing the pipe in both directions
        });

        let body = reqwest::Body::wrap_stream(ReaderStream::with_capacity(rx, UPLOAD_CHUNK_SIZE));
        let result = self
            .http
            .post(&url)
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await;

        if let Some(e) = failure.lock().await.take() {
            return Err(UploadError::Stream(e));
        }

        let response = result?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Rejected { status, body });
        }

        info!(image = image_name, backing_image = %target, size, "image content uploaded");
        Ok(())
    }
}

/// Write a single-part multipart/form-data body ("chunk" field, "blob"
/// filename, as the Longhorn upload API expects) through the pipe.
async fn write_multipart<R>(
    dst: &mut DuplexStream,
    mut source: R,
    boundary: &str,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    dst.write_all(format!("--{boundary}\r\n").as_bytes()).await?;
    dst.write_all(b"Content-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\n")
        .await?;
    dst.write_all(b"Content-Type: application/octet-stream\r\n\r\n")
        .await?;
    tokio::io::copy(&mut source, dst).await?;
    dst.write_all(format!("\r\n--{boundary}--\r\n").as_bytes())
        .await?;
    dst.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, ReadBuf};

    /// Scripted readiness answers, one per poll
    struct ScriptedQuery {
        answers: std::sync::Mutex<VecDeque<Option<BackingImageState>>>,
        polls: AtomicU64,
    }

    impl ScriptedQuery {
        fn new(answers: Vec<Option<BackingImageState>>) -> Self {
            Self {
                answers: std::sync::Mutex::new(answers.into()),
                polls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl DataSourceQuery for ScriptedQuery {
        async fn current_state(
            &self,
            _name: &str,
        ) -> Result<Option<BackingImageState>, kube::Error> {
            self.polls.fetch_add(1, Ordering::Relaxed);
            let mut answers = self.answers.lock().unwrap();
            // keep repeating the last answer once the script runs out
            if answers.len() > 1 {
                Ok(answers.pop_front().unwrap())
            } else {
                Ok(*answers.front().unwrap())
            }
        }
    }

    const FAST: Duration = Duration::from_millis(1);

    #[tokio::test]
    async fn pending_state_proceeds_to_transfer() {
        let query = ScriptedQuery::new(vec![Some(BackingImageState::Pending)]);
        wait_ready(&query, "bi-img-a", 5, FAST).await.unwrap();
        assert_eq!(query.polls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn failed_state_aborts_before_transfer() {
        let query = ScriptedQuery::new(vec![
            None,
            Some(BackingImageState::Starting),
            Some(BackingImageState::Failed),
        ]);
        let err = wait_ready(&query, "bi-img-a", 10, FAST).await.unwrap_err();
        assert!(matches!(err, UploadError::SourceFailed(_)));
        assert_eq!(query.polls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_with_missing_data_source_proceeds() {
        // current behavior, kept deliberately: a data source that never
        // materializes within the budget does not fail the upload
        let query = ScriptedQuery::new(vec![None]);
        wait_ready(&query, "bi-img-a", 4, FAST).await.unwrap();
        assert_eq!(query.polls.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn non_pending_states_keep_polling_until_pending() {
        let query = ScriptedQuery::new(vec![
            Some(BackingImageState::Starting),
            Some(BackingImageState::InProgress),
            Some(BackingImageState::Pending),
        ]);
        wait_ready(&query, "bi-img-a", 10, FAST).await.unwrap();
        assert_eq!(query.polls.load(Ordering::Relaxed), 3);
    }

    /// Synthetic zero-filled source that counts how many bytes it has
    /// handed out
    struct CountingZeros {
        remaining: u64,
        produced: Arc<AtomicU64>,
    }

    impl AsyncRead for CountingZeros {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.remaining == 0 {
                return Poll::Ready(Ok(()));
            }
            let n = (buf.remaining() as u64).min(self.remaining) as usize;
            buf.put_slice(&vec![0u8; n]);
            self.remaining -= n as u64;
            self.produced.fetch_add(n as u64, Ordering::Relaxed);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn multipart_framing_wraps_the_source() {
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        let payload: &[u8] = b"image-bytes";
        let writer = tokio::spawn(async move {
            write_multipart(&mut tx, payload, "XBOUNDARYX").await.unwrap();
        });

        let mut body = Vec::new();
        rx.read_to_end(&mut body).await.unwrap();
        writer.await.unwrap();

        let body = String::from_utf8(body).unwrap();
        assert!(body.starts_with("--XBOUNDARYX\r\n"));
        assert!(body.contains("Content-Disposition: form-data; name=\"chunk\"; filename=\"blob\""));
        assert!(body.contains("image-bytes"));
        assert!(body.ends_with("\r\n--XBOUNDARYX--\r\n"));
    }

    #[tokio::test]
    async fn streaming_stays_within_pipe_capacity() {
        // 1 GiB through a 64 KiB pipe: the producer may only ever be one
        // pipe-fill plus one read ahead of the consumer
        const CAPACITY: usize = 64 * 1024;
        const SOURCE_LEN: u64 = 1 << 30;

        let produced = Arc::new(AtomicU64::new(0));
        let source = CountingZeros {
            remaining: SOURCE_LEN,
            produced: Arc::clone(&produced),
        };

        let (mut tx, mut rx) = tokio::io::duplex(CAPACITY);
        let writer = tokio::spawn(async move {
            write_multipart(&mut tx, source, "XBOUNDARYX").await.unwrap();
        });

        let mut consumed: u64 = 0;
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            let n = rx.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            consumed += n as u64;
            let ahead = produced.load(Ordering::Relaxed).saturating_sub(consumed);
            assert!(
                ahead <= (2 * CAPACITY) as u64,
                "producer ran {ahead} bytes ahead of the consumer"
            );
        }
        writer.await.unwrap();
        assert!(consumed > SOURCE_LEN, "framing plus the full payload arrived");
    }
}
