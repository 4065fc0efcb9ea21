//! Buffered multipart upload output stream: the hardest piece of the
//! adapter.
//!
//! `S3Transport::write_file` in the teacher always issues a single
//! `put_object` because Conserve's blocks are bounded-size; this module
//! generalizes that into the full state machine — coalesced part
//! buffering, deferred multipart creation, background part dispatch with a
//! completion rendezvous, and the CompleteMultipartUpload
//! 200-OK-with-embedded-error workaround — grounded on the multipart
//! sequence shown in the quickwit S3-compatible storage backend
//! (`create_multipart_upload` / `upload_part` / `complete_multipart_upload`
//! / `abort_multipart_upload`) and adapted to `aws-sdk-s3`'s builder API.
//!
//! [`MultipartBackend`] isolates the state machine from a live
//! `aws_sdk_s3::Client` so the buffering, part-numbering, and rendezvous
//! logic can be driven by a fake in tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use tokio::sync::watch;

use crate::client::holder::ClientHolder;
use crate::client::retry::RetryStrategy;
use crate::error::{from_sdk_error, Error, RetryDetail, Result};
use crate::executor::Executor;
use crate::file_info::ObjectMetadata;
use crate::path::Path;

pub const PART_SIZE: usize = 10 * 1024 * 1024;
pub const MULTIPART_THRESHOLD: usize = PART_SIZE - 1;
pub const MAX_PARTS: usize = 10_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Open,
    Writing,
    Closing,
    Closed,
    Failed,
}

#[derive(Clone, Debug)]
struct CompletedPartRecord {
    part_number: i32,
    etag: String,
}

/// The S3 operations the output stream needs, isolated behind a trait so
/// the state machine is testable without a live client.
#[async_trait]
pub trait MultipartBackend: Send + Sync {
    async fn put_object(&self, path: &Path, body: Bytes, content_type: &str, metadata: &ObjectMetadata) -> Result<()>;
    async fn create_multipart_upload(&self, path: &Path, content_type: &str, metadata: &ObjectMetadata) -> Result<String>;
    async fn upload_part(&self, path: &Path, upload_id: &str, part_number: i32, body: Bytes) -> Result<String>;
    async fn complete_multipart_upload(
        &self,
        path: &Path,
        upload_id: &str,
        parts: &[(i32, String)],
        attempt: u32,
    ) -> Result<()>;
    async fn abort_multipart_upload(&self, path: &Path, upload_id: &str) -> Result<()>;
}

pub struct OutputStreamOptions {
    pub path: Path,
    pub metadata: ObjectMetadata,
    pub default_metadata: ObjectMetadata,
    pub background_writes: bool,
    pub allow_delayed_open: bool,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub executor: Option<Arc<dyn Executor>>,
}

struct SharedUploadState {
    parts: Vec<Option<CompletedPartRecord>>,
    uploads_in_progress: usize,
    status: Option<Error>,
    completion: Option<watch::Sender<bool>>,
}

impl SharedUploadState {
    fn new() -> Self {
        SharedUploadState {
            parts: Vec::new(),
            uploads_in_progress: 0,
            status: None,
            completion: None,
        }
    }
}

fn ensure_len(parts: &mut Vec<Option<CompletedPartRecord>>, min_len: usize) {
    if parts.len() < min_len {
        parts.resize_with(min_len, || None);
    }
}

fn merge_metadata(default_metadata: &ObjectMetadata, metadata: &ObjectMetadata) -> ObjectMetadata {
    let mut merged = default_metadata.clone();
    merged.extend(metadata.clone());
    merged
}

/// Convert a failed CompleteMultipartUpload attempt into a [`RetryDetail`]
/// so the same [`RetryStrategy`] the client builder installs on the SDK's
/// retry interface also governs this workaround.
fn retry_detail_from_error(err: &Error) -> RetryDetail {
    RetryDetail {
        error_code: "CompleteMultipartUploadError".to_owned(),
        message: err.to_string(),
        exception_name: "CompleteMultipartUploadError",
        transient_hint: true,
    }
}

/// A write-side handle onto one S3 object, generic over the backend so it
/// can be driven by a fake in unit tests.
pub struct OutputStream<B: MultipartBackend> {
    backend: Arc<B>,
    path: Path,
    content_type: String,
    metadata: ObjectMetadata,
    default_metadata: ObjectMetadata,
    background_writes: bool,
    allow_delayed_open: bool,
    retry_strategy: Option<Arc<dyn RetryStrategy>>,
    executor: Option<Arc<dyn Executor>>,

    state: State,
    upload_id: Option<String>,
    current_part: BytesMut,
    /// Number of parts dispatched so far; the next dispatch gets
    /// `part_number + 1`.
    part_number: i32,
    total_written: u64,
    shared: Arc<Mutex<SharedUploadState>>,
}

impl<B: MultipartBackend + 'static> OutputStream<B> {
    pub async fn open(backend: Arc<B>, options: OutputStreamOptions) -> Result<Self> {
        let content_type = options
            .metadata
            .get("Content-Type")
            .cloned()
            .unwrap_or_else(|| "application/octet-stream".to_owned());
        let mut stream = OutputStream {
            backend,
            path: options.path,
            content_type,
            metadata: options.metadata,
            default_metadata: options.default_metadata,
            background_writes: options.background_writes,
            allow_delayed_open: options.allow_delayed_open,
            retry_strategy: options.retry_strategy,
            executor: options.executor,
            state: State::Open,
            upload_id: None,
            current_part: BytesMut::with_capacity(PART_SIZE),
            part_number: 0,
            total_written: 0,
            shared: Arc::new(Mutex::new(SharedUploadState::new())),
        };
        if !stream.allow_delayed_open {
            // Validate write permission early by creating the multipart
            // upload at open time, per §4.G's single-request-vs-multipart
            // policy.
            stream.create_multipart().await?;
        }
        Ok(stream)
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.state {
            State::Open | State::Writing => Ok(()),
            _ => Err(Error::invalid_state("write on a stream that is not open")),
        }
    }

    async fn create_multipart(&mut self) -> Result<()> {
        let merged = merge_metadata(&self.default_metadata, &self.metadata);
        let upload_id = self
            .backend
            .create_multipart_upload(&self.path, &self.content_type, &merged)
            .await?;
        self.upload_id = Some(upload_id);
        Ok(())
    }

    /// Coalesce `data` into 10 MiB parts, dispatching each as it fills.
    ///
    /// While no multipart upload exists yet and `allow_delayed_open` holds,
    /// bytes only accumulate in `current_part` — no part is dispatched
    /// until the buffer actually overflows, at which point the multipart
    /// upload is created and the full buffer becomes part 1. Once a
    /// multipart upload exists, a chunk that is itself ≥ part size and
    /// arrives with an empty current buffer is dispatched by slicing the
    /// caller's `Bytes` (a refcount bump, no memory copy); anything smaller
    /// is copied once into `current_part` for buffering.
    pub async fn write(&mut self, mut data: Bytes) -> Result<()> {
        self.ensure_writable()?;
        self.state = State::Writing;
        while !data.is_empty() {
            if self.upload_id.is_none() && self.allow_delayed_open {
                let space = PART_SIZE - self.current_part.len();
                let take = space.min(data.len());
                let chunk = data.split_to(take);
                self.current_part.extend_from_slice(&chunk);
                self.total_written += take as u64;
                if self.current_part.len() == PART_SIZE {
                    self.create_multipart().await?;
                    let full = std::mem::replace(&mut self.current_part, BytesMut::with_capacity(PART_SIZE)).freeze();
                    self.dispatch_part(full).await?;
                }
                continue;
            }

            if self.current_part.is_empty() && data.len() >= PART_SIZE {
                let chunk = data.split_to(PART_SIZE);
                self.total_written += chunk.len() as u64;
                self.dispatch_part(chunk).await?;
                continue;
            }

            let space = PART_SIZE - self.current_part.len();
            let take = space.min(data.len());
            let chunk = data.split_to(take);
            self.current_part.extend_from_slice(&chunk);
            self.total_written += take as u64;
            if self.current_part.len() == PART_SIZE {
                let full = std::mem::replace(&mut self.current_part, BytesMut::with_capacity(PART_SIZE)).freeze();
                self.dispatch_part(full).await?;
            }
        }
        Ok(())
    }

    /// Dispatch a full (or final, possibly short) part. Requires a
    /// multipart upload to already exist.
    async fn dispatch_part(&mut self, chunk: Bytes) -> Result<()> {
        self.part_number += 1;
        let part_number = self.part_number;
        if self.part_number as usize > MAX_PARTS {
            return Err(Error::invalid_state(format!(
                "exceeded the {MAX_PARTS}-part multipart upload limit for {}",
                self.path
            )));
        }
        let upload_id = self
            .upload_id
            .clone()
            .expect("dispatch_part is only called once a multipart upload exists");

        if self.background_writes {
            let executor = self
                .executor
                .clone()
                .expect("background_writes requires an executor");
            self.dispatch_part_background(executor, upload_id, part_number, chunk);
            Ok(())
        } else {
            let etag = self.backend.upload_part(&self.path, &upload_id, part_number, chunk).await?;
            let mut state = self.shared.lock().unwrap();
            ensure_len(&mut state.parts, part_number as usize);
            state.parts[(part_number - 1) as usize] = Some(CompletedPartRecord { part_number, etag });
            Ok(())
        }
    }

    /// Submit `chunk` to the executor and detach it: completion updates
    /// `shared` and signals the completion channel outside the mutex,
    /// per §4.G's background-writes rendezvous.
    fn dispatch_part_background(&self, executor: Arc<dyn Executor>, upload_id: String, part_number: i32, chunk: Bytes) {
        {
            let mut state = self.shared.lock().unwrap();
            state.uploads_in_progress += 1;
            if state.uploads_in_progress == 1 {
                let (tx, _rx) = watch::channel(false);
                state.completion = Some(tx);
            }
        }
        let backend = self.backend.clone();
        let path = self.path.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let _permit = executor.acquire().await;
            let result = backend.upload_part(&path, &upload_id, part_number, chunk).await;
            let sender_to_fire = {
                let mut state = shared.lock().unwrap();
                match result {
                    Ok(etag) => {
                        ensure_len(&mut state.parts, part_number as usize);
                        state.parts[(part_number - 1) as usize] = Some(CompletedPartRecord { part_number, etag });
                    }
                    Err(err) => {
                        if state.status.is_none() {
                            state.status = Some(err);
                        }
                    }
                }
                state.uploads_in_progress -= 1;
                if state.uploads_in_progress == 0 {
                    state.completion.take()
                } else {
                    None
                }
            };
            if let Some(sender) = sender_to_fire {
                let _ = sender.send(true);
            }
        });
    }

    /// Wait for every dispatched background part to complete, returning the
    /// accumulated status. Subscribing to the completion channel while
    /// holding `shared`'s lock closes the race against a concurrent
    /// completion racing the 0-in-flight check.
    async fn await_pending_uploads(&self) -> Result<()> {
        let mut receiver = {
            let mut state = self.shared.lock().unwrap();
            if state.uploads_in_progress == 0 {
                return match state.status.take() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
            state
                .completion
                .as_ref()
                .expect("in-flight uploads always have a completion channel")
                .subscribe()
        };
        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                break;
            }
        }
        let mut state = self.shared.lock().unwrap();
        match state.status.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn take_completed_parts(&self) -> Result<Vec<(i32, String)>> {
        let state = self.shared.lock().unwrap();
        state
            .parts
            .iter()
            .enumerate()
            .map(|(i, slot)| match slot {
                Some(record) => Ok((record.part_number, record.etag.clone())),
                None => Err(Error::invalid_state(format!("missing completed part at index {i}"))),
            })
            .collect()
    }

    async fn complete_with_retry(&self, parts: &[(i32, String)]) -> Result<()> {
        let upload_id = self.upload_id.clone().expect("complete requires a multipart upload");
        let mut attempt = 0u32;
        loop {
            match self.backend.complete_multipart_upload(&self.path, &upload_id, parts, attempt).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let Some(strategy) = self.retry_strategy.as_ref() else {
                        return Err(err);
                    };
                    let detail = retry_detail_from_error(&err);
                    if !strategy.should_retry(&detail, attempt) {
                        return Err(err);
                    }
                    let delay = strategy.delay_ms(&detail, attempt);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn close_inner(&mut self) -> Result<()> {
        self.state = State::Closing;
        if self.upload_id.is_none() {
            let body = std::mem::replace(&mut self.current_part, BytesMut::new()).freeze();
            return self
                .backend
                .put_object(&self.path, body, &self.content_type, &merge_metadata(&self.default_metadata, &self.metadata))
                .await;
        }

        if !self.current_part.is_empty() {
            let full = std::mem::replace(&mut self.current_part, BytesMut::new()).freeze();
            self.dispatch_part(full).await?;
        }
        if self.part_number == 0 {
            // S3 requires at least one part even for an empty object.
            self.dispatch_part(Bytes::new()).await?;
        }
        self.await_pending_uploads().await?;
        let parts = self.take_completed_parts()?;
        self.complete_with_retry(&parts).await
    }

    /// Flush, finalize, and either complete or (implicitly, on failure)
    /// abort the upload.
    pub async fn close(mut self) -> Result<()> {
        match self.close_inner().await {
            Ok(()) => {
                self.state = State::Closed;
                Ok(())
            }
            Err(err) => {
                self.state = State::Failed;
                let _ = self.abort_inner().await;
                Err(err)
            }
        }
    }

    async fn abort_inner(&mut self) -> Result<()> {
        self.current_part.clear();
        if let Some(upload_id) = self.upload_id.take() {
            self.backend.abort_multipart_upload(&self.path, &upload_id).await?;
        }
        self.state = State::Closed;
        Ok(())
    }

    /// Abort explicitly. Safe to call repeatedly: a second call observes
    /// `upload_id` already taken and is a no-op.
    pub async fn abort(&mut self) -> Result<()> {
        self.abort_inner().await
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}

/// [`MultipartBackend`] backed by a live `aws_sdk_s3::Client`.
pub struct S3MultipartBackend {
    holder: Arc<ClientHolder<Client>>,
    sse_customer_key: Option<String>,
}

impl S3MultipartBackend {
    pub fn new(holder: Arc<ClientHolder<Client>>, sse_customer_key: Option<String>) -> Self {
        S3MultipartBackend { holder, sse_customer_key }
    }
}

fn acl_from_metadata(metadata: &ObjectMetadata) -> Option<aws_sdk_s3::types::ObjectCannedAcl> {
    metadata.get("ACL").map(|v| aws_sdk_s3::types::ObjectCannedAcl::from(v.as_str()))
}

fn expires_from_metadata(metadata: &ObjectMetadata) -> Option<aws_smithy_types::DateTime> {
    let raw = metadata.get("Expires")?;
    let parsed = time::OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc2822).ok()?;
    Some(aws_smithy_types::DateTime::from_secs(parsed.unix_timestamp()))
}

#[async_trait]
impl MultipartBackend for S3MultipartBackend {
    async fn put_object(&self, path: &Path, body: Bytes, content_type: &str, metadata: &ObjectMetadata) -> Result<()> {
        let client = self.holder.lock().await?.move_out();
        let mut request = client
            .put_object()
            .bucket(path.bucket_name())
            .key(path.key())
            .content_type(content_type)
            .body(body.into());
        if let Some(v) = metadata.get("Cache-Control") {
            request = request.cache_control(v);
        }
        if let Some(v) = metadata.get("Content-Language") {
            request = request.content_language(v);
        }
        if let Some(acl) = acl_from_metadata(metadata) {
            request = request.acl(acl);
        }
        if let Some(expires) = expires_from_metadata(metadata) {
            request = request.expires(expires);
        }
        if let Some(ref key) = self.sse_customer_key {
            request = request.sse_customer_key(key).sse_customer_algorithm("AES256");
        }
        request.send().await.map_err(|e| from_sdk_error("PutObject", path.clone(), e))?;
        Ok(())
    }

    async fn create_multipart_upload(&self, path: &Path, content_type: &str, metadata: &ObjectMetadata) -> Result<String> {
        let client = self.holder.lock().await?.move_out();
        let mut request = client
            .create_multipart_upload()
            .bucket(path.bucket_name())
            .key(path.key())
            .content_type(content_type);
        if let Some(v) = metadata.get("Cache-Control") {
            request = request.cache_control(v);
        }
        if let Some(v) = metadata.get("Content-Language") {
            request = request.content_language(v);
        }
        if let Some(acl) = acl_from_metadata(metadata) {
            request = request.acl(acl);
        }
        if let Some(expires) = expires_from_metadata(metadata) {
            request = request.expires(expires);
        }
        if let Some(ref key) = self.sse_customer_key {
            request = request.sse_customer_key(key).sse_customer_algorithm("AES256");
        }
        let response = request
            .send()
            .await
            .map_err(|e| from_sdk_error("CreateMultipartUpload", path.clone(), e))?;
        response
            .upload_id()
            .map(str::to_owned)
            .ok_or_else(|| Error::synthesized_io("CreateMultipartUpload", path.clone(), "response did not include an upload id"))
    }

    async fn upload_part(&self, path: &Path, upload_id: &str, part_number: i32, body: Bytes) -> Result<String> {
        let client = self.holder.lock().await?.move_out();
        let mut request = client
            .upload_part()
            .bucket(path.bucket_name())
            .key(path.key())
            .upload_id(upload_id)
            .part_number(part_number)
            .body(body.into());
        if let Some(ref key) = self.sse_customer_key {
            request = request.sse_customer_key(key).sse_customer_algorithm("AES256");
        }
        let response = request.send().await.map_err(|e| from_sdk_error("UploadPart", path.clone(), e))?;
        response
            .e_tag()
            .map(str::to_owned)
            .ok_or_else(|| Error::synthesized_io("UploadPart", path.clone(), "response did not include an ETag"))
    }

    async fn complete_multipart_upload(&self, path: &Path, upload_id: &str, parts: &[(i32, String)], _attempt: u32) -> Result<()> {
        use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};

        let completed_parts = parts
            .iter()
            .map(|(part_number, etag)| CompletedPart::builder().part_number(*part_number).e_tag(etag).build())
            .collect();
        let completed = CompletedMultipartUpload::builder().set_parts(Some(completed_parts)).build();

        let client = self.holder.lock().await?.move_out();
        let response = client
            .complete_multipart_upload()
            .bucket(path.bucket_name())
            .key(path.key())
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| from_sdk_error("CompleteMultipartUpload", path.clone(), e))?;

        // A genuine completion always echoes bucket/key/location; a
        // response with all three empty means the deserializer accepted an
        // `<Error>` body as an empty success struct (the 200-with-embedded-
        // error quirk some servers exhibit).
        if response.bucket().is_none() && response.key().is_none() && response.location().is_none() {
            return Err(Error::synthesized_io(
                "CompleteMultipartUpload",
                path.clone(),
                "server returned HTTP 200 with an empty CompleteMultipartUploadResult",
            ));
        }
        Ok(())
    }

    async fn abort_multipart_upload(&self, path: &Path, upload_id: &str) -> Result<()> {
        let client = self.holder.lock().await?.move_out();
        client
            .abort_multipart_upload()
            .bucket(path.bucket_name())
            .key(path.key())
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| from_sdk_error("AbortMultipartUpload", path.clone(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeBackendState {
        put_objects: Vec<(Path, Bytes)>,
        created: Option<Path>,
        uploaded_parts: Vec<(i32, Bytes)>,
        completed: Option<Vec<(i32, String)>>,
        aborted: bool,
    }

    struct FakeBackend {
        state: Mutex<FakeBackendState>,
        complete_failures_remaining: AtomicU32,
    }

    impl FakeBackend {
        fn new() -> Self {
            FakeBackend {
                state: Mutex::new(FakeBackendState::default()),
                complete_failures_remaining: AtomicU32::new(0),
            }
        }

        fn failing_complete(times: u32) -> Self {
            FakeBackend {
                state: Mutex::new(FakeBackendState::default()),
                complete_failures_remaining: AtomicU32::new(times),
            }
        }
    }

    #[async_trait]
    impl MultipartBackend for FakeBackend {
        async fn put_object(&self, path: &Path, body: Bytes, _content_type: &str, _metadata: &ObjectMetadata) -> Result<()> {
            self.state.lock().unwrap().put_objects.push((path.clone(), body));
            Ok(())
        }

        async fn create_multipart_upload(&self, path: &Path, _content_type: &str, _metadata: &ObjectMetadata) -> Result<String> {
            self.state.lock().unwrap().created = Some(path.clone());
            Ok("fake-upload-id".to_owned())
        }

        async fn upload_part(&self, _path: &Path, _upload_id: &str, part_number: i32, body: Bytes) -> Result<String> {
            self.state.lock().unwrap().uploaded_parts.push((part_number, body));
            Ok(format!("etag-{part_number}"))
        }

        async fn complete_multipart_upload(&self, path: &Path, _upload_id: &str, parts: &[(i32, String)], _attempt: u32) -> Result<()> {
            let remaining = self.complete_failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.complete_failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::synthesized_io(
                    "CompleteMultipartUpload",
                    path.clone(),
                    "<Error><Code>InternalError</Code></Error>",
                ));
            }
            self.state.lock().unwrap().completed = Some(parts.to_vec());
            Ok(())
        }

        async fn abort_multipart_upload(&self, _path: &Path, _upload_id: &str) -> Result<()> {
            self.state.lock().unwrap().aborted = true;
            Ok(())
        }
    }

    fn options(path: &str, allow_delayed_open: bool, background_writes: bool) -> OutputStreamOptions {
        OutputStreamOptions {
            path: Path::parse(path).unwrap(),
            metadata: ObjectMetadata::new(),
            default_metadata: ObjectMetadata::new(),
            background_writes,
            allow_delayed_open,
            retry_strategy: None,
            executor: if background_writes {
                Some(Arc::new(crate::executor::BoundedExecutor::new(4)))
            } else {
                None
            },
        }
    }

    /// Scenario 1: a small write with `allow_delayed_open` stays a single PUT.
    #[tokio::test]
    async fn small_write_with_delayed_open_is_a_single_put() {
        let backend = Arc::new(FakeBackend::new());
        let mut stream = OutputStream::open(backend.clone(), options("bucket/a/b.dat", true, false)).await.unwrap();
        let payload = Bytes::from(vec![0xAAu8; 5 * 1024 * 1024]);
        stream.write(payload.clone()).await.unwrap();
        stream.close().await.unwrap();

        let state = backend.state.lock().unwrap();
        assert_eq!(state.put_objects.len(), 1);
        assert_eq!(state.put_objects[0].1.len(), 5 * 1024 * 1024);
        assert!(state.created.is_none());
    }

    /// Scenario 2: 25 MiB written in 1 MiB chunks with delayed open disabled
    /// creates the multipart upload eagerly and produces 3 dense parts.
    #[tokio::test]
    async fn large_write_without_delayed_open_produces_dense_parts() {
        let backend = Arc::new(FakeBackend::new());
        let mut stream = OutputStream::open(backend.clone(), options("bucket/c.bin", false, false)).await.unwrap();
        assert!(backend.state.lock().unwrap().created.is_some());

        let chunk = Bytes::from(vec![0u8; 1024 * 1024]);
        for _ in 0..25 {
            stream.write(chunk.clone()).await.unwrap();
        }
        stream.close().await.unwrap();

        let state = backend.state.lock().unwrap();
        let sizes: Vec<usize> = state.uploaded_parts.iter().map(|(_, b)| b.len()).collect();
        pretty_assertions::assert_eq!(sizes, vec![PART_SIZE, PART_SIZE, 5 * 1024 * 1024]);
        let numbers: Vec<i32> = state.uploaded_parts.iter().map(|(n, _)| *n).collect();
        pretty_assertions::assert_eq!(numbers, vec![1, 2, 3]);
        let completed = state.completed.clone().unwrap();
        pretty_assertions::assert_eq!(completed, vec![(1, "etag-1".to_owned()), (2, "etag-2".to_owned()), (3, "etag-3".to_owned())]);
    }

    /// P2: completed parts are dense and in order even when dispatched via
    /// the background-writes path, where completion order need not match
    /// dispatch order.
    #[tokio::test]
    async fn background_writes_still_yield_dense_ordered_parts() {
        let backend = Arc::new(FakeBackend::new());
        let mut stream = OutputStream::open(backend.clone(), options("bucket/big.bin", false, true)).await.unwrap();
        let chunk = Bytes::from(vec![7u8; PART_SIZE]);
        for _ in 0..4 {
            stream.write(chunk.clone()).await.unwrap();
        }
        stream.close().await.unwrap();

        let state = backend.state.lock().unwrap();
        let completed = state.completed.clone().unwrap();
        for (i, (part_number, etag)) in completed.iter().enumerate() {
            assert_eq!(*part_number, (i + 1) as i32);
            assert_eq!(etag, &format!("etag-{}", i + 1));
        }
    }

    /// An empty stream still uploads one (empty) part before completing.
    #[tokio::test]
    async fn empty_multipart_upload_gets_one_empty_part() {
        let backend = Arc::new(FakeBackend::new());
        let stream = OutputStream::open(backend.clone(), options("bucket/empty.bin", false, false)).await.unwrap();
        stream.close().await.unwrap();

        let state = backend.state.lock().unwrap();
        assert_eq!(state.uploaded_parts.len(), 1);
        assert_eq!(state.uploaded_parts[0].0, 1);
        assert!(state.uploaded_parts[0].1.is_empty());
    }

    /// Scenario 6: a retry strategy allowing one retry recovers from one
    /// embedded-error completion, and gives up (surfacing the error) after
    /// exhausting its budget.
    #[tokio::test]
    async fn complete_multipart_retries_then_recovers() {
        let backend = Arc::new(FakeBackend::failing_complete(1));
        let mut options = options("bucket/retry.bin", false, false);
        options.retry_strategy = Some(Arc::new(crate::client::retry::ExponentialBackoffRetryStrategy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 1,
        }));
        let mut stream = OutputStream::open(backend.clone(), options).await.unwrap();
        stream.write(Bytes::from(vec![1u8; 10])).await.unwrap();
        stream.close().await.unwrap();
        assert!(backend.state.lock().unwrap().completed.is_some());
    }

    #[tokio::test]
    async fn complete_multipart_gives_up_after_retry_budget_exhausted() {
        let backend = Arc::new(FakeBackend::failing_complete(5));
        let mut options = options("bucket/retry-fail.bin", false, false);
        options.retry_strategy = Some(Arc::new(crate::client::retry::ExponentialBackoffRetryStrategy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
        }));
        let mut stream = OutputStream::open(backend.clone(), options).await.unwrap();
        stream.write(Bytes::from(vec![1u8; 10])).await.unwrap();
        let err = stream.close().await.unwrap_err();
        assert_matches::assert_matches!(err, Error::Io { .. });
        assert!(backend.state.lock().unwrap().aborted);
    }

    #[tokio::test]
    async fn write_after_close_fails_with_invalid_state() {
        let backend = Arc::new(FakeBackend::new());
        let mut stream = OutputStream::open(backend, options("bucket/x", true, false)).await.unwrap();
        stream.write(Bytes::from_static(b"hi")).await.unwrap();
        // simulate a caller trying to reuse the stream after close by
        // exercising ensure_writable directly, since close() consumes self.
        stream.state = State::Closed;
        assert!(matches!(stream.write(Bytes::from_static(b"more")).await, Err(Error::InvalidState { .. })));
    }

    /// P1: the boundary lengths the round-trip property must hold at —
    /// empty, single-byte, one under/at/over a part boundary, and a few
    /// parts plus a remainder.
    #[derive(Debug, Clone, proptest_derive::Arbitrary)]
    struct WriteRoundTripCase {
        #[proptest(strategy = "0usize..6")]
        len_index: usize,
        allow_delayed_open: bool,
        background_writes: bool,
        fill_byte: u8,
    }

    impl WriteRoundTripCase {
        fn len(&self) -> usize {
            const LENGTHS: [usize; 6] = [0, 1, PART_SIZE - 1, PART_SIZE, PART_SIZE + 1, 3 * PART_SIZE + 17];
            LENGTHS[self.len_index]
        }
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(6))]

        /// Whatever combination of delayed-open/background-writes is in
        /// effect, the bytes the backend actually receives (one `PutObject`
        /// body, or every uploaded part concatenated in part-number order)
        /// reconstruct the original payload exactly.
        #[test]
        fn write_round_trip_holds_at_every_boundary_length(case: WriteRoundTripCase) {
            let payload = Bytes::from(vec![case.fill_byte; case.len()]);
            let executor: Option<Arc<dyn Executor>> = if case.background_writes {
                Some(Arc::new(crate::executor::BoundedExecutor::new(4)))
            } else {
                None
            };

            let rt = tokio::runtime::Runtime::new().unwrap();
            let reassembled = rt.block_on(async {
                let backend = Arc::new(FakeBackend::new());
                let opts = OutputStreamOptions {
                    path: Path::parse("bucket/roundtrip.bin").unwrap(),
                    metadata: ObjectMetadata::new(),
                    default_metadata: ObjectMetadata::new(),
                    background_writes: case.background_writes,
                    allow_delayed_open: case.allow_delayed_open,
                    retry_strategy: None,
                    executor,
                };
                let mut stream = OutputStream::open(backend.clone(), opts).await.unwrap();
                stream.write(payload.clone()).await.unwrap();
                stream.close().await.unwrap();

                let state = backend.state.lock().unwrap();
                if let Some((_, body)) = state.put_objects.first() {
                    body.to_vec()
                } else {
                    let mut parts = state.uploaded_parts.clone();
                    parts.sort_by_key(|(part_number, _)| *part_number);
                    parts.into_iter().flat_map(|(_, body)| body.to_vec()).collect()
                }
            });

            proptest::prop_assert_eq!(reassembled, payload.to_vec());
        }
    }
}
