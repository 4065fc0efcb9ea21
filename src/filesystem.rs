//! Filesystem facade: orchestrates stat, mkdir (recursive), delete, move,
//! and copy over the path model, client holder, output stream, and
//! listing engine.
//!
//! Grounded on the `Transport` trait's method shapes (`metadata`,
//! `create_dir`, `remove_file`, `remove_dir_all`, `sub_transport` in
//! `transport.rs`), generalized to S3 semantics: bucket creation and
//! deletion, directory markers, `IsDirectory` classification by content
//! length/trailing-slash/content-type, and parent-marker recreation,
//! none of which a local/SFTP transport needs.

use std::sync::Arc;

use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration, Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace_span;

use crate::backend::Backend;
use crate::client::builder::ClientOptions;
use crate::client::holder::ClientHolder;
use crate::client::retry::RetryStrategy;
use crate::error::{from_sdk_error, sdk_error_code, sdk_error_is_not_found, Error, Result};
use crate::executor::Executor;
use crate::file_info::{FileInfo, FileType, ObjectMetadata};
use crate::io::{InputFile, OutputStream, OutputStreamOptions, S3MultipartBackend};
use crate::listing::{self, Selector};
use crate::path::Path;

const DELETE_BATCH_SIZE: usize = 1_000;

/// The facade a caller constructs and holds for the lifetime of an S3
/// filesystem session.
pub struct Filesystem {
    holder: Arc<ClientHolder<Client>>,
    executor: Arc<dyn Executor>,
    region: String,
    retry_strategy: Option<Arc<dyn RetryStrategy>>,
    default_metadata: ObjectMetadata,
    background_writes: bool,
    allow_delayed_open: bool,
    allow_bucket_creation: bool,
    allow_bucket_deletion: bool,
    check_directory_existence_before_creation: bool,
    backend: Backend,
    sse_customer_key: Option<String>,
}

impl std::fmt::Debug for Filesystem {
    #[mutants::skip] // unimportant to test
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem").field("region", &self.region).field("backend", &self.backend).finish()
    }
}

impl Filesystem {
    pub fn new(holder: Arc<ClientHolder<Client>>, executor: Arc<dyn Executor>, options: &ClientOptions) -> Self {
        Filesystem {
            holder,
            executor,
            region: options.region.clone().unwrap_or_else(|| "us-east-1".to_owned()),
            retry_strategy: options.retry_strategy.clone(),
            default_metadata: options.default_metadata.clone(),
            background_writes: options.background_writes,
            allow_delayed_open: options.allow_delayed_open,
            allow_bucket_creation: options.allow_bucket_creation,
            allow_bucket_deletion: options.allow_bucket_deletion,
            check_directory_existence_before_creation: options.check_directory_existence_before_creation,
            backend: options.backend,
            sse_customer_key: options.sse_customer_key.clone(),
        }
    }

    /// Begin a listing; see [`crate::listing::generate`].
    pub fn list(&self, selector: Selector) -> mpsc::Receiver<Result<Vec<FileInfo>>> {
        let _span = trace_span!("Filesystem::list", base_dir = %selector.base_dir, recursive = selector.recursive).entered();
        listing::generate(self.holder.clone(), self.executor.clone(), selector)
    }

    pub async fn open_input_file(&self, path: Path, info: Option<&FileInfo>) -> Result<InputFile> {
        let _span = trace_span!("Filesystem::open_input_file", %path).entered();
        InputFile::open(self.holder.clone(), path, info, self.sse_customer_key.clone()).await
    }

    pub async fn open_output_stream(&self, path: Path, metadata: ObjectMetadata) -> Result<OutputStream<S3MultipartBackend>> {
        let _span = trace_span!("Filesystem::open_output_stream", %path).entered();
        let backend = Arc::new(S3MultipartBackend::new(self.holder.clone(), self.sse_customer_key.clone()));
        let options = OutputStreamOptions {
            path,
            metadata,
            default_metadata: self.default_metadata.clone(),
            background_writes: self.background_writes,
            allow_delayed_open: self.allow_delayed_open,
            retry_strategy: self.retry_strategy.clone(),
            executor: if self.background_writes { Some(self.executor.clone()) } else { None },
        };
        OutputStream::open(backend, options).await
    }

    /// Always fails: appending to an existing object has no S3 analogue.
    #[mutants::skip] // does nothing so hard to observe!
    pub async fn open_append_stream(&self, path: Path) -> Result<()> {
        let _span = trace_span!("Filesystem::open_append_stream", %path).entered();
        Err(Error::NotImplemented {
            what: "append-to-object semantics",
        })
    }

    pub async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let _span = trace_span!("Filesystem::stat", %path).entered();
        if path.is_root() {
            return Ok(FileInfo::directory(Path::root()));
        }
        if path.is_bucket_only() {
            return self.stat_bucket(path).await;
        }
        self.stat_key(path).await
    }

    async fn stat_bucket(&self, path: &Path) -> Result<FileInfo> {
        let client = self.holder.lock().await?.move_out();
        match client.head_bucket().bucket(path.bucket_name()).send().await {
            Ok(_) => Ok(FileInfo::directory(path.clone())),
            Err(err) if sdk_error_is_not_found(&err) => Ok(FileInfo::not_found(path.clone())),
            Err(err) => Err(from_sdk_error("HeadBucket", path.clone(), err)),
        }
    }

    async fn stat_key(&self, path: &Path) -> Result<FileInfo> {
        let client = self.holder.lock().await?.move_out();
        let mut request = client.head_object().bucket(path.bucket_name()).key(path.key());
        if let Some(ref key) = self.sse_customer_key {
            request = request.sse_customer_key(key).sse_customer_algorithm("AES256");
        }
        match request.send().await {
            Ok(response) => {
                let content_length = response.content_length().unwrap_or(0);
                let file_type = FileInfo::classify_object(path.key(), content_length, response.content_type());
                let mtime = response
                    .last_modified()
                    .and_then(|dt| aws_smithy_types_convert::date_time::DateTimeExt::to_time(*dt).ok());
                Ok(match file_type {
                    FileType::Directory => FileInfo::directory(path.clone()),
                    _ => FileInfo::file(path.clone(), content_length, mtime),
                })
            }
            Err(err) if sdk_error_is_not_found(&err) => self.probe_as_directory(path).await,
            Err(err) => Err(from_sdk_error("HeadObject", path.clone(), err)),
        }
    }

    /// A `HeadObject` 404 does not rule out an implicit directory: probe a
    /// trailing-slash marker, then a single-key listing under the prefix,
    /// before conceding `NotFound`.
    async fn probe_as_directory(&self, path: &Path) -> Result<FileInfo> {
        if self.backend.probe_trailing_slash_for_empty_directory() {
            let client = self.holder.lock().await?.move_out();
            let marker_key = format!("{}/", path.key());
            if client.head_object().bucket(path.bucket_name()).key(marker_key).send().await.is_ok() {
                return Ok(FileInfo::directory(path.clone()));
            }
        }

        let client = self.holder.lock().await?.move_out();
        let prefix = format!("{}/", path.key());
        let listing = client
            .list_objects_v2()
            .bucket(path.bucket_name())
            .prefix(prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| from_sdk_error("ListObjectsV2", path.clone(), e))?;
        if !listing.contents().is_empty() || !listing.common_prefixes().is_empty() {
            return Ok(FileInfo::directory(path.clone()));
        }
        Ok(FileInfo::not_found(path.clone()))
    }

    pub async fn create_dir(&self, path: &Path, recursive: bool) -> Result<()> {
        let _span = trace_span!("Filesystem::create_dir", %path, recursive).entered();
        if path.is_root() {
            return Err(Error::invalid_input("cannot create the filesystem root"));
        }
        if path.is_bucket_only() {
            return self.create_bucket(path).await;
        }

        self.ensure_no_conflicting_file(path).await?;

        if recursive {
            self.ensure_bucket_exists(path).await?;
            for ancestor in ancestors_from_bucket(path) {
                self.put_directory_marker(&ancestor).await?;
            }
            Ok(())
        } else {
            let parent = path.parent()?;
            self.ensure_parent_exists(&parent).await?;
            self.put_directory_marker(path).await
        }
    }

    async fn ensure_no_conflicting_file(&self, path: &Path) -> Result<()> {
        if !self.check_directory_existence_before_creation && !self.backend.forces_directory_existence_check() {
            return Ok(());
        }
        if self.stat(path).await?.is_file() {
            return Err(Error::io(
                "PutObject",
                path.clone(),
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "a non-directory object already exists at this path"),
            ));
        }
        Ok(())
    }

    async fn ensure_parent_exists(&self, parent: &Path) -> Result<()> {
        if self.stat(parent).await?.file_type == FileType::NotFound {
            return Err(Error::PathNotFound { path: parent.clone() });
        }
        Ok(())
    }

    async fn ensure_bucket_exists(&self, path: &Path) -> Result<()> {
        let bucket_path = Path::bucket(path.bucket_name().to_owned());
        if self.stat(&bucket_path).await?.file_type != FileType::NotFound {
            return Ok(());
        }
        self.create_bucket(&bucket_path).await
    }

    async fn create_bucket(&self, path: &Path) -> Result<()> {
        if !self.allow_bucket_creation {
            return Err(Error::invalid_input(format!("bucket creation is disabled: {path}")));
        }
        let client = self.holder.lock().await?.move_out();
        let mut request = client.create_bucket().bucket(path.bucket_name());
        if self.backend == Backend::Aws && self.region != "us-east-1" {
            let configuration = CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                .build();
            request = request.create_bucket_configuration(configuration);
        }
        match request.send().await {
            Ok(_) => Ok(()),
            Err(err) if sdk_error_code(&err) == Some("BucketAlreadyOwnedByYou") => Ok(()),
            Err(err) => Err(from_sdk_error("CreateBucket", path.clone(), err)),
        }
    }

    async fn put_directory_marker(&self, path: &Path) -> Result<()> {
        let client = self.holder.lock().await?.move_out();
        let key = format!("{}/", path.key());
        let mut request = client
            .put_object()
            .bucket(path.bucket_name())
            .key(key)
            .content_type("application/x-directory")
            .body(Bytes::new().into());
        if let Some(ref sse_key) = self.sse_customer_key {
            request = request.sse_customer_key(sse_key).sse_customer_algorithm("AES256");
        }
        request.send().await.map_err(|e| from_sdk_error("PutObject", path.clone(), e))?;
        Ok(())
    }

    pub async fn delete_dir(&self, path: &Path) -> Result<()> {
        let _span = trace_span!("Filesystem::delete_dir", %path).entered();
        if path.is_root() {
            return Err(Error::NotImplemented {
                what: "deleting the filesystem root",
            });
        }
        if path.is_bucket_only() {
            if !self.allow_bucket_deletion {
                return Err(Error::invalid_input(format!("bucket deletion is disabled: {path}")));
            }
            self.delete_objects_under(path, true).await?;
            return self.delete_bucket(path).await;
        }

        self.delete_objects_under(path, true).await?;
        self.delete_marker_if_present(path).await?;
        let parent = path.parent()?;
        if !parent.key().is_empty() {
            self.put_directory_marker(&parent).await?;
        }
        Ok(())
    }

    pub async fn delete_dir_contents(&self, path: &Path, missing_dir_ok: bool) -> Result<()> {
        let _span = trace_span!("Filesystem::delete_dir_contents", %path).entered();
        if path.is_root() {
            return Err(Error::NotImplemented {
                what: "deleting the contents of the filesystem root",
            });
        }
        self.delete_objects_under(path, missing_dir_ok).await?;
        if !path.is_bucket_only() {
            self.put_directory_marker(path).await?;
        }
        Ok(())
    }

    pub async fn delete_file(&self, path: &Path) -> Result<()> {
        let _span = trace_span!("Filesystem::delete_file", %path).entered();
        let client = self.holder.lock().await?.move_out();
        let mut head_request = client.head_object().bucket(path.bucket_name()).key(path.key());
        if let Some(ref key) = self.sse_customer_key {
            head_request = head_request.sse_customer_key(key).sse_customer_algorithm("AES256");
        }
        head_request.send().await.map_err(|e| from_sdk_error("HeadObject", path.clone(), e))?;

        let client = self.holder.lock().await?.move_out();
        client
            .delete_object()
            .bucket(path.bucket_name())
            .key(path.key())
            .send()
            .await
            .map_err(|e| from_sdk_error("DeleteObject", path.clone(), e))?;

        if path.has_parent() {
            let parent = path.parent()?;
            if !parent.key().is_empty() {
                self.put_directory_marker(&parent).await?;
            }
        }
        Ok(())
    }

    /// Copy then delete the source. A no-op when `src == dest`. Moving a
    /// directory wholesale is not implemented; this acts on a single key.
    pub async fn move_(&self, src: &Path, dest: &Path) -> Result<()> {
        let _span = trace_span!("Filesystem::move_", %src, %dest).entered();
        if src == dest {
            return Ok(());
        }
        self.copy_file(src, dest).await?;
        self.delete_file(src).await
    }

    pub async fn copy_file(&self, src: &Path, dest: &Path) -> Result<()> {
        let _span = trace_span!("Filesystem::copy_file", %src, %dest).entered();
        let client = self.holder.lock().await?.move_out();
        let mut request = client
            .copy_object()
            .bucket(dest.bucket_name())
            .key(dest.key())
            .copy_source(src.to_url_encoded());
        if let Some(ref key) = self.sse_customer_key {
            request = request
                .sse_customer_key(key)
                .sse_customer_algorithm("AES256")
                .copy_source_sse_customer_key(key)
                .copy_source_sse_customer_algorithm("AES256");
        }
        request.send().await.map_err(|e| from_sdk_error("CopyObject", dest.clone(), e))?;
        Ok(())
    }

    async fn delete_bucket(&self, path: &Path) -> Result<()> {
        let client = self.holder.lock().await?.move_out();
        client
            .delete_bucket()
            .bucket(path.bucket_name())
            .send()
            .await
            .map_err(|e| from_sdk_error("DeleteBucket", path.clone(), e))?;
        Ok(())
    }

    async fn delete_marker_if_present(&self, path: &Path) -> Result<()> {
        let client = self.holder.lock().await?.move_out();
        let key = format!("{}/", path.key());
        match client.delete_object().bucket(path.bucket_name()).key(key).send().await {
            Ok(_) => Ok(()),
            Err(err) if sdk_error_is_not_found(&err) => Ok(()),
            Err(err) => Err(from_sdk_error("DeleteObject", path.clone(), err)),
        }
    }

    /// List everything under `path` recursively and delete it in chunks of
    /// [`DELETE_BATCH_SIZE`], aggregating any per-key failures into a
    /// single [`Error::MultiDelete`].
    async fn delete_objects_under(&self, path: &Path, missing_dir_ok: bool) -> Result<()> {
        let selector = Selector {
            base_dir: path.clone(),
            recursive: true,
            max_recursion: usize::MAX,
            allow_not_found: missing_dir_ok,
        };
        let mut receiver = self.list(selector);

        let mut pending: Vec<String> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        let mut total_attempted = 0usize;

        while let Some(item) = receiver.recv().await {
            let batch = item?;
            for entry in batch {
                let key = if entry.is_directory() {
                    format!("{}/", entry.path.key())
                } else {
                    entry.path.key().to_owned()
                };
                pending.push(key);
                if pending.len() == DELETE_BATCH_SIZE {
                    total_attempted += pending.len();
                    self.flush_delete_batch(path.bucket_name(), std::mem::take(&mut pending), &mut failures).await?;
                }
            }
        }
        if !pending.is_empty() {
            total_attempted += pending.len();
            self.flush_delete_batch(path.bucket_name(), pending, &mut failures).await?;
        }

        if !failures.is_empty() {
            return Err(Error::MultiDelete {
                path: path.clone(),
                count: failures.len(),
                total: total_attempted,
                detail: failures.join("; "),
            });
        }
        Ok(())
    }

    async fn flush_delete_batch(&self, bucket: &str, keys: Vec<String>, failures: &mut Vec<String>) -> Result<()> {
        let objects: Vec<ObjectIdentifier> = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build().expect("key is a required field"))
            .collect();
        let delete = Delete::builder().set_objects(Some(objects)).build().expect("objects is a required field");

        let client = self.holder.lock().await?.move_out();
        let response = client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| from_sdk_error("DeleteObjects", Path::bucket(bucket.to_owned()), e))?;

        for error in response.errors() {
            failures.push(format!("{}: {}", error.key().unwrap_or_default(), error.message().unwrap_or_default()));
        }
        Ok(())
    }
}

/// `path` and its ancestors up to (but not including) the bucket root,
/// ordered from shallowest to deepest so markers can be created top-down.
fn ancestors_from_bucket(path: &Path) -> Vec<Path> {
    let mut chain = vec![path.clone()];
    let mut current = path.clone();
    while current.has_parent() {
        let parent = current.parent().expect("has_parent just checked");
        if parent.key().is_empty() {
            break;
        }
        chain.push(parent.clone());
        current = parent;
    }
    chain.reverse();
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestors_from_bucket_orders_shallow_to_deep() {
        let path = Path::new("bucket", "a/b/c");
        let chain: Vec<String> = ancestors_from_bucket(&path).into_iter().map(|p| p.key().to_owned()).collect();
        assert_eq!(chain, vec!["a", "a/b", "a/b/c"]);
    }

    #[test]
    fn ancestors_from_bucket_single_segment() {
        let path = Path::new("bucket", "a");
        let chain: Vec<String> = ancestors_from_bucket(&path).into_iter().map(|p| p.key().to_owned()).collect();
        assert_eq!(chain, vec!["a"]);
    }
}
