//! Paginated, recursion-bounded, implicit-directory-aware listing.
//!
//! Grounded on `S3Transport::list_dir`'s paginator usage
//! (`list_objects_v2().into_paginator().send()`, consuming
//! `common_prefixes` and `contents`), generalized from single-page,
//! non-recursive, synchronous listing into the continuation-driven,
//! async, recursion-bounded engine described in §4.H. Classification
//! itself (`PageClassifier`) operates on plain structs rather than SDK
//! response types, so it is exercised in tests against synthetic pages
//! with no client or network dependency.

use std::collections::HashSet;
use std::sync::Arc;

use aws_sdk_s3::Client;
use tokio::sync::mpsc;

use crate::client::holder::ClientHolder;
use crate::error::{from_sdk_error, Error, Result};
use crate::executor::Executor;
use crate::file_info::FileInfo;
use crate::path::Path;

/// What to list and how far to descend.
pub struct Selector {
    /// Empty (root) path lists every bucket. A bucket-only path lists a
    /// whole bucket. A bucket+key path lists that key as a directory
    /// prefix.
    pub base_dir: Path,
    pub recursive: bool,
    pub max_recursion: usize,
    pub allow_not_found: bool,
}

/// One page of raw `ListObjectsV2` results, independent of the SDK's
/// response type so [`PageClassifier`] is testable without one.
#[derive(Debug, Clone, Default)]
pub struct RawPage {
    pub common_prefixes: Vec<String>,
    pub contents: Vec<RawObject>,
    pub next_continuation_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RawObject {
    pub key: String,
    pub size: i64,
}

/// Number of non-empty `/`-separated segments in `s`, ignoring a trailing
/// slash. `""` has zero segments.
fn segment_count(s: &str) -> usize {
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() {
        0
    } else {
        trimmed.split('/').count()
    }
}

/// `depth(child_key) − depth(prefix) − 1`, per §4.H: a file directly
/// inside the prefix has depth 0.
fn recursion_depth(prefix: &str, child_key: &str) -> i64 {
    segment_count(child_key) as i64 - segment_count(prefix) as i64 - 1
}

/// Per-generator classification state: turns one page's common prefixes
/// and contents into [`FileInfo`] entries, synthesizing implicit
/// directories and enforcing the recursion bound.
///
/// `emitted_dirs` dedups directory entries (explicit markers, common
/// prefixes, and synthesized ancestors alike) across the whole listing's
/// lifetime, per the "per-generator set" design note. `emitted_files`
/// additionally suppresses the corner case in which a truncated
/// ancestor's key coincides with an object that was already classified
/// as a file earlier in the same listing (scenario 4: `a/b` is a literal
/// key, so it is not also synthesized as a directory when `a/b/c`'s
/// ancestry is truncated).
pub struct PageClassifier {
    bucket: String,
    max_recursion: usize,
    emitted_dirs: HashSet<String>,
    emitted_files: HashSet<String>,
    saw_any: bool,
}

impl PageClassifier {
    pub fn new(bucket: impl Into<String>, max_recursion: usize) -> Self {
        PageClassifier {
            bucket: bucket.into(),
            max_recursion,
            emitted_dirs: HashSet::new(),
            emitted_files: HashSet::new(),
            saw_any: false,
        }
    }

    pub fn saw_any(&self) -> bool {
        self.saw_any
    }

    fn emit_dir_if_new(&mut self, key: String, out: &mut Vec<FileInfo>) {
        if self.emitted_dirs.insert(key.clone()) {
            out.push(FileInfo::directory(Path::new(&self.bucket, key)));
        }
    }

    /// Walk parent-wards from `key`'s immediate parent up to (not
    /// including) `prefix`'s base, emitting any directory not yet seen.
    fn synth_ancestors(&mut self, prefix: &str, key: &str, out: &mut Vec<FileInfo>) {
        let base_depth = segment_count(prefix);
        let mut current = key.rsplit_once('/').map(|(parent, _)| parent.to_owned());
        while let Some(dir) = current {
            if segment_count(&dir) <= base_depth {
                break;
            }
            self.emit_dir_if_new(dir.clone(), out);
            current = dir.rsplit_once('/').map(|(parent, _)| parent.to_owned());
        }
    }

    /// A content key exceeded `max_recursion`: offer its ancestor at
    /// exactly `max_recursion + 1` levels past the prefix to the
    /// synthesizer, unless that path was already emitted as a file.
    fn handle_truncated(&mut self, prefix: &str, key: &str, out: &mut Vec<FileInfo>) {
        let base_depth = segment_count(prefix);
        let truncated_depth = base_depth + self.max_recursion + 1;
        let segments: Vec<&str> = key.trim_end_matches('/').split('/').collect();
        if segments.len() < truncated_depth {
            return;
        }
        let truncated = segments[..truncated_depth].join("/");
        if !self.emitted_files.contains(&truncated) {
            self.emit_dir_if_new(truncated.clone(), out);
        }
        self.synth_ancestors(prefix, &truncated, out);
    }

    /// Classify one page, returning the batch of entries it produced.
    pub fn classify_page(&mut self, prefix: &str, page: &RawPage) -> Vec<FileInfo> {
        let mut out = Vec::new();

        for cp in &page.common_prefixes {
            self.saw_any = true;
            let dir_key = cp.trim_end_matches('/').to_owned();
            self.emit_dir_if_new(dir_key, &mut out);
        }

        for obj in &page.contents {
            if obj.key == prefix {
                self.saw_any = true;
                continue;
            }
            self.saw_any = true;

            let depth = recursion_depth(prefix, &obj.key);
            if depth > self.max_recursion as i64 {
                self.handle_truncated(prefix, &obj.key, &mut out);
                continue;
            }

            let is_dir_marker = obj.size == 0 && obj.key.ends_with('/');
            if is_dir_marker {
                let dir_key = obj.key.trim_end_matches('/').to_owned();
                self.emit_dir_if_new(dir_key.clone(), &mut out);
                self.synth_ancestors(prefix, &dir_key, &mut out);
            } else {
                self.emitted_files.insert(obj.key.clone());
                out.push(FileInfo::file(Path::new(&self.bucket, obj.key.clone()), obj.size, None));
                self.synth_ancestors(prefix, &obj.key, &mut out);
            }
        }

        out
    }
}

/// Whether an exhausted listing with no entries at all should surface
/// `PathNotFound`, per §4.H's empty-result policy.
fn not_found_outcome(prefix: &str, saw_any: bool, allow_not_found: bool) -> bool {
    !prefix.is_empty() && !saw_any && !allow_not_found
}

/// The `prefix` sent to `ListObjectsV2` for `path`: its key with a single
/// trailing slash, or `""` for a bucket-only path (listing the whole
/// bucket).
fn prefix_for(path: &Path) -> String {
    path.key_with_trailing_slash()
}

/// Begin a listing, returning the receiving end of a channel fed with
/// one `Ok(batch)` per page (or a single `Err` that ends the listing).
///
/// Spawns the driving task immediately; dropping the receiver stops
/// production as soon as the next send would fail.
pub fn generate(holder: Arc<ClientHolder<Client>>, executor: Arc<dyn Executor>, selector: Selector) -> mpsc::Receiver<Result<Vec<FileInfo>>> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(run(holder, executor, selector, tx));
    rx
}

async fn run(holder: Arc<ClientHolder<Client>>, executor: Arc<dyn Executor>, selector: Selector, tx: mpsc::Sender<Result<Vec<FileInfo>>>) {
    if selector.base_dir.is_root() {
        run_full_bucket(holder, executor, selector, tx).await;
        return;
    }
    let bucket = selector.base_dir.bucket_name().to_owned();
    let prefix = prefix_for(&selector.base_dir);
    paginate_prefix(holder, executor, bucket, prefix, selector.recursive, selector.max_recursion, selector.allow_not_found, tx).await;
}

async fn run_full_bucket(holder: Arc<ClientHolder<Client>>, executor: Arc<dyn Executor>, selector: Selector, tx: mpsc::Sender<Result<Vec<FileInfo>>>) {
    let buckets = {
        let _permit = executor.acquire().await;
        match list_buckets(&holder).await {
            Ok(buckets) => buckets,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    };

    let dir_entries: Vec<FileInfo> = buckets.iter().cloned().map(Path::bucket).map(FileInfo::directory).collect();
    if !dir_entries.is_empty() && tx.send(Ok(dir_entries)).await.is_err() {
        return;
    }

    if !selector.recursive {
        return;
    }

    // Fan out a recursive per-bucket listing in parallel through the same
    // scheduler; the sink tolerates concurrent producers, per §4.H.
    let mut handles = Vec::new();
    for bucket in buckets {
        let holder = holder.clone();
        let executor = executor.clone();
        let tx = tx.clone();
        let max_recursion = selector.max_recursion;
        handles.push(tokio::spawn(async move {
            paginate_prefix(holder, executor, bucket, String::new(), true, max_recursion, true, tx).await;
        }));
    }
    drop(tx);
    for handle in handles {
        let _ = handle.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn paginate_prefix(
    holder: Arc<ClientHolder<Client>>,
    executor: Arc<dyn Executor>,
    bucket: String,
    prefix: String,
    recursive: bool,
    max_recursion: usize,
    allow_not_found: bool,
    tx: mpsc::Sender<Result<Vec<FileInfo>>>,
) {
    let mut classifier = PageClassifier::new(bucket.clone(), max_recursion);
    let mut continuation_token: Option<String> = None;

    loop {
        if executor.stop_token().is_cancelled() {
            let _ = tx.send(Err(Error::Cancelled)).await;
            return;
        }
        let page = {
            let _permit = executor.acquire().await;
            fetch_page(&holder, &bucket, &prefix, recursive, continuation_token.as_deref()).await
        };
        let page = match page {
            Ok(page) => page,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };

        let has_more = page.next_continuation_token.is_some();
        continuation_token.clone_from(&page.next_continuation_token);
        let batch = classifier.classify_page(&prefix, &page);
        if !batch.is_empty() && tx.send(Ok(batch)).await.is_err() {
            return;
        }
        if !has_more {
            break;
        }
    }

    if not_found_outcome(&prefix, classifier.saw_any(), allow_not_found) {
        let path = Path::new(bucket, prefix.trim_end_matches('/').to_owned());
        let _ = tx.send(Err(Error::PathNotFound { path })).await;
    }
}

async fn fetch_page(holder: &Arc<ClientHolder<Client>>, bucket: &str, prefix: &str, recursive: bool, continuation_token: Option<&str>) -> Result<RawPage> {
    let client = holder.lock().await?.move_out();
    let mut request = client.list_objects_v2().bucket(bucket).max_keys(1000);
    if !prefix.is_empty() {
        request = request.prefix(prefix);
    }
    if !recursive {
        request = request.delimiter("/");
    }
    if let Some(token) = continuation_token {
        request = request.continuation_token(token);
    }
    let response = request.send().await.map_err(|e| {
        from_sdk_error("ListObjectsV2", Path::new(bucket.to_owned(), prefix.trim_end_matches('/').to_owned()), e)
    })?;

    let common_prefixes = response
        .common_prefixes()
        .iter()
        .filter_map(|cp| cp.prefix().map(str::to_owned))
        .collect();
    let contents = response
        .contents()
        .iter()
        .map(|o| RawObject {
            key: o.key().unwrap_or_default().to_owned(),
            size: o.size().unwrap_or(0),
        })
        .collect();
    Ok(RawPage {
        common_prefixes,
        contents,
        next_continuation_token: response.next_continuation_token().map(str::to_owned),
    })
}

async fn list_buckets(holder: &Arc<ClientHolder<Client>>) -> Result<Vec<String>> {
    let client = holder.lock().await?.move_out();
    let response = client
        .list_buckets()
        .send()
        .await
        .map_err(|e| from_sdk_error("ListBuckets", Path::root(), e))?;
    Ok(response.buckets().iter().filter_map(|b| b.name().map(str::to_owned)).collect())
}
