//! An S3 bucket presented as a hierarchical filesystem: stat, list,
//! create/delete directories, read/write objects through streaming
//! handles, and move/copy, all addressed by `bucket[/key]` paths.
//!
//! The crate is organized bottom-up:
//!
//! - [`path`] parses and manipulates `bucket[/key]` paths.
//! - [`backend`] captures the handful of quirks that differ between AWS,
//!   MinIO, and other S3-compatible services.
//! - [`file_info`] is the stat record shape returned by [`filesystem`]
//!   and [`listing`].
//! - [`error`] is the crate's error taxonomy and SDK-error classification.
//! - [`executor`] bounds background concurrency for multipart dispatch
//!   and listing fan-out.
//! - [`client`] builds and holds the underlying `aws_sdk_s3::Client`,
//!   with a finalization barrier so in-flight calls drain cleanly.
//! - [`io`] is the per-object read/write surface: [`io::InputFile`] for
//!   ranged reads, [`io::OutputStream`] for buffered/multipart writes.
//! - [`listing`] is the paginated, recursion-bounded, implicit-directory
//!   aware listing engine.
//! - [`filesystem`] is the facade tying all of the above together.

pub mod backend;
pub mod client;
pub mod error;
pub mod executor;
pub mod file_info;
pub mod filesystem;
pub mod io;
pub mod listing;
pub mod path;

pub use backend::Backend;
pub use client::{build_client, BuiltClient, ClientHolder, ClientOptions, Finalizer, RetryStrategy};
pub use error::{Error, Result};
pub use executor::{BoundedExecutor, Executor, ExecutorPermit};
pub use file_info::{FileInfo, FileType, ObjectMetadata};
pub use filesystem::Filesystem;
pub use io::{InputFile, OutputStream};
pub use listing::Selector;
pub use path::Path;

use std::sync::Arc;

/// Build a ready-to-use [`Filesystem`] from a set of [`ClientOptions`],
/// wiring up a [`client::Finalizer`] and a [`BoundedExecutor`] sized from
/// `options.executor_capacity`.
///
/// Most callers only need this one entry point; the individual pieces
/// ([`client::build_client`], [`BoundedExecutor::new`], [`Filesystem::new`])
/// are exposed separately for callers that want to share a client or
/// executor across more than one [`Filesystem`].
pub async fn open(options: ClientOptions) -> Result<Filesystem> {
    let finalizer = Finalizer::new();
    let built = build_client(&options, &finalizer).await?;
    let executor: Arc<dyn Executor> = Arc::new(BoundedExecutor::new(options.executor_capacity));
    Ok(Filesystem::new(built.holder, executor, &options))
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
