//! Error taxonomy for the S3 filesystem adapter.
//!
//! Grounded on the teacher's `transport::error::Error`/`ErrorKind` split,
//! generalized from a single file-IO error shape to the full set of
//! outcomes an S3-backed filesystem can produce.

use std::fmt;

use aws_smithy_types::error::metadata::ProvideErrorMetadata;

use crate::path::Path;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the filesystem adapter.
///
/// Every IO-carrying variant names the S3 operation that failed and the
/// `(bucket, key)` it was operating on, per the user-visible rule in the
/// spec's error handling design.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A path, scheme, or ACL value failed validation before any request was sent.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// An operation was attempted against a stream or upload that is not in
    /// a state that permits it (e.g. reading a closed `InputFile`).
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// Either a bucket or a key that is not an implicit/explicit directory is missing.
    #[error("path not found: {path}")]
    PathNotFound { path: Path },

    /// A directory was requested where a non-directory object already exists.
    #[error("already exists: {path}")]
    AlreadyExists { path: Path },

    /// A wire-level failure: a service error, a transport error, or the
    /// 200-with-embedded-error CompleteMultipartUpload quirk.
    #[error("{operation} failed for {path}: {message}")]
    Io {
        operation: &'static str,
        path: Path,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Several keys in one DeleteObjects batch failed; each is listed.
    #[error("DeleteObjects failed for {count} of {total} keys in {path}: {detail}")]
    MultiDelete {
        path: Path,
        count: usize,
        total: usize,
        detail: String,
    },

    /// The requested operation is deliberately unsupported (append, directory
    /// move, bulk bucket deletion, deleting the contents of the root).
    #[error("not implemented: {what}")]
    NotImplemented { what: &'static str },

    /// The global finalizer has run; no further client calls are permitted.
    #[error("S3 filesystem subsystem has been finalized")]
    Finalized,

    /// The operation was cancelled via the I/O executor's stop token.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState {
            message: message.into(),
        }
    }

    pub fn io(
        operation: &'static str,
        path: Path,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Io {
            operation,
            path,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Build an IO error from a synthesized message with no underlying
    /// `std::error::Error`, used for the 200-with-embedded-error workaround
    /// where the failure is parsed out of a response body rather than
    /// surfaced by the SDK as a `SdkError`.
    pub fn synthesized_io(operation: &'static str, path: Path, message: impl Into<String>) -> Self {
        Error::Io {
            operation,
            path,
            message: message.into(),
            source: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::PathNotFound { .. })
    }
}

/// Abstract detail extracted from an S3 error, passed to a [`crate::client::retry::RetryStrategy`].
///
/// Grounded on the same dispatch shape as the teacher's
/// `impl From<&XxxError> for ErrorKind`, generalized into a single struct
/// so retry decisions do not need one `From` impl per SDK error type.
#[derive(Debug, Clone)]
pub struct RetryDetail {
    pub error_code: String,
    pub message: String,
    pub exception_name: &'static str,
    pub transient_hint: bool,
}

impl fmt::Display for RetryDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.exception_name, self.error_code, self.message)
    }
}

/// S3 error codes this crate treats as "the bucket or key is missing",
/// regardless of which operation produced them.
const NOT_FOUND_ERROR_CODES: &[&str] = &["NoSuchKey", "NoSuchBucket", "NotFound", "404"];

/// The error code an `SdkError::ServiceError` carries, if any.
pub fn sdk_error_code<E, R>(source: &aws_sdk_s3::error::SdkError<E, R>) -> Option<&str>
where
    E: ProvideErrorMetadata,
{
    match source {
        aws_sdk_s3::error::SdkError::ServiceError(service_err) => service_err.err().code(),
        _ => None,
    }
}

/// Whether `source` is an S3 "no such bucket/key" condition, independent
/// of which operation produced it.
pub fn sdk_error_is_not_found<E, R>(source: &aws_sdk_s3::error::SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    sdk_error_code(source)
        .map(|code| NOT_FOUND_ERROR_CODES.iter().any(|c| c.eq_ignore_ascii_case(code)))
        .unwrap_or(false)
}

/// Classify and wrap an `SdkError` from any S3 operation, mirroring the
/// teacher's `s3_error`/`ErrorKind::from(&XxxError)` dispatch but using
/// `ProvideErrorMetadata::code()` so one function covers every operation's
/// error type instead of one `From` impl per type.
pub fn from_sdk_error<E, R>(operation: &'static str, path: Path, source: aws_sdk_s3::error::SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: fmt::Debug + Send + Sync + 'static,
{
    if sdk_error_is_not_found(&source) {
        return Error::PathNotFound { path };
    }
    Error::io(operation, path, source)
}
