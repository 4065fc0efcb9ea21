//! Retry adapter: bridge a user retry strategy into the SDK's retry
//! interface.
//!
//! Grounded on the teacher's `s3_error`/`impl From<&XxxError> for
//! ErrorKind` dispatch (`src/transport/s3.rs`), generalized from a
//! fixed NotFound/Other classification into an abstract
//! [`crate::error::RetryDetail`] a pluggable [`RetryStrategy`] can reason
//! about, and wired into `aws-smithy`'s `ClassifyRetry` so it actually
//! drives SDK-level retries (the teacher instead just configures a fixed
//! `RetryConfig` and does its own post hoc error classification for
//! reporting, not retrying).

use std::fmt;
use std::sync::Arc;

use aws_smithy_runtime_api::client::interceptors::context::{Error as BoxError, InterceptorContext};
use aws_smithy_runtime_api::client::orchestrator::OrchestratorError;
use aws_smithy_runtime_api::client::retries::classifiers::{ClassifyRetry, RetryAction, SharedRetryClassifier};
use aws_smithy_types::error::metadata::ProvideErrorMetadata;

use crate::error::RetryDetail;

/// A user-supplied retry policy.
///
/// `should_retry`/`delay_ms` are synchronous, pure decisions: they see an
/// abstract [`RetryDetail`] plus the 1-based attempt counter and decide
/// whether/how long to wait before the next attempt.
pub trait RetryStrategy: fmt::Debug + Send + Sync {
    fn should_retry(&self, detail: &RetryDetail, attempt: u32) -> bool;
    fn delay_ms(&self, detail: &RetryDetail, attempt: u32) -> u64;
}

/// Exponential backoff with a bounded number of attempts, the default
/// strategy when the caller does not supply one.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetryStrategy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ExponentialBackoffRetryStrategy {
    fn default() -> Self {
        ExponentialBackoffRetryStrategy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryStrategy for ExponentialBackoffRetryStrategy {
    fn should_retry(&self, detail: &RetryDetail, attempt: u32) -> bool {
        detail.transient_hint && attempt < self.max_attempts
    }

    fn delay_ms(&self, _detail: &RetryDetail, attempt: u32) -> u64 {
        let shift = attempt.min(20);
        self.base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms)
    }
}

/// S3 error codes considered transient across operations: worth retrying
/// regardless of which request produced them.
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "SlowDown",
    "ServiceUnavailable",
    "InternalError",
    "Throttling",
    "ThrottlingException",
    "TooManyRequests",
];

pub(crate) fn is_transient_code(code: &str) -> bool {
    TRANSIENT_ERROR_CODES.iter().any(|c| c.eq_ignore_ascii_case(code))
}

/// Extract a [`RetryDetail`] from the orchestrator's type-erased error.
///
/// `ClassifyRetry` runs inside the orchestrator, before the SDK has
/// reconstructed an operation-specific `SdkError<E, R>` for the caller, so
/// the error is still a type-erased [`BoxError`]. The only way to reach the
/// service's error code/message at this layer is through `downcast_ref`
/// onto the boxed `ProvideErrorMetadata` the AWS SDK's own operation errors
/// carry. Mirrors the teacher's `s3_error` classification but produces a
/// retry-strategy-agnostic detail instead of a fixed `ErrorKind`.
fn retry_detail_from_orchestrator_error(error: &OrchestratorError<BoxError>) -> RetryDetail {
    let metadata = error
        .as_operation_error()
        .and_then(|err| err.downcast_ref::<Box<dyn ProvideErrorMetadata + Send + Sync>>());

    match metadata {
        Some(meta) => {
            let code = meta.code().unwrap_or("Unknown").to_owned();
            let transient_hint = is_transient_code(&code);
            RetryDetail {
                error_code: code,
                message: meta.message().unwrap_or_default().to_owned(),
                exception_name: "OperationError",
                transient_hint,
            }
        }
        None => RetryDetail {
            error_code: "TransportError".to_owned(),
            message: format!("{error:?}"),
            exception_name: "TransportError",
            transient_hint: true,
        },
    }
}

/// Adapts a [`RetryStrategy`] to `aws-smithy`'s `ClassifyRetry` so it
/// actually drives SDK-level retries, not just post hoc error reporting.
#[derive(Debug)]
struct RetryStrategyClassifier {
    strategy: Arc<dyn RetryStrategy>,
}

impl ClassifyRetry for RetryStrategyClassifier {
    fn classify_retry(&self, ctx: &InterceptorContext) -> RetryAction {
        let Some(Err(error)) = ctx.output_or_error() else {
            return RetryAction::NoActionIndicated;
        };
        let detail = retry_detail_from_orchestrator_error(error);
        let attempt = ctx.request_attempts().unwrap_or(1) as u32;
        if self.strategy.should_retry(&detail, attempt) {
            RetryAction::transient_error()
        } else {
            RetryAction::NoActionIndicated
        }
    }

    fn name(&self) -> &'static str {
        "user retry strategy adapter"
    }
}

/// Build a `SharedRetryClassifier` wrapping `strategy`, for installation on
/// the S3 client config via `.retry_classifier(...)`.
pub fn classifier_for(strategy: Arc<dyn RetryStrategy>) -> SharedRetryClassifier {
    SharedRetryClassifier::new(RetryStrategyClassifier { strategy })
}
