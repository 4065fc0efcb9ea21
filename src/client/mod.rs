//! S3 client construction and lifetime management.

pub mod builder;
pub mod endpoint_cache;
pub mod holder;
pub mod retry;

pub use builder::{build_client, BuiltClient, ClientOptions};
pub use holder::{ClientHolder, Finalizer, LockHandle};
pub use retry::{ExponentialBackoffRetryStrategy, RetryStrategy};
