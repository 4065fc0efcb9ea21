//! Client builder: assemble an `aws_sdk_s3::Client` plus its holder from
//! user options.
//!
//! Grounded on `S3Transport::new`/`load_aws_config`'s
//! `aws_config`/`aws_sdk_s3::Client` construction (region, endpoint,
//! force-path-style), generalized to the full option set the spec names
//! in §4.D.

use std::sync::Arc;
use std::time::Duration;

use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Region};

use crate::backend::Backend;
use crate::client::endpoint_cache::{self, EndpointCacheKey, Scheme};
use crate::client::holder::{ClientHolder, Finalizer};
use crate::client::retry::RetryStrategy;
use crate::error::Result;

/// The minimum `max_connections` the client builder will configure,
/// regardless of the executor's capacity.
const MIN_MAX_CONNECTIONS: usize = 25;

/// User-facing configuration surface (spec §4.D / §6).
#[derive(Clone, Default)]
pub struct ClientOptions {
    pub region: Option<String>,
    pub scheme: Option<Scheme>,
    pub endpoint_override: Option<String>,
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    /// Accepted and stored for round-tripping; taking effect requires an
    /// HTTP connector this crate does not assemble itself (see DESIGN.md).
    pub tls_ca_file: Option<String>,
    pub tls_ca_dir: Option<String>,
    pub proxy: Option<String>,
    pub network_interfaces: Vec<String>,
    pub allow_bucket_creation: bool,
    pub allow_bucket_deletion: bool,
    pub background_writes: bool,
    pub allow_delayed_open: bool,
    pub default_metadata: std::collections::HashMap<String, String>,
    pub sse_customer_key: Option<String>,
    pub force_virtual_addressing: Option<bool>,
    pub check_directory_existence_before_creation: bool,
    pub backend: Backend,
    /// Bound on background multipart-part concurrency (used to derive
    /// `max_connections`, per spec §4.D: `max(executor_capacity, 25)`).
    pub executor_capacity: usize,
}

impl ClientOptions {
    pub fn new() -> Self {
        ClientOptions {
            executor_capacity: 1,
            ..Default::default()
        }
    }

    fn use_virtual_addressing(&self) -> bool {
        match self.force_virtual_addressing {
            Some(v) => v,
            None => self.endpoint_override.is_none(),
        }
    }

    /// `max(executor_capacity, 25)`, per spec §4.D. Feeds the HTTP
    /// connector's pool size; exposed so the connector layer (outside this
    /// module's scope — see the AWS SDK wire layer exclusion in §1) can
    /// size itself consistently with the configured executor.
    pub fn max_connections(&self) -> usize {
        self.executor_capacity.max(MIN_MAX_CONNECTIONS)
    }
}

/// A built client plus its lifetime-safe holder.
pub struct BuiltClient {
    pub holder: Arc<ClientHolder<aws_sdk_s3::Client>>,
}

/// Assemble a configured `aws_sdk_s3::Client` and register it with
/// `finalizer`.
///
/// Loads ambient AWS configuration (credentials, default region) via
/// `aws_config`, then overlays everything the spec's options surface
/// controls: endpoint, addressing style, timeouts, retry bridging, and
/// `max_connections`.
pub async fn build_client(options: &ClientOptions, finalizer: &Arc<Finalizer>) -> Result<BuiltClient> {
    let region = options
        .region
        .clone()
        .unwrap_or_else(|| "us-east-1".to_owned());

    let shared_config = aws_config::from_env()
        .region(Region::new(region.clone()))
        .load()
        .await;

    let mut config_builder = S3ConfigBuilder::from(&shared_config);

    let scheme = options.scheme.unwrap_or(Scheme::Https);
    let use_virtual_addressing = options.use_virtual_addressing();

    let endpoint_key = EndpointCacheKey {
        region: region.clone(),
        scheme,
        endpoint_override: options.endpoint_override.clone(),
        use_virtual_addressing,
    };
    config_builder = config_builder.endpoint_resolver(endpoint_cache::endpoint_resolver_for(&endpoint_key));
    config_builder = config_builder.force_path_style(!use_virtual_addressing);

    if let Some(timeout_config) = build_timeout_config(options) {
        config_builder = config_builder.timeout_config(timeout_config);
    }

    if let Some(strategy) = options.retry_strategy.clone() {
        config_builder = config_builder.retry_classifier(crate::client::retry::classifier_for(strategy));
    }

    tracing::debug!(
        max_connections = options.max_connections(),
        %region,
        use_virtual_addressing,
        "building S3 client"
    );

    let client = aws_sdk_s3::Client::from_conf(config_builder.build());
    let holder = ClientHolder::new(finalizer, client);
    Ok(BuiltClient { holder })
}

fn build_timeout_config(options: &ClientOptions) -> Option<aws_smithy_types::timeout::TimeoutConfig> {
    if options.request_timeout.is_none() && options.connect_timeout.is_none() {
        return None;
    }
    let mut builder = aws_smithy_types::timeout::TimeoutConfig::builder();
    if let Some(t) = options.request_timeout {
        builder = builder.operation_timeout(t);
    }
    if let Some(t) = options.connect_timeout {
        builder = builder.connect_timeout(t);
    }
    Some(builder.build())
}
