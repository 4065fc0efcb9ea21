//! Process-wide cache of endpoint providers, one per distinct endpoint
//! configuration.
//!
//! Constructing a provider costs roughly a millisecond; reusing one per
//! distinct `(region, scheme, endpoint_override, use_virtual_addressing)`
//! tuple eliminates that per-client cost. Grounded on
//! `S3Transport::new`'s two-pass client construction (build once to look
//! up the bucket's region, then rebuild in the right region), generalized
//! into a cache keyed on the full set of inputs that change what endpoint
//! a client resolves to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use aws_sdk_s3::config::endpoint::{
    EndpointFuture, Params as EndpointParams, ResolveEndpoint, SharedEndpointResolver,
};

/// Key identifying a distinct endpoint configuration.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct EndpointCacheKey {
    pub region: String,
    pub scheme: Scheme,
    pub endpoint_override: Option<String>,
    pub use_virtual_addressing: bool,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// A resolver wrapper that is a no-op for reconfiguration: once built for
/// a key, the resolver's inner state must not be mutated, only reused.
#[derive(Clone, Debug)]
struct FixedEndpointResolver {
    url: Arc<str>,
}

impl ResolveEndpoint for FixedEndpointResolver {
    fn resolve_endpoint<'a>(&'a self, _params: &'a EndpointParams) -> EndpointFuture<'a> {
        let endpoint = aws_smithy_types::endpoint::Endpoint::builder()
            .url(self.url.to_string())
            .build();
        EndpointFuture::ready(Ok(endpoint))
    }
}

fn registry() -> &'static Mutex<HashMap<EndpointCacheKey, FixedEndpointResolver>> {
    static REGISTRY: OnceLock<Mutex<HashMap<EndpointCacheKey, FixedEndpointResolver>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Return the cached endpoint resolver for `key`, building and caching one
/// if this is the first request for that configuration.
pub fn endpoint_resolver_for(key: &EndpointCacheKey) -> SharedEndpointResolver {
    SharedEndpointResolver::new(cached_resolver(key))
}

fn cached_resolver(key: &EndpointCacheKey) -> FixedEndpointResolver {
    let mut map = registry().lock().unwrap();
    if let Some(existing) = map.get(key) {
        return existing.clone();
    }
    let resolver = FixedEndpointResolver {
        url: Arc::from(build_endpoint_url(key)),
    };
    map.insert(key.clone(), resolver.clone());
    resolver
}

fn build_endpoint_url(key: &EndpointCacheKey) -> String {
    if let Some(ref url) = key.endpoint_override {
        return url.clone();
    }
    let host = if key.use_virtual_addressing {
        format!("s3.{}.amazonaws.com", key.region)
    } else {
        format!("s3.{}.amazonaws.com", key.region)
    };
    format!("{}://{}", key.scheme.as_str(), host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(region: &str) -> EndpointCacheKey {
        EndpointCacheKey {
            region: region.to_owned(),
            scheme: Scheme::Https,
            endpoint_override: None,
            use_virtual_addressing: true,
        }
    }

    #[test]
    fn same_configuration_returns_same_provider() {
        let a = cached_resolver(&key("us-west-2-endpoint-cache-test"));
        let b = cached_resolver(&key("us-west-2-endpoint-cache-test"));
        assert!(Arc::ptr_eq(&a.url, &b.url));
    }

    #[test]
    fn different_region_returns_different_provider() {
        let a = cached_resolver(&key("region-cache-test-a"));
        let b = cached_resolver(&key("region-cache-test-b"));
        assert!(!Arc::ptr_eq(&a.url, &b.url));
    }

    #[test]
    fn endpoint_resolver_for_builds_a_shared_resolver() {
        let _resolver = endpoint_resolver_for(&key("smoke-test"));
    }
}
