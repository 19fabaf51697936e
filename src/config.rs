//! Resolver configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the resolution pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Per-query timeout applied to each upstream attempt; picked up by
    /// upstreams built via [`crate::upstream::Upstream::from_config`].
    pub upstream_timeout: Duration,

    /// Upper bound on waiting for a duplicate in-flight query before the
    /// waiter supersedes the stalled owner.
    pub max_request_timeout: Duration,

    /// Answer queries for `.test.` and `.example.` names instead of
    /// refusing them.
    pub serve_test_domains: bool,

    /// Answer queries for special-use names outside ICANN space
    /// (`.onion.` and friends) instead of refusing them.
    pub serve_special_domains: bool,

    /// Additional captive-portal / connectivity-check domains that bypass
    /// the cache and are allowed through while offline. Registered with the
    /// network environment when the resolver is constructed.
    pub connectivity_domains: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(5),
            max_request_timeout: Duration::from_secs(8),
            serve_test_domains: true,
            serve_special_domains: true,
            connectivity_domains: Vec::new(),
        }
    }
}
