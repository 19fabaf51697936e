//! Upstream resolver handles, health tracking, and scope selection
//!
//! The resolution pipeline never speaks DNS on the wire itself; it drives
//! [`UpstreamClient`] implementations through [`UpstreamConn`], which adds
//! per-query timeouts, provenance stamping, and failure accounting on top of
//! the raw transport.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cache::{unix_now, RRCache};
use crate::config::ResolverConfig;
use crate::error::{ResolveError, Result};
use crate::query::{Query, SecurityLevel};

/// Consecutive failures after which an upstream is skipped on the first pass.
pub const FAIL_THRESHOLD: u32 = 3;
/// How long the failing state lasts without further failures before the
/// upstream is given another chance.
pub const FAIL_COOLDOWN: Duration = Duration::from_secs(300);

/// Where an upstream server definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerSource {
    Configured,
    OperatingSystem,
    Mdns,
    Env,
}

/// Static description of an upstream resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamInfo {
    /// Stable identity, also recorded as provenance on cached record sets.
    pub id: String,
    pub name: String,
    pub source: ServerSource,
    /// Highest security level this upstream satisfies.
    pub security: SecurityLevel,
    /// Whether the server lives on the local network.
    pub local: bool,
}

impl UpstreamInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, source: ServerSource) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source,
            security: SecurityLevel::Normal,
            local: false,
        }
    }
}

/// A DNS transport. Implementations handle one protocol each (UDP, TCP, DoT,
/// DoH, mDNS) and are free to manage their own connections.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn query(&self, query: &Query) -> Result<RRCache>;
}

#[derive(Default)]
struct FailureStats {
    consecutive: AtomicU32,
    last_failure: AtomicI64,
}

impl FailureStats {
    fn is_failing(&self) -> bool {
        if self.consecutive.load(Ordering::Relaxed) < FAIL_THRESHOLD {
            return false;
        }
        let last = self.last_failure.load(Ordering::Relaxed);
        unix_now() - last < FAIL_COOLDOWN.as_secs() as i64
    }

    fn report_failure(&self) {
        self.consecutive.fetch_add(1, Ordering::Relaxed);
        self.last_failure.store(unix_now(), Ordering::Relaxed);
    }

    fn reset_failure(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
    }
}

/// Managed connection to one upstream resolver.
#[derive(Clone)]
pub struct UpstreamConn {
    info: Arc<UpstreamInfo>,
    client: Arc<dyn UpstreamClient>,
    failure: Arc<FailureStats>,
    timeout: Duration,
}

impl UpstreamConn {
    /// Sends the query to the transport, bounded by the per-query timeout,
    /// and stamps provenance on the returned record set.
    pub async fn query(&self, query: &Query) -> Result<RRCache> {
        match tokio::time::timeout(self.timeout, self.client.query(query)).await {
            Ok(Ok(mut rr)) => {
                rr.resolver = self.info.clone();
                Ok(rr)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ResolveError::Timeout),
        }
    }

    pub fn is_failing(&self) -> bool {
        self.failure.is_failing()
    }

    pub fn report_failure(&self) {
        self.failure.report_failure();
    }

    pub fn reset_failure(&self) {
        self.failure.reset_failure();
    }
}

/// An upstream resolver as seen by the resolution pipeline.
#[derive(Clone)]
pub struct Upstream {
    pub info: Arc<UpstreamInfo>,
    pub conn: UpstreamConn,
}

impl Upstream {
    pub fn new(info: UpstreamInfo, client: Arc<dyn UpstreamClient>, timeout: Duration) -> Self {
        let info = Arc::new(info);
        Self {
            conn: UpstreamConn {
                info: info.clone(),
                client,
                failure: Arc::new(FailureStats::default()),
                timeout,
            },
            info,
        }
    }

    /// Builds the upstream with the per-query timeout taken from the
    /// resolver configuration.
    pub fn from_config(
        info: UpstreamInfo,
        client: Arc<dyn UpstreamClient>,
        config: &ResolverConfig,
    ) -> Self {
        Self::new(info, client, config.upstream_timeout)
    }

    /// Whether this upstream may answer the given query under current policy.
    pub fn check_compliance(&self, query: &Query) -> Result<()> {
        if query.local_resolvers_only && !self.info.local {
            return Err(ResolveError::NoCompliance);
        }
        if self.info.security < query.security_level {
            return Err(ResolveError::NoCompliance);
        }
        Ok(())
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.info.name, self.info.id)
    }
}

/// The set of currently active upstream resolvers, in try-order.
#[derive(Default)]
pub struct UpstreamRegistry {
    upstreams: RwLock<Vec<Upstream>>,
}

impl UpstreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the active set. Order is preserved as try-order.
    pub fn set_upstreams(&self, upstreams: Vec<Upstream>) {
        *self.upstreams.write() = upstreams;
    }

    pub fn get_by_id(&self, id: &str) -> Option<Upstream> {
        self.upstreams
            .read()
            .iter()
            .find(|upstream| upstream.info.id == id)
            .cloned()
    }

    /// Selects the ordered list of upstreams that comply with the query.
    ///
    /// Returns the list, the source of the primary (first) entry, and
    /// whether the runner should keep trying other upstreams after a
    /// negative answer. Names outside ICANN space are not authoritative on
    /// any single server, so those queries try all; so do env-sourced
    /// scopes.
    pub fn in_scope(&self, query: &Query) -> (Vec<Upstream>, ServerSource, bool) {
        let in_scope: Vec<Upstream> = self
            .upstreams
            .read()
            .iter()
            .filter(|upstream| upstream.check_compliance(query).is_ok())
            .cloned()
            .collect();

        let primary_source = in_scope
            .first()
            .map_or(ServerSource::Configured, |upstream| upstream.info.source);
        let try_all = !query.icann_space || primary_source == ServerSource::Env;
        (in_scope, primary_source, try_all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::RecordType;

    struct NoopClient;

    #[async_trait]
    impl UpstreamClient for NoopClient {
        async fn query(&self, query: &Query) -> Result<RRCache> {
            Ok(RRCache::new(
                query.fqdn.clone(),
                query.qtype,
                ResponseCode::NoError,
                Arc::new(UpstreamInfo::new("noop", "noop", ServerSource::Configured)),
            ))
        }
    }

    struct SlowClient;

    #[async_trait]
    impl UpstreamClient for SlowClient {
        async fn query(&self, _query: &Query) -> Result<RRCache> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            unreachable!("query must time out first")
        }
    }

    fn upstream(id: &str, security: SecurityLevel, local: bool) -> Upstream {
        let mut info = UpstreamInfo::new(id, id, ServerSource::Configured);
        info.security = security;
        info.local = local;
        Upstream::new(info, Arc::new(NoopClient), Duration::from_secs(1))
    }

    fn normalized(name: &str) -> Query {
        let mut query = Query::new(name, RecordType::A);
        assert!(query.normalize());
        query
    }

    #[test]
    fn test_failure_threshold_and_reset() {
        let upstream = upstream("udp#1", SecurityLevel::Normal, false);
        assert!(!upstream.conn.is_failing());

        for _ in 0..FAIL_THRESHOLD {
            upstream.conn.report_failure();
        }
        assert!(upstream.conn.is_failing());

        upstream.conn.reset_failure();
        assert!(!upstream.conn.is_failing());
    }

    #[test]
    fn test_compliance_security_level() {
        let upstream = upstream("udp#1", SecurityLevel::Normal, false);
        let mut query = normalized("example.com.");
        assert!(upstream.check_compliance(&query).is_ok());

        query.security_level = SecurityLevel::High;
        assert!(upstream.check_compliance(&query).is_err());
    }

    #[test]
    fn test_compliance_local_only() {
        let remote = upstream("udp#1", SecurityLevel::Normal, false);
        let local = upstream("udp#2", SecurityLevel::Normal, true);
        let mut query = normalized("router.lan.");
        query.local_resolvers_only = true;

        assert!(remote.check_compliance(&query).is_err());
        assert!(local.check_compliance(&query).is_ok());
    }

    #[test]
    fn test_in_scope_filters_and_orders() {
        let registry = UpstreamRegistry::new();
        registry.set_upstreams(vec![
            upstream("udp#1", SecurityLevel::Normal, false),
            upstream("dot#2", SecurityLevel::Extreme, false),
        ]);

        let mut query = normalized("example.com.");
        let (all, source, try_all) = registry.in_scope(&query);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].info.id, "udp#1");
        assert_eq!(source, ServerSource::Configured);
        assert!(!try_all);

        query.security_level = SecurityLevel::Extreme;
        let (secure, _, _) = registry.in_scope(&query);
        assert_eq!(secure.len(), 1);
        assert_eq!(secure[0].info.id, "dot#2");
    }

    #[test]
    fn test_in_scope_try_all_outside_icann_space() {
        let registry = UpstreamRegistry::new();
        registry.set_upstreams(vec![upstream("udp#1", SecurityLevel::Normal, false)]);

        let query = normalized("hidden.onion.");
        let (_, _, try_all) = registry.in_scope(&query);
        assert!(try_all);
    }

    #[tokio::test]
    async fn test_conn_maps_elapsed_timeout() {
        let info = UpstreamInfo::new("udp#slow", "slow", ServerSource::Configured);
        let upstream = Upstream::new(info, Arc::new(SlowClient), Duration::from_millis(20));

        let query = normalized("example.com.");
        let err = upstream.conn.query(&query).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_from_config_applies_upstream_timeout() {
        let config = ResolverConfig {
            upstream_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let info = UpstreamInfo::new("udp#slow", "slow", ServerSource::Configured);
        let upstream = Upstream::from_config(info, Arc::new(SlowClient), &config);

        let query = normalized("example.com.");
        let err = upstream.conn.query(&query).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_conn_stamps_provenance() {
        let info = UpstreamInfo::new("udp#real", "real", ServerSource::Configured);
        let upstream = Upstream::new(info, Arc::new(NoopClient), Duration::from_secs(1));

        let query = normalized("example.com.");
        let rr = upstream.conn.query(&query).await.unwrap();
        assert_eq!(rr.resolver.id, "udp#real");
    }
}
