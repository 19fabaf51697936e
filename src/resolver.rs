//! Query resolution pipeline
//!
//! The path of every query: normalize, check local policy, consult the cache
//! gate, coalesce with identical in-flight queries, and finally walk the
//! in-scope upstreams in two passes. Stale cache entries ride along as a
//! backup so a failed refresh still produces an answer.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cache::{RRCache, MIN_TTL};
use crate::config::ResolverConfig;
use crate::error::{ResolveError, Result};
use crate::netenv::{NetEnv, OnlineStatus, ProbeResult, DNS_TEST_DOMAIN};
use crate::notify::FailureNotifier;
use crate::query::Query;
use crate::store::RecordStore;
use crate::upstream::{ServerSource, UpstreamRegistry};

/// Identical queries seen this many times in a row flush their cache entry.
const CACHE_RESET_THRESHOLD: i32 = 3;
/// Counter value after a flush; ten further repeats re-arm the threshold.
const CACHE_RESET_BACKOFF: i32 = -7;

struct DedupeEntry {
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    wait_until: Instant,
}

/// Coalesces concurrent identical queries so only one runs upstream.
///
/// The first caller for a key becomes the owner and receives a guard;
/// everyone else waits for the guard to drop. An owner that outlives its
/// wait budget is superseded: the next caller registers a fresh entry over
/// it and the stalled owner's cleanup leaves the newer registration alone.
struct SingleFlight {
    entries: Mutex<HashMap<String, Arc<DedupeEntry>>>,
}

impl SingleFlight {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a guard when the caller becomes the owner for `key`, or
    /// `None` once a duplicate request completed (or the wait was aborted)
    /// and the caller should re-check the cache.
    async fn join(
        self: &Arc<Self>,
        key: &str,
        max_wait: Duration,
        shutdown: &CancellationToken,
    ) -> Option<FlightGuard> {
        loop {
            let mut done_rx = {
                let mut entries = self.entries.lock();
                match entries.get(key) {
                    Some(entry) if Instant::now() < entry.wait_until => entry.done_rx.clone(),
                    _ => {
                        // No active request, or the active owner exceeded its
                        // wait budget and is superseded by this caller.
                        let (done_tx, done_rx) = watch::channel(false);
                        let entry = Arc::new(DedupeEntry {
                            done_tx,
                            done_rx,
                            wait_until: Instant::now() + max_wait,
                        });
                        entries.insert(key.to_string(), entry.clone());
                        return Some(FlightGuard {
                            flight: self.clone(),
                            key: key.to_string(),
                            entry,
                        });
                    }
                }
            };

            trace!("waiting for duplicate query for {} to complete", key);
            tokio::select! {
                _ = done_rx.wait_for(|done| *done) => return None,
                _ = tokio::time::sleep(max_wait) => {
                    // the owner is taking too long, try to take over
                }
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

struct FlightGuard {
    flight: Arc<SingleFlight>,
    key: String,
    entry: Arc<DedupeEntry>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        {
            let mut entries = self.flight.entries.lock();
            // Remove only our own registration; a superseding owner may have
            // replaced it in the meantime.
            if entries
                .get(&self.key)
                .is_some_and(|current| Arc::ptr_eq(current, &self.entry))
            {
                entries.remove(&self.key);
            }
        }
        self.entry.done_tx.send_replace(true);
    }
}

#[derive(Default)]
struct CacheResetTracker {
    state: Mutex<CacheResetState>,
}

#[derive(Default)]
struct CacheResetState {
    last_id: String,
    seen: i32,
}

impl CacheResetTracker {
    /// Repeated queries for the same name and type signal that the cached
    /// answer is not what the user wants; flush it on the third repeat.
    fn should_reset(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        if state.last_id != id {
            state.last_id = id.to_string();
            state.seen = 1;
            return false;
        }
        state.seen += 1;
        if state.seen >= CACHE_RESET_THRESHOLD {
            state.seen = CACHE_RESET_BACKOFF;
            return true;
        }
        false
    }
}

/// The query resolution service.
///
/// Cheap to clone; all clones share the same cache, upstream registry, and
/// in-flight query registry.
#[derive(Clone)]
pub struct DnsResolver {
    inner: Arc<Inner>,
}

struct Inner {
    config: ResolverConfig,
    registry: Arc<UpstreamRegistry>,
    store: Arc<RecordStore>,
    netenv: Arc<NetEnv>,
    notifier: Arc<FailureNotifier>,
    dedupe: Arc<SingleFlight>,
    cache_reset: CacheResetTracker,
    shutdown: CancellationToken,
}

impl DnsResolver {
    pub fn new(
        config: ResolverConfig,
        registry: Arc<UpstreamRegistry>,
        store: Arc<RecordStore>,
        netenv: Arc<NetEnv>,
        notifier: Arc<FailureNotifier>,
    ) -> Self {
        for domain in &config.connectivity_domains {
            netenv.add_connectivity_domain(domain.clone());
        }

        let resolver = Self {
            inner: Arc::new(Inner {
                config,
                registry,
                store,
                netenv,
                notifier,
                dedupe: Arc::new(SingleFlight::new()),
                cache_reset: CacheResetTracker::default(),
                shutdown: CancellationToken::new(),
            }),
        };

        // Hand the environment layer its connectivity probe. The weak handle
        // keeps the hook from holding the resolver alive through the netenv.
        let weak = Arc::downgrade(&resolver.inner);
        resolver.inner.netenv.set_dns_test_query(Arc::new(
            move |fqdn| -> Pin<Box<dyn Future<Output = ProbeResult> + Send>> {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => DnsResolver { inner }.test_connectivity(&fqdn).await,
                        None => ProbeResult {
                            ips: Vec::new(),
                            reachable: false,
                            error: Some(ResolveError::ShuttingDown),
                        },
                    }
                })
            },
        ));

        resolver
    }

    /// Signals shutdown: in-flight resolver runs stop before their next
    /// upstream attempt and background refreshes are abandoned.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Resolves the given question to a record set from the cache, an
    /// upstream resolver, or a stored backup.
    pub async fn resolve(&self, mut query: Query) -> Result<RRCache> {
        if !query.normalize() {
            return Err(ResolveError::Invalid);
        }
        trace!("resolving {}", query.id());

        query.check_compliance(&self.inner.config)?;

        if query.no_caching {
            return self.resolve_and_cache(&query, None).await;
        }

        let mut from_cache = match self.check_cache(&query, true) {
            Some(rr) if !rr.expired() => return Ok(rr),
            other => other,
        };

        let flight = self
            .inner
            .dedupe
            .join(
                &query.id(),
                self.inner.config.max_request_timeout,
                &self.inner.shutdown,
            )
            .await;
        match flight {
            None => {
                // We waited on another request for the same question;
                // whatever it found is in the cache now. A recheck does not
                // count towards the cache-reset heuristic: the repetition is
                // ours, not the user's.
                match self.check_cache(&query, false) {
                    Some(rr) if !rr.expired() => return Ok(rr),
                    other => from_cache = other,
                }
                debug!("waited for another {} query, but the cache missed", query.id());
                self.resolve_and_cache(&query, from_cache).await
            }
            Some(_flight) => self.resolve_and_cache(&query, from_cache).await,
        }
    }

    /// The cache gate. Returns a usable cache entry, or `None` when the
    /// caller must resolve upstream. An expired entry with a successful
    /// response code is returned anyway: it seeds the backup for the
    /// upstream pass.
    fn check_cache(&self, query: &Query, allow_reset: bool) -> Option<RRCache> {
        // Connectivity checks must observe the live network, never the cache.
        if self.inner.netenv.is_connectivity_domain(&query.fqdn) {
            return None;
        }

        let mut rr = match self.inner.store.get(&query.fqdn, query.qtype) {
            Ok(rr) => rr,
            Err(err) => {
                if !err.is_not_found() {
                    warn!("loading {} from record store failed: {}", query.id(), err);
                }
                return None;
            }
        };

        // The producing resolver must still be registered.
        let Some(upstream) = self.inner.registry.get_by_id(&rr.resolver.id) else {
            debug!(
                "ignoring cached {} because source server {} has been removed",
                query.id(),
                rr.resolver.id
            );
            return None;
        };
        if let Err(err) = upstream.check_compliance(query) {
            debug!(
                "cached entry for {} does not comply to query parameters: {}",
                query.id(),
                err
            );
            return None;
        }

        if allow_reset && self.inner.cache_reset.should_reset(&query.id()) {
            match self.inner.store.reset(&query.fqdn, query.qtype) {
                Ok(()) => trace!("cache for {} was reset", query.id()),
                Err(err) if err.is_not_found() => {
                    trace!("cache for {} was already reset", query.id());
                }
                Err(err) => warn!("failed to reset cache for {}: {}", query.id(), err),
            }
            return None;
        }

        if rr.expired() {
            if rr.rcode == ResponseCode::NoError {
                return Some(rr);
            }
            return None;
        }

        if rr.expires_soon() {
            rr.requesting_new = true;
            trace!(
                "cache for {} expires in {}s, refreshing async now",
                query.id(),
                rr.ttl_remaining()
            );

            // The refresh must not die with the caller; it is bound to module
            // shutdown only.
            let this = self.clone();
            let refresh = query.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = this.inner.shutdown.cancelled() => {}
                    result = this.resolve_and_cache(&refresh, None) => match result {
                        Ok(_) => debug!("async refresh for {} succeeded", refresh.id()),
                        Err(err) => warn!("async refresh for {} failed: {}", refresh.id(), err),
                    }
                }
            });

            return Some(rr);
        }

        trace!(
            "using cached {} (expires in {}s)",
            query.id(),
            rr.ttl_remaining()
        );
        Some(rr)
    }

    /// Walks the in-scope upstreams in two passes (skipping recently failed
    /// servers on the first), classifies per-server errors, and caches the
    /// elected answer. `old_cache` is a stale entry to fall back to when the
    /// fresh attempt fails or is not worth keeping.
    async fn resolve_and_cache(
        &self,
        query: &Query,
        old_cache: Option<RRCache>,
    ) -> Result<RRCache> {
        let (upstreams, primary_source, try_all) = self.inner.registry.in_scope(query);
        if upstreams.is_empty() {
            return Err(ResolveError::NoCompliance);
        }

        let connectivity_check =
            query.fqdn == DNS_TEST_DOMAIN || self.inner.netenv.is_connectivity_domain(&query.fqdn);

        // Env-sourced resolvers live on the local network and may answer even
        // while the uplink is down.
        if self.inner.netenv.online_status() == OnlineStatus::Offline
            && primary_source != ServerSource::Env
        {
            if !connectivity_check {
                return Err(ResolveError::Offline {
                    backup: old_cache.map(Box::new),
                });
            }
            debug!(
                "allowing connectivity test domain {} to resolve even though offline",
                query.fqdn
            );
        }

        let mut rr_result: Option<RRCache> = None;
        let mut last_err: Option<ResolveError> = None;
        let mut exhausted = true;

        'resolve: for pass in 0..2 {
            for upstream in &upstreams {
                if self.inner.shutdown.is_cancelled() {
                    return Err(ResolveError::ShuttingDown);
                }

                if pass == 0 && upstream.conn.is_failing() && !query.ignore_failing {
                    trace!("skipping resolver {}, because it failed recently", upstream);
                    continue;
                }

                trace!("sending query for {} to {}", query.id(), upstream.info.id);
                match upstream.conn.query(query).await {
                    Err(err) => {
                        rr_result = None;
                        if err.is_not_found() {
                            // NXDomain, or similar.
                            if try_all {
                                last_err = Some(err);
                                continue;
                            }
                            return Err(err);
                        }
                        if err.is_blocked() {
                            // Blocking upstream is authoritative.
                            return Err(err);
                        }
                        if self.inner.netenv.online_status() == OnlineStatus::Offline
                            && !connectivity_check
                        {
                            return Err(ResolveError::Offline {
                                backup: old_cache.map(Box::new),
                            });
                        }
                        match err {
                            ResolveError::Continue => {
                                last_err = Some(err);
                            }
                            ResolveError::Timeout => {
                                upstream.conn.report_failure();
                                debug!("query to {} timed out", upstream.info.id);
                                last_err = Some(err);
                            }
                            ResolveError::ShuttingDown => return Err(err),
                            other => {
                                upstream.conn.report_failure();
                                debug!("query to {} failed: {}", upstream.info.id, other);
                                last_err = Some(other);
                            }
                        }
                    }
                    Ok(rr) => {
                        last_err = None;
                        // A negative answer from one server may still be
                        // answered by another; keep the response in case
                        // every server agrees.
                        if rr.rcode != ResponseCode::NoError && try_all {
                            rr_result = Some(rr);
                            continue;
                        }
                        rr_result = Some(rr);

                        upstream.conn.reset_failure();
                        if primary_source == ServerSource::Configured {
                            self.inner.notifier.reset_failing();
                        }

                        exhausted = false;
                        break 'resolve;
                    }
                }
            }
        }

        if exhausted {
            if let Some(err) = last_err.take() {
                let failure = ResolveError::AllResolversFailed {
                    count: upstreams.len(),
                    source: Box::new(err),
                };
                if primary_source == ServerSource::Configured
                    && self.inner.netenv.is_online()
                    && self.inner.notifier.self_check_failing()
                {
                    self.inner.notifier.notify_failing(&failure);
                } else {
                    self.inner.notifier.reset_failing();
                }
                last_err = Some(failure);
            }
        }

        // Check if we want to serve an older cache entry instead.
        if let Some(mut old) = old_cache {
            old.is_backup = true;

            if let Some(err) = &last_err {
                debug!(
                    "serving backup cache of {} because query failed: {}",
                    query.id(),
                    err
                );
                return Ok(old);
            }
            match &rr_result {
                Some(rr) if !rr.cacheable() => {
                    debug!(
                        "serving backup cache of {} because the fresh response is {:?}",
                        query.id(),
                        rr.rcode
                    );
                    return Ok(old);
                }
                _ => {}
            }
        }

        if let Some(err) = last_err {
            return Err(err);
        }
        let mut rr = rr_result.ok_or(ResolveError::NotFound)?;

        rr.clean(MIN_TTL);
        if !query.no_caching && rr.cacheable() {
            if let Err(err) = self.inner.store.save(&rr) {
                warn!("failed to cache {}: {}", query.id(), err);
            }
        }

        Ok(rr)
    }

    /// Tests whether resolving the given domain works, separately from
    /// interpreting the answer. Bypasses cache and deduplication.
    pub async fn test_connectivity(&self, fqdn: &str) -> ProbeResult {
        let mut query = Query::new(fqdn, RecordType::A);
        query.no_caching = true;
        if !query.normalize() {
            return ProbeResult {
                ips: Vec::new(),
                reachable: false,
                error: Some(ResolveError::Invalid),
            };
        }

        match self.resolve_and_cache(&query, None).await {
            Ok(rr) => match rr.rcode {
                ResponseCode::NXDomain => ProbeResult {
                    ips: Vec::new(),
                    reachable: true,
                    error: Some(ResolveError::NotFound),
                },
                ResponseCode::Refused => ProbeResult {
                    ips: Vec::new(),
                    reachable: true,
                    error: Some(ResolveError::Failure("refused by upstream".into())),
                },
                _ => {
                    let ips = rr.export_all_a_records();
                    if ips.is_empty() {
                        ProbeResult {
                            ips,
                            reachable: true,
                            error: Some(ResolveError::NotFound),
                        }
                    } else {
                        ProbeResult {
                            ips,
                            reachable: true,
                            error: None,
                        }
                    }
                }
            },
            // A refused or empty answer still proves the path works.
            Err(err) if err.is_not_found() || err.is_blocked() => ProbeResult {
                ips: Vec::new(),
                reachable: true,
                error: Some(err),
            },
            Err(err) => ProbeResult {
                ips: Vec::new(),
                reachable: false,
                error: Some(err),
            },
        }
    }
}
