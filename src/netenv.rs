//! Network environment signals
//!
//! Tracks the device's online status, knows which domains belong to
//! captive-portal / connectivity checks, and owns the hook slot through
//! which the environment layer asks the resolver to probe connectivity
//! without depending on it directly.

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ResolveError;

/// Domain used to test whether plain DNS resolution works at all.
pub const DNS_TEST_DOMAIN: &str = "one.one.one.one.";

/// Well-known captive-portal and connectivity-check domains. Queries for
/// these bypass the cache and are allowed through while offline.
const CONNECTIVITY_DOMAINS: &[&str] = &[
    "captive.apple.com.",
    "connectivity-check.ubuntu.com.",
    "connectivitycheck.gstatic.com.",
    "detectportal.firefox.com.",
    "www.msftconnecttest.com.",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineStatus {
    Unknown,
    Offline,
    Limited,
    Portal,
    Online,
}

/// Outcome of a connectivity probe.
///
/// `reachable` reports whether the probe query itself went through; the
/// answer (or lack of one) is judged separately so a clean NXDomain still
/// counts as working DNS.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub ips: Vec<Ipv4Addr>,
    pub reachable: bool,
    pub error: Option<ResolveError>,
}

/// Callback slot type for the resolver-backed connectivity probe.
pub type DnsTestQuery =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ProbeResult> + Send>> + Send + Sync>;

pub struct NetEnv {
    status: RwLock<OnlineStatus>,
    extra_connectivity_domains: RwLock<Vec<String>>,
    dns_test_query: RwLock<Option<DnsTestQuery>>,
}

impl Default for NetEnv {
    fn default() -> Self {
        Self {
            status: RwLock::new(OnlineStatus::Unknown),
            extra_connectivity_domains: RwLock::new(Vec::new()),
            dns_test_query: RwLock::new(None),
        }
    }
}

impl NetEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn online_status(&self) -> OnlineStatus {
        *self.status.read()
    }

    pub fn set_online_status(&self, status: OnlineStatus) {
        *self.status.write() = status;
    }

    pub fn is_online(&self) -> bool {
        self.online_status() == OnlineStatus::Online
    }

    /// Whether the domain belongs to a captive-portal or connectivity check.
    pub fn is_connectivity_domain(&self, fqdn: &str) -> bool {
        if CONNECTIVITY_DOMAINS.contains(&fqdn) {
            return true;
        }
        self.extra_connectivity_domains
            .read()
            .iter()
            .any(|domain| domain == fqdn)
    }

    /// Registers an additional connectivity-check domain, canonicalized to
    /// trailing-dot form.
    pub fn add_connectivity_domain(&self, domain: impl Into<String>) {
        let mut domain = domain.into();
        if !domain.ends_with('.') {
            domain.push('.');
        }
        self.extra_connectivity_domains.write().push(domain);
    }

    /// Installs the resolver-backed probe. Invoked once at resolver
    /// construction; the environment layer only ever sees this slot.
    pub fn set_dns_test_query(&self, probe: DnsTestQuery) {
        *self.dns_test_query.write() = Some(probe);
    }

    /// Probes whether resolving the given domain works right now.
    pub async fn probe_connectivity(&self, fqdn: impl Into<String>) -> ProbeResult {
        let probe = self.dns_test_query.read().clone();
        match probe {
            Some(probe) => probe(fqdn.into()).await,
            None => ProbeResult {
                ips: Vec::new(),
                reachable: false,
                error: Some(ResolveError::Failure(
                    "no dns test query registered".into(),
                )),
            },
        }
    }
}
