//! Resolver error types

use thiserror::Error;

use crate::cache::RRCache;

/// Resolution result type
pub type Result<T> = std::result::Result<T, ResolveError>;

/// Errors produced by the resolution pipeline.
///
/// Several variants refine a broader kind (for example [`ResolveError::NoCompliance`]
/// refines [`ResolveError::Blocked`]). Callers that only care about the kind
/// should match through the `is_*` predicates instead of on exact variants.
#[derive(Error, Debug, Clone)]
pub enum ResolveError {
    /// The record could not be found (NXDomain or store miss).
    #[error("record could not be found")]
    NotFound,

    /// The query was malformed.
    #[error("record could not be found: invalid request")]
    Invalid,

    /// The query was refused by policy.
    #[error("query was blocked")]
    Blocked,

    /// Test domains (`.test.`, `.example.`) are disabled by configuration.
    #[error("query was blocked: test domains disabled")]
    TestDomainsDisabled,

    /// Special-use domains outside ICANN space are disabled by configuration.
    #[error("query was blocked: special domains disabled")]
    SpecialDomainsDisabled,

    /// No registered resolver complies with the query parameters.
    #[error("query was blocked: no compliant resolvers for this query")]
    NoCompliance,

    /// The query was blocked upstream, not locally.
    #[error("query was blocked by upstream DNS resolver {resolver}")]
    BlockedUpstream { resolver: String },

    /// The query targeted the localhost namespace.
    #[error("query for localhost")]
    Localhost,

    /// The upstream query timed out.
    #[error("query timed out")]
    Timeout,

    /// The device is offline and the query is not a permitted probe.
    ///
    /// A stale cache entry, if one exists, rides along so the caller can
    /// still decide to serve it.
    #[error("device is offline")]
    Offline { backup: Option<Box<RRCache>> },

    /// The type of failure is unclear.
    #[error("query failed: {0}")]
    Failure(String),

    /// The resolver has no answer; the next resolver should be asked.
    #[error("resolver has no answer")]
    Continue,

    /// The resolver is shutting down.
    #[error("resolver is shutting down")]
    ShuttingDown,

    /// The record store failed.
    #[error("record store error: {0}")]
    Storage(String),

    /// Every in-scope resolver was tried, twice, without success.
    #[error("all {count} query-compliant resolvers failed, last error: {source}")]
    AllResolversFailed {
        count: usize,
        #[source]
        source: Box<ResolveError>,
    },
}

impl ResolveError {
    /// True for all "not found" kinds.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound | Self::Invalid => true,
            Self::AllResolversFailed { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// True for all "blocked" kinds.
    pub fn is_blocked(&self) -> bool {
        match self {
            Self::Blocked
            | Self::TestDomainsDisabled
            | Self::SpecialDomainsDisabled
            | Self::NoCompliance
            | Self::BlockedUpstream { .. } => true,
            Self::AllResolversFailed { source, .. } => source.is_blocked(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::AllResolversFailed { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    pub fn is_offline(&self) -> bool {
        match self {
            Self::Offline { .. } => true,
            Self::AllResolversFailed { source, .. } => source.is_offline(),
            _ => false,
        }
    }
}
