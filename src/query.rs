//! Query normalization and classification

use hickory_proto::rr::RecordType;
use serde::{Deserialize, Serialize};

use crate::config::ResolverConfig;
use crate::error::ResolveError;

/// Security level a query runs at, restricting which resolvers are eligible.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Normal,
    High,
    Extreme,
}

/// A DNS question on its way through the resolution pipeline.
///
/// Construct with [`Query::new`]; the pipeline canonicalizes the name to
/// trailing-dot form and derives the public-suffix classification before
/// anything else looks at it.
#[derive(Debug, Clone)]
pub struct Query {
    /// Canonical trailing-dot domain name.
    pub fqdn: String,
    pub qtype: RecordType,
    pub security_level: SecurityLevel,
    pub no_caching: bool,
    pub ignore_failing: bool,
    pub local_resolvers_only: bool,

    /// Whether the domain is within ICANN managed domain space.
    pub icann_space: bool,
    /// Effective TLD plus one label, trailing-dot form. Empty at or below
    /// the suffix itself.
    pub domain_root: String,

    dot_prefixed_fqdn: String,
}

impl Query {
    pub fn new(fqdn: impl Into<String>, qtype: RecordType) -> Self {
        Self {
            fqdn: fqdn.into(),
            qtype,
            security_level: SecurityLevel::Normal,
            no_caching: false,
            ignore_failing: false,
            local_resolvers_only: false,
            icann_space: false,
            domain_root: String::new(),
            dot_prefixed_fqdn: String::new(),
        }
    }

    /// Identifier used as the dedupe and cache key: domain plus question type.
    pub fn id(&self) -> String {
        format!("{}{}", self.fqdn, self.qtype)
    }

    /// The FQDN with a leading dot, unless the FQDN is the root. Makes
    /// exact-name and subdomain suffix matching uniform.
    pub(crate) fn dot_prefixed_fqdn(&self) -> &str {
        &self.dot_prefixed_fqdn
    }

    /// Runs sanity checks and canonicalizes the query. Returns whether the
    /// query passed the basic checks.
    pub(crate) fn normalize(&mut self) -> bool {
        if self.fqdn.is_empty() {
            return false;
        }

        self.fqdn.make_ascii_lowercase();
        if !self.fqdn.ends_with('.') {
            self.fqdn.push('.');
        }
        self.dot_prefixed_fqdn = if self.fqdn == "." {
            self.fqdn.clone()
        } else {
            format!(".{}", self.fqdn)
        };

        self.init_public_suffix_data();
        true
    }

    fn init_public_suffix_data(&mut self) {
        let bare = self.fqdn.trim_end_matches('.');
        let (mut icann, suffix) = match psl::suffix(bare.as_bytes()) {
            Some(suffix) => (
                matches!(suffix.typ(), Some(psl::Type::Icann)),
                String::from_utf8_lossy(suffix.as_bytes()).into_owned(),
            ),
            None => (false, String::new()),
        };
        // A multi-label suffix places the name in managed space even when the
        // rule sits in the private section of the list.
        if suffix.contains('.') {
            icann = true;
        }
        match suffix.as_str() {
            // Special-use names defined by ICANN.
            "example" | "invalid" | "local" | "localhost" | "test" => icann = true,
            // Defined by ICANN, but special.
            "onion" => icann = false,
            _ => {}
        }
        self.icann_space = icann;

        // Trailing dot for FQDN length arithmetic.
        let suffix = format!("{suffix}.");
        if self.fqdn.len() == suffix.len() {
            // At or below the domain root.
            self.domain_root.clear();
        } else if let Some(head) = self.fqdn.strip_suffix(suffix.as_str()) {
            let head = head.strip_suffix('.').unwrap_or(head);
            let root_start = head.rfind('.').map_or(0, |dot| dot + 1);
            self.domain_root = format!("{}.{}", &head[root_start..], suffix);
        }
    }

    /// Checks the query against local policy before any resolver is asked.
    pub(crate) fn check_compliance(&self, config: &ResolverConfig) -> Result<(), ResolveError> {
        if self.dot_prefixed_fqdn.ends_with(".localhost.") {
            return Err(ResolveError::Localhost);
        }
        // RFC 6761: .invalid never resolves.
        if self.dot_prefixed_fqdn.ends_with(".invalid.") {
            return Err(ResolveError::NotFound);
        }
        if !config.serve_test_domains
            && (self.dot_prefixed_fqdn.ends_with(".test.")
                || self.dot_prefixed_fqdn.ends_with(".example."))
        {
            return Err(ResolveError::TestDomainsDisabled);
        }
        if !config.serve_special_domains && !self.icann_space {
            return Err(ResolveError::SpecialDomainsDisabled);
        }
        Ok(())
    }
}
