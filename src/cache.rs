//! Cached record sets and TTL policy

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{RData, Record, RecordType};

use crate::upstream::{ServerSource, UpstreamInfo};

/// Floor for cached record TTLs, in seconds.
pub const MIN_TTL: u32 = 60;
/// Remaining lifetime below which a cache entry is refreshed in the
/// background.
pub const REFRESH_TTL: i64 = (MIN_TTL / 2) as i64;
/// Floor for multicast DNS records, which often carry very short TTLs.
pub const MIN_MDNS_TTL: u32 = 60;
/// Ceiling for cached record TTLs: 24 hours.
pub const MAX_TTL: u32 = 24 * 60 * 60;

/// How long an expired entry stays in the store as a backup candidate.
pub const STALE_TTL: i64 = 60 * 60;

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// A response record set with caching metadata.
#[derive(Debug, Clone)]
pub struct RRCache {
    /// Canonical trailing-dot domain name the records answer.
    pub fqdn: String,
    pub qtype: RecordType,
    pub rcode: ResponseCode,

    pub answer: Vec<Record>,
    pub authority: Vec<Record>,
    pub extra: Vec<Record>,

    /// Absolute expiry, unix seconds.
    pub expires: i64,

    /// Identity of the resolver that produced this record set.
    pub resolver: Arc<UpstreamInfo>,

    /// Set while an async refresh for this entry is in flight.
    pub requesting_new: bool,
    /// Set when the entry is served as a stale fallback.
    pub is_backup: bool,
}

impl RRCache {
    pub fn new(
        fqdn: impl Into<String>,
        qtype: RecordType,
        rcode: ResponseCode,
        resolver: Arc<UpstreamInfo>,
    ) -> Self {
        Self {
            fqdn: fqdn.into(),
            qtype,
            rcode,
            answer: Vec::new(),
            authority: Vec::new(),
            extra: Vec::new(),
            expires: 0,
            resolver,
            requesting_new: false,
            is_backup: false,
        }
    }

    /// Identifier matching [`crate::query::Query::id`].
    pub fn id(&self) -> String {
        format!("{}{}", self.fqdn, self.qtype)
    }

    pub fn expired(&self) -> bool {
        self.expires <= unix_now()
    }

    /// Whether the entry is close enough to expiry to warrant a background
    /// refresh.
    pub fn expires_soon(&self) -> bool {
        self.expires <= unix_now() + REFRESH_TTL
    }

    /// Seconds until expiry, clamped at zero.
    pub fn ttl_remaining(&self) -> i64 {
        (self.expires - unix_now()).max(0)
    }

    /// Whether the record set may be written to the store. Negative and
    /// failed responses are not worth keeping.
    pub fn cacheable(&self) -> bool {
        !matches!(self.rcode, ResponseCode::NXDomain | ResponseCode::ServFail)
    }

    /// Clamps all record TTLs to a single value within the allowed range and
    /// derives the absolute expiry from it.
    ///
    /// Some upstreams do not reset TTLs on their own cache hits; using the
    /// lowest TTL across all sections keeps the whole set consistent.
    pub fn clean(&mut self, min_ttl: u32) {
        let floor = if self.resolver.source == ServerSource::Mdns {
            min_ttl.max(MIN_MDNS_TTL)
        } else {
            min_ttl
        };

        let mut lowest = u32::MAX;
        for record in self.records() {
            lowest = lowest.min(record.ttl());
        }
        let ttl = lowest.clamp(floor, MAX_TTL);

        for record in self.records_mut() {
            record.set_ttl(ttl);
        }
        self.expires = unix_now() + i64::from(ttl);
    }

    /// All IPv4 addresses found in the answer section.
    pub fn export_all_a_records(&self) -> Vec<Ipv4Addr> {
        self.answer
            .iter()
            .filter_map(|record| match record.data() {
                RData::A(a) => Some(a.0),
                _ => None,
            })
            .collect()
    }

    fn records(&self) -> impl Iterator<Item = &Record> {
        self.answer
            .iter()
            .chain(self.authority.iter())
            .chain(self.extra.iter())
    }

    fn records_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.answer
            .iter_mut()
            .chain(self.authority.iter_mut())
            .chain(self.extra.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Name;

    fn test_info() -> Arc<UpstreamInfo> {
        Arc::new(UpstreamInfo::new("udp#test", "test", ServerSource::Configured))
    }

    fn a_record(name: &str, ttl: u32, ip: [u8; 4]) -> Record {
        Record::from_rdata(
            Name::from_ascii(name).unwrap(),
            ttl,
            RData::A(A(Ipv4Addr::from(ip))),
        )
    }

    #[test]
    fn test_clean_clamps_low_ttl() {
        let mut rr = RRCache::new("example.com.", RecordType::A, ResponseCode::NoError, test_info());
        rr.answer.push(a_record("example.com.", 5, [1, 2, 3, 4]));
        rr.clean(MIN_TTL);

        assert_eq!(rr.answer[0].ttl(), MIN_TTL);
        let remaining = rr.ttl_remaining();
        assert!(remaining > 0 && remaining <= i64::from(MIN_TTL));
    }

    #[test]
    fn test_clean_clamps_high_ttl() {
        let mut rr = RRCache::new("example.com.", RecordType::A, ResponseCode::NoError, test_info());
        rr.answer.push(a_record("example.com.", 1_000_000, [1, 2, 3, 4]));
        rr.clean(MIN_TTL);
        assert_eq!(rr.answer[0].ttl(), MAX_TTL);
    }

    #[test]
    fn test_clean_uses_lowest_ttl_across_sections() {
        let mut rr = RRCache::new("example.com.", RecordType::A, ResponseCode::NoError, test_info());
        rr.answer.push(a_record("example.com.", 600, [1, 2, 3, 4]));
        rr.extra.push(a_record("ns.example.com.", 90, [5, 6, 7, 8]));
        rr.clean(MIN_TTL);

        assert_eq!(rr.answer[0].ttl(), 90);
        assert_eq!(rr.extra[0].ttl(), 90);
    }

    #[test]
    fn test_expired_and_expires_soon() {
        let mut rr = RRCache::new("example.com.", RecordType::A, ResponseCode::NoError, test_info());

        rr.expires = unix_now() - 1;
        assert!(rr.expired());
        assert!(rr.expires_soon());

        rr.expires = unix_now() + 20;
        assert!(!rr.expired());
        assert!(rr.expires_soon());

        rr.expires = unix_now() + 600;
        assert!(!rr.expired());
        assert!(!rr.expires_soon());
    }

    #[test]
    fn test_cacheable() {
        let mut rr = RRCache::new("example.com.", RecordType::A, ResponseCode::NoError, test_info());
        assert!(rr.cacheable());
        rr.rcode = ResponseCode::NXDomain;
        assert!(!rr.cacheable());
        rr.rcode = ResponseCode::ServFail;
        assert!(!rr.cacheable());
        rr.rcode = ResponseCode::Refused;
        assert!(rr.cacheable());
    }

    #[test]
    fn test_export_all_a_records() {
        let mut rr = RRCache::new("example.com.", RecordType::A, ResponseCode::NoError, test_info());
        rr.answer.push(a_record("example.com.", 300, [1, 2, 3, 4]));
        rr.answer.push(a_record("example.com.", 300, [5, 6, 7, 8]));

        let ips = rr.export_all_a_records();
        assert_eq!(
            ips,
            vec![Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8)]
        );
    }
}
