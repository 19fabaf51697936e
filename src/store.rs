//! Record store
//!
//! Key/value layer holding resolved record sets past their expiry, so that a
//! failed refresh can still serve a stale answer. Misses surface as
//! [`ResolveError::NotFound`].

use std::collections::HashMap;

use hickory_proto::rr::RecordType;
use parking_lot::RwLock;
use tracing::debug;

use crate::cache::{unix_now, RRCache, STALE_TTL};
use crate::error::{ResolveError, Result};

#[derive(Default)]
pub struct RecordStore {
    entries: RwLock<HashMap<(String, RecordType), RRCache>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fqdn: &str, qtype: RecordType) -> Result<RRCache> {
        self.entries
            .read()
            .get(&(fqdn.to_string(), qtype))
            .cloned()
            .ok_or(ResolveError::NotFound)
    }

    pub fn save(&self, rr: &RRCache) -> Result<()> {
        self.entries
            .write()
            .insert((rr.fqdn.clone(), rr.qtype), rr.clone());
        Ok(())
    }

    /// Drops a single cached record set. Returns the not-found sentinel when
    /// there was nothing to drop.
    pub fn reset(&self, fqdn: &str, qtype: RecordType) -> Result<()> {
        self.entries
            .write()
            .remove(&(fqdn.to_string(), qtype))
            .map(|_| ())
            .ok_or(ResolveError::NotFound)
    }

    /// Removes entries that expired longer than [`STALE_TTL`] ago and are no
    /// longer useful even as backups.
    pub fn prune(&self) {
        let now = unix_now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, rr| rr.expires + STALE_TTL > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("record store pruned {} stale entries", removed);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
