//! Failing-resolvers notification state

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::error::ResolveError;

/// Tracks whether the user should currently be warned that all configured
/// resolvers are failing. Deduplicates the warning; the actual UI delivery
/// lives outside this crate.
#[derive(Default)]
pub struct FailureNotifier {
    active: AtomicBool,
    self_check_failing: AtomicBool,
}

impl FailureNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the failing-resolvers notification.
    pub fn notify_failing(&self, err: &ResolveError) {
        if !self.active.swap(true, Ordering::Relaxed) {
            warn!("configured resolvers are failing: {}", err);
        }
    }

    /// Clears the failing-resolvers notification after a successful query.
    pub fn reset_failing(&self) {
        if self.active.swap(false, Ordering::Relaxed) {
            debug!("configured resolvers recovered");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Reported by the periodic self-check worker; resolver failures are only
    /// surfaced to the user when the self-check agrees something is wrong.
    pub fn set_self_check_failing(&self, failing: bool) {
        self.self_check_failing.store(failing, Ordering::Relaxed);
    }

    pub fn self_check_failing(&self) -> bool {
        self.self_check_failing.load(Ordering::Relaxed)
    }
}
