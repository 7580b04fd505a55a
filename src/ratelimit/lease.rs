//! Admission results.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::partition::Partition;

/// The outcome of an admission check.
///
/// Leases granted by a concurrency strategy hold a slot until they are
/// released, either explicitly with [`Lease::release`] or by being dropped.
/// Releasing twice is a no-op. Leases from window and token strategies carry
/// no release obligation and releasing them does nothing.
pub struct Lease {
    acquired: bool,
    retry_after: Option<Duration>,
    permit: Option<Arc<Partition>>,
}

impl Lease {
    pub(crate) fn granted(permit: Option<Arc<Partition>>) -> Self {
        Self {
            acquired: true,
            retry_after: None,
            permit,
        }
    }

    pub(crate) fn denied(retry_after: Option<Duration>) -> Self {
        Self {
            acquired: false,
            retry_after,
            permit: None,
        }
    }

    /// Whether the request was admitted.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Time until a permit is expected to free up, for denied leases.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Whether this lease still holds a slot that must be handed back.
    pub fn requires_release(&self) -> bool {
        self.permit.is_some()
    }

    /// Hand the held slot back to its partition.
    pub fn release(&mut self) {
        if let Some(partition) = self.permit.take() {
            partition.release_permit();
        }
    }

    /// Forget the held slot without touching the partition.
    ///
    /// Used while the partition lock is already held.
    pub(crate) fn disarm(&mut self) -> bool {
        self.permit.take().is_some()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("acquired", &self.acquired)
            .field("retry_after", &self.retry_after)
            .field("requires_release", &self.requires_release())
            .finish()
    }
}
