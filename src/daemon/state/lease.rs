//! Lease validity and reservations.
//!
//! A lease is valid while an operation holds a reservation on it or while
//! `now < last_renew + lifetime`. The reaper expires leases in two passes: the
//! first marks an invalid lease pending expiry, the second expires it unless a
//! release in between renewed it.
//!
//! A pending lease has lapsed but is not yet reaped. A client that shows up in
//! that window still gets its reservation; the release that follows reports
//! the lease so the caller can pull it back off the reaper's list.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::core::SharedClock;

#[derive(Debug)]
struct LeaseInner {
    reservations: u32,
    last_renew: Instant,
    pending_expiry: bool,
    expired: bool,
}

pub struct Lease {
    inner: Mutex<LeaseInner>,
    lifetime: Duration,
    clock: SharedClock,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Lease")
            .field("reservations", &inner.reservations)
            .field("pending_expiry", &inner.pending_expiry)
            .field("expired", &inner.expired)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl Lease {
    pub fn new(clock: SharedClock, lifetime: Duration) -> Self {
        let now = clock.now();
        Self {
            inner: Mutex::new(LeaseInner {
                reservations: 0,
                last_renew: now,
                pending_expiry: false,
                expired: false,
            }),
            lifetime,
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LeaseInner> {
        self.inner.lock().expect("lease lock poisoned")
    }

    fn valid_locked(&self, inner: &LeaseInner) -> bool {
        if inner.expired {
            return false;
        }
        inner.reservations > 0 || self.clock.now() < inner.last_renew + self.lifetime
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn is_valid(&self) -> bool {
        self.valid_locked(&self.lock())
    }

    pub fn is_expired(&self) -> bool {
        self.lock().expired
    }

    pub fn reservations(&self) -> u32 {
        self.lock().reservations
    }

    pub fn is_pending_expiry(&self) -> bool {
        self.lock().pending_expiry
    }

    /// Take a reservation if the lease is still valid or pending expiry.
    pub fn reserve(&self) -> bool {
        let mut inner = self.lock();
        if !inner.pending_expiry && !self.valid_locked(&inner) {
            return false;
        }
        inner.reservations += 1;
        true
    }

    /// Drop a reservation. The release that reaches zero renews the lease.
    ///
    /// Returns true when the lease had been marked pending expiry and the
    /// caller should take it back off the reaper's list.
    pub fn release(&self) -> bool {
        let mut inner = self.lock();
        debug_assert!(inner.reservations > 0, "lease released without reservation");
        inner.reservations = inner.reservations.saturating_sub(1);
        if inner.reservations == 0 {
            inner.last_renew = self.clock.now();
        }
        std::mem::take(&mut inner.pending_expiry)
    }

    /// Renew without a reservation (e.g. an explicit RENEW).
    pub fn renew(&self) -> bool {
        let mut inner = self.lock();
        if inner.expired {
            return false;
        }
        inner.last_renew = self.clock.now();
        inner.pending_expiry = false;
        true
    }

    /// First reaper pass: mark an invalid lease. Returns true if newly marked.
    pub(crate) fn mark_pending_expiry(&self) -> bool {
        let mut inner = self.lock();
        if inner.pending_expiry || self.valid_locked(&inner) || inner.expired {
            return false;
        }
        inner.pending_expiry = true;
        true
    }

    /// Mark the lease expired if it is invalid. With `require_pending`, only a
    /// lease still marked by the previous reaper pass expires.
    ///
    /// Returns true for exactly one caller.
    pub(crate) fn try_expire(&self, require_pending: bool) -> bool {
        let mut inner = self.lock();
        if inner.expired || self.valid_locked(&inner) {
            return false;
        }
        if require_pending && !inner.pending_expiry {
            return false;
        }
        inner.expired = true;
        inner.pending_expiry = false;
        true
    }

    /// Expire regardless of time, as long as nothing holds a reservation.
    pub(crate) fn force_expire(&self) -> Result<(), u32> {
        let mut inner = self.lock();
        if inner.reservations > 0 {
            return Err(inner.reservations);
        }
        inner.expired = true;
        inner.pending_expiry = false;
        Ok(())
    }
}
