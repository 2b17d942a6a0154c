//! The space-reservation ledger.
//!
//! An atomic byte counter that makes appends non-failing for lack of room
//! under normal operation: a caller reserves space before building and
//! issuing a bundle, and the log's own append path never consults the
//! ledger — it is only resynchronized from the live mlog length via
//! [`ReservationLedger::refresh`].

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::error::{NoSpaceSnafu, OutOfMemorySnafu, QueryLengthSnafu, ReserveError};
use crate::provider::Mlog;

/// Tracks outstanding byte reservations against a log's usable capacity.
///
/// All operations are lock-free: they perform atomic arithmetic only and
/// never block.
#[derive(Debug, Default)]
pub struct ReservationLedger {
    reserved: AtomicU64,
}

impl ReservationLedger {
    /// Creates a ledger with zero bytes reserved.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reserved: AtomicU64::new(0),
        }
    }

    /// Returns the currently reserved byte count.
    #[must_use]
    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Zeros the ledger. Used by `reset` when a log is recycled.
    pub fn reset(&self) {
        self.reserved.store(0, Ordering::SeqCst);
    }

    /// Reserves `size` bytes against `available` (capacity if `spare`,
    /// else usable capacity), after confirming the live mlog `length`
    /// does not already exceed `available`.
    ///
    /// On success, the ledger's reserved total has increased by exactly
    /// `size`. On failure, the ledger is left unchanged.
    pub fn reserve(&self, size: u64, available: u64, length: u64) -> Result<u64, ReserveError> {
        if size > available {
            warn!(size, available, "reservation exceeds available capacity");
            return NoSpaceSnafu { size, available }.fail();
        }

        let reserved = self.reserved.fetch_add(size, Ordering::SeqCst) + size;

        if length > available || reserved > available {
            self.reserved.fetch_sub(size, Ordering::SeqCst);
            debug!(
                size,
                available, length, reserved, "reservation would exceed capacity, rolled back"
            );
            return OutOfMemorySnafu { size, available }.fail();
        }

        Ok(reserved)
    }

    /// Resynchronizes the ledger to the live mlog length queried from
    /// `mlog`.
    ///
    /// On query failure, the ledger is left unchanged and its current
    /// value is returned rather than propagating the error — callers that
    /// need to observe the failure should query the mlog directly.
    pub fn refresh(&self, mlog: &impl Mlog) -> u64 {
        match mlog.len() {
            Ok(length) => {
                self.reserved.store(length, Ordering::SeqCst);
                length
            }
            Err(source) => {
                warn!(error = %source, "failed to refresh reservation ledger from mlog length");
                self.reserved()
            }
        }
    }

    /// Fallible variant of [`ReservationLedger::refresh`] that surfaces
    /// the query error instead of swallowing it.
    pub fn try_refresh(&self, mlog: &impl Mlog) -> Result<u64, ReserveError> {
        let length = mlog.len().map_err(|source| QueryLengthSnafu.into_error(source))?;
        self.reserved.store(length, Ordering::SeqCst);
        Ok(length)
    }

    /// Peeks whether reserving `size` more bytes would fit within
    /// `usable_capacity`, seeding `rsvd` from the ledger if it is zero.
    ///
    /// On success, `*rsvd` is updated to the prospective total and `true`
    /// is returned. On failure `*rsvd` is left untouched.
    #[must_use]
    pub fn has_space(&self, size: u64, usable_capacity: u64, rsvd: &mut u64) -> bool {
        let base = if *rsvd == 0 { self.reserved() } else { *rsvd };
        let prospective = base + size;
        if prospective <= usable_capacity {
            *rsvd = prospective;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::{prop_assert, prop_assert_eq, proptest};

    use super::*;
    use crate::provider::mock::MockPool;
    use crate::provider::MlogPool;

    fn open_mock() -> <MockPool as MlogPool>::Mlog {
        let pool = MockPool::with_staging();
        let (oid, _class) = pool.alloc(crate::provider::MediaClass::Staging, 1_000_000).unwrap();
        pool.commit(oid).unwrap();
        let (_gen, mlog) = pool.open(oid).unwrap();
        mlog
    }

    #[test]
    fn reserve_within_capacity_succeeds() {
        let ledger = ReservationLedger::new();
        let reserved = ledger.reserve(900_000, 900_000, 0).unwrap();
        assert_eq!(reserved, 900_000);
        assert_eq!(ledger.reserved(), 900_000);
    }

    #[test]
    fn reserve_exceeding_usable_capacity_fails_and_leaves_ledger_unchanged() {
        let ledger = ReservationLedger::new();
        ledger.reserve(900_000, 900_000, 0).unwrap();
        let before = ledger.reserved();
        let err = ledger.reserve(1, 900_000, 0).unwrap_err();
        assert!(matches!(err, ReserveError::OutOfMemory { .. }));
        assert_eq!(ledger.reserved(), before);
    }

    #[test]
    fn reserve_above_available_outright_is_no_space() {
        let ledger = ReservationLedger::new();
        let err = ledger.reserve(2_000_000, 900_000, 0).unwrap_err();
        assert!(matches!(err, ReserveError::NoSpace { .. }));
        assert_eq!(ledger.reserved(), 0);
    }

    #[test]
    fn spare_path_allows_full_capacity() {
        let ledger = ReservationLedger::new();
        let reserved = ledger.reserve(1_000_000, 1_000_000, 0).unwrap();
        assert_eq!(reserved, 1_000_000);
    }

    #[test]
    fn refresh_resyncs_from_mlog_length() {
        let mlog = open_mock();
        let iov = [std::io::IoSlice::new(b"hello")];
        mlog.append(&iov, 5, true).unwrap();

        let ledger = ReservationLedger::new();
        ledger.reserve(100, 1_000_000, 0).unwrap();
        let refreshed = ledger.refresh(&mlog);
        assert_eq!(refreshed, 5);
        assert_eq!(ledger.reserved(), 5);
    }

    #[test]
    fn has_space_seeds_from_ledger_when_rsvd_zero() {
        let ledger = ReservationLedger::new();
        ledger.reserve(100, 1_000, 0).unwrap();

        let mut rsvd = 0;
        assert!(ledger.has_space(50, 1_000, &mut rsvd));
        assert_eq!(rsvd, 150);
    }

    #[test]
    fn has_space_rejects_and_leaves_inout_untouched_when_over() {
        let ledger = ReservationLedger::new();
        let mut rsvd = 900;
        assert!(!ledger.has_space(200, 1_000, &mut rsvd));
        assert_eq!(rsvd, 900);
    }

    proptest! {
        #[test]
        fn reserve_either_succeeds_and_increments_or_leaves_ledger_unchanged(
            first in 0u64..2_000_000,
            second in 0u64..2_000_000,
        ) {
            let ledger = ReservationLedger::new();
            let available = 1_000_000u64;
            let before = ledger.reserved();
            match ledger.reserve(first, available, 0) {
                Ok(total) => prop_assert_eq!(total, before + first),
                Err(_) => prop_assert_eq!(ledger.reserved(), before),
            }
            let before = ledger.reserved();
            match ledger.reserve(second, available, 0) {
                Ok(total) => prop_assert_eq!(total, before + second),
                Err(_) => prop_assert_eq!(ledger.reserved(), before),
            }
        }
    }
}
