//! The log's lifecycle manager and runtime handle.
//!
//! [`LogHandle`] is the single owner of a log's scratch buffer and its
//! backing mlog handle. The free functions [`create`], [`make`], [`abort`],
//! and [`destroy`] implement the two-phase creation dance against a
//! [`MlogPool`]; [`open`] produces a live [`LogHandle`] from an
//! already-made log. Everything that can block goes through the
//! `Mlog` the handle owns; everything else (reservation, counters) is
//! atomic and lock-free outside the single ingest mutex guarding the
//! scratch buffer.

use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, instrument, warn};

use crate::bundle::{build_payload, BundleInput};
use crate::common::{LogConfig, INVALID_SEQNO};
use crate::error::{
    AbortSnafu, AllocSnafu, CloseSnafu, DeleteSnafu, EraseSnafu, FormatHeaderSnafu,
    IssueBundleError, IssueTxnError, LifecycleError, NotOpenSnafu as LifecycleNotOpenSnafu, OpenSnafu,
    SyncSnafu,
};
use crate::record::KvbHeader;
use crate::record::KvlogHeader;
use crate::txn::{build_payload as build_txn_payload, TransactionInput};
use crate::provider::{MediaClass, Mlog, MlogPool, ObjectId};

/// The descriptor returned by [`create`]: an allocated-but-not-yet-committed
/// mlog.
#[derive(Clone, Copy, Debug)]
pub struct LogDescriptor {
    pub object_id: ObjectId,
    pub media_class: MediaClass,
    pub capacity: u64,
}

/// The caller-supplied identity fields written into a `KVLOG` format
/// header, shared by [`make`] and [`LogHandle::reset`].
#[derive(Clone, Copy, Debug)]
pub struct FormatFields {
    pub mdcoid1: u64,
    pub mdcoid2: u64,
    pub seqno: u64,
    pub gen: u64,
}

/// Allocates (but does not commit) an mlog of `capacity` bytes, preferring
/// the "staging" media class and falling back to "capacity" if the pool
/// reports no staging class present.
///
/// On failure the pool is left untouched: nothing was allocated, or the
/// allocation attempt itself failed.
#[instrument(skip(pool), fields(capacity))]
pub fn create<P: MlogPool>(pool: &P, capacity: u64) -> Result<LogDescriptor, LifecycleError> {
    let class = if pool.probe_class(MediaClass::Staging) {
        MediaClass::Staging
    } else {
        MediaClass::Capacity
    };
    let (object_id, media_class) = pool.alloc(class, capacity).context(AllocSnafu)?;
    Ok(LogDescriptor {
        object_id,
        media_class,
        capacity,
    })
}

/// Commits an allocation, then opens, formats, and closes the log so it
/// exists durably and can be opened by any subsequent caller.
///
/// On commit failure, the allocation is aborted best-effort and the
/// *commit* error (not any abort error) is returned.
#[instrument(skip(pool, fields), fields(object_id = descriptor.object_id))]
pub fn make<P: MlogPool>(
    pool: &P,
    descriptor: &LogDescriptor,
    fields: FormatFields,
) -> Result<(), LifecycleError> {
    if let Err(source) = pool.commit(descriptor.object_id) {
        if let Err(abort_err) = pool.abort(descriptor.object_id) {
            warn!(error = %abort_err, "best-effort abort after failed commit also failed");
        }
        return Err(LifecycleError::Commit { source });
    }

    let (_generation, mlog) = pool.open(descriptor.object_id).context(OpenSnafu)?;
    let header = KvlogHeader {
        mdcoid1: fields.mdcoid1,
        mdcoid2: fields.mdcoid2,
        oid: descriptor.object_id,
        gen: fields.gen,
        capacity: descriptor.capacity,
        seqno: fields.seqno,
    };
    let result = write_format_header(&mlog, &header).context(FormatHeaderSnafu);
    if let Err(close_err) = mlog.close() {
        debug!(error = %close_err, "closing transient mlog handle after format failed");
    }
    result
}

/// Releases an allocated-but-not-committed descriptor.
pub fn abort<P: MlogPool>(pool: &P, descriptor: &LogDescriptor) -> Result<(), LifecycleError> {
    pool.abort(descriptor.object_id).context(AbortSnafu)
}

/// Deletes a committed log.
pub fn destroy<P: MlogPool>(pool: &P, object_id: ObjectId) -> Result<(), LifecycleError> {
    pool.delete(object_id).context(DeleteSnafu)
}

/// Opens a committed log for ingest: allocates a handle, zeros its
/// counters, opens the backing mlog, and records the generation the pool
/// returns.
#[instrument(skip(pool, config), fields(object_id))]
pub fn open<P: MlogPool>(
    pool: &P,
    object_id: ObjectId,
    capacity: u64,
    seqno: u64,
    config: LogConfig,
) -> Result<LogHandle<P::Mlog>, LifecycleError> {
    let (generation, mlog) = pool.open(object_id).context(OpenSnafu)?;
    Ok(LogHandle::from_parts(
        object_id,
        capacity,
        seqno,
        generation,
        config,
        Some(mlog),
    ))
}

/// Encodes and synchronously appends a `KVLOG` format header.
///
/// Always issued as a durable append regardless of any caller `sync`
/// preference elsewhere: there is no in-flight caller at format time, and
/// the format header is always written with `sync = true`.
fn write_format_header<M: Mlog>(mlog: &M, header: &KvlogHeader) -> Result<(), crate::error::ProviderError> {
    let mut buf = BytesMut::with_capacity(KvlogHeader::ENCODED_LEN);
    header.encode(&mut buf);
    let iov = [IoSlice::new(&buf)];
    mlog.append(&iov, buf.len() as u64, true)
}

/// In-memory bookkeeping of records pending downstream sync/flush,
/// design-level only.
/// An owning, grow-only sequence is all the design requires; a higher
/// layer drains it once records have been flushed to the main tree.
#[derive(Debug, Default)]
struct PendingRecords {
    bundle_seqnos: Vec<u64>,
    txn_seqnos: Vec<u64>,
}

/// A live, opened log.
///
/// Thread-compatible: multiple threads may call into the same handle
/// concurrently. Reservation and counter state is atomic and
/// lock-free; appends are serialized by a single ingest mutex that also
/// guards the scratch buffer used to assemble bundle payloads.
pub struct LogHandle<M: Mlog> {
    object_id: ObjectId,
    seqno: AtomicU64,
    generation: AtomicU64,
    capacity: AtomicU64,
    config: LogConfig,
    reserved: crate::ledger::ReservationLedger,
    committed_keys: AtomicU64,
    committed_values: AtomicU64,
    max_value_seq: AtomicU64,
    low_utilization_hint: AtomicBool,
    /// Guards both the scratch buffer's contents and append ordering: this
    /// is the ingest lock. Transaction issues take this
    /// lock too even though they never touch `scratch`, because ordering
    /// between bundle and transaction records is defined by this same
    /// mutex.
    scratch: Mutex<Vec<u8>>,
    pending: Mutex<PendingRecords>,
    mlog: Option<M>,
}

impl<M: Mlog> LogHandle<M> {
    fn from_parts(
        object_id: ObjectId,
        capacity: u64,
        seqno: u64,
        generation: u64,
        config: LogConfig,
        mlog: Option<M>,
    ) -> Self {
        Self {
            object_id,
            seqno: AtomicU64::new(seqno),
            generation: AtomicU64::new(generation),
            capacity: AtomicU64::new(capacity),
            config,
            reserved: crate::ledger::ReservationLedger::new(),
            committed_keys: AtomicU64::new(0),
            committed_values: AtomicU64::new(0),
            max_value_seq: AtomicU64::new(INVALID_SEQNO),
            low_utilization_hint: AtomicBool::new(false),
            scratch: Mutex::new(Vec::new()),
            pending: Mutex::new(PendingRecords::default()),
            mlog,
        }
    }

    /// Constructs a handle with no backing mlog opened yet. Useful for
    /// recovery-time scaffolding where a log's identity is known before
    /// its mlog is reopened; [`LogHandle::close`] on such a handle is a
    /// no-op.
    #[must_use]
    pub fn detached(object_id: ObjectId, capacity: u64, seqno: u64, generation: u64, config: LogConfig) -> Self {
        Self::from_parts(object_id, capacity, seqno, generation, config, None)
    }

    #[must_use]
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    #[must_use]
    pub fn seqno(&self) -> u64 {
        self.seqno.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Returns the declared capacity. There is no Rust equivalent of the
    /// original's "return zero for a null handle" defensive check — a
    /// `&self` cannot be null, so a live handle always has a real
    /// capacity (see `DESIGN.md`).
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Overwrites the declared capacity. Intended only for recovery-time
    /// reconciliation.
    pub fn set_capacity(&self, capacity: u64) {
        self.capacity.store(capacity, Ordering::SeqCst);
    }

    /// The usable capacity for this handle's current declared capacity,
    /// per this handle's [`LogConfig`].
    #[must_use]
    pub fn usable_capacity(&self) -> u64 {
        self.config.usable_capacity(self.capacity())
    }

    #[must_use]
    pub fn committed_key_count(&self) -> u64 {
        self.committed_keys.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn committed_value_count(&self) -> u64 {
        self.committed_values.load(Ordering::SeqCst)
    }

    /// The largest value-tuple sequence number ever persisted by this
    /// handle, or [`INVALID_SEQNO`] if none has been.
    #[must_use]
    pub fn max_value_seq(&self) -> u64 {
        self.max_value_seq.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn low_utilization_hint(&self) -> bool {
        self.low_utilization_hint.load(Ordering::SeqCst)
    }

    fn mlog(&self) -> Option<&M> {
        self.mlog.as_ref()
    }

    /// Reserves `size` bytes against this handle's available capacity
    /// (capacity itself if `spare`, else usable capacity), after
    /// confirming the live mlog length does not already exceed it.
    pub fn reserve(&self, size: u64, spare: bool) -> Result<u64, crate::error::ReserveError> {
        let mlog = self.mlog().ok_or(crate::error::ReserveError::NotOpen)?;
        let available = if spare {
            self.capacity()
        } else {
            self.usable_capacity()
        };
        let length = mlog.len().context(crate::error::QueryLengthSnafu)?;
        self.reserved.reserve(size, available, length)
    }

    /// Resynchronizes the reservation ledger to the live mlog length,
    /// leaving it unchanged if the length query fails.
    #[must_use]
    pub fn refresh_space(&self) -> u64 {
        match self.mlog() {
            Some(mlog) => self.reserved.refresh(mlog),
            None => self.reserved.reserved(),
        }
    }

    /// Peeks whether reserving `size` more bytes fits within this
    /// handle's usable capacity.
    #[must_use]
    pub fn has_space(&self, size: u64, rsvd: &mut u64) -> bool {
        self.reserved.has_space(size, self.usable_capacity(), rsvd)
    }

    /// Closes the backing mlog if one is open, then consumes (frees) the
    /// handle regardless of the close result.
    pub fn close(self) -> Result<(), LifecycleError> {
        match self.mlog {
            Some(mlog) => mlog.close().context(CloseSnafu),
            None => Ok(()),
        }
    }

    /// Erases the mlog from offset zero, adopts the caller-supplied
    /// sequence/generation, zeros all reservation and record counters,
    /// and re-emits the format header.
    #[instrument(skip(self), fields(object_id = self.object_id))]
    pub fn reset(&self, fields: FormatFields) -> Result<(), LifecycleError> {
        let mlog = self.mlog().context(LifecycleNotOpenSnafu)?;
        mlog.erase(0).context(EraseSnafu)?;

        self.seqno.store(fields.seqno, Ordering::SeqCst);
        self.generation.store(fields.gen, Ordering::SeqCst);
        self.reserved.reset();
        self.committed_keys.store(0, Ordering::SeqCst);
        self.committed_values.store(0, Ordering::SeqCst);
        self.max_value_seq.store(INVALID_SEQNO, Ordering::SeqCst);
        {
            let mut pending = self.pending.lock();
            pending.bundle_seqnos.clear();
            pending.txn_seqnos.clear();
        }

        let header = KvlogHeader {
            mdcoid1: fields.mdcoid1,
            mdcoid2: fields.mdcoid2,
            oid: self.object_id,
            gen: fields.gen,
            capacity: self.capacity(),
            seqno: fields.seqno,
        };
        write_format_header(mlog, &header).context(FormatHeaderSnafu)
    }

    /// Issues an mlog sync; on success clears the low-utilization hint
    /// flag. State is unchanged on error.
    pub fn flush(&self) -> Result<(), LifecycleError> {
        let mlog = self.mlog().context(LifecycleNotOpenSnafu)?;
        mlog.sync().context(SyncSnafu)?;
        self.low_utilization_hint.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Journals a key-value bundle as a header record immediately
    /// followed by its payload, both appended under the ingest mutex.
    ///
    /// Committed key/value counters are incremented unconditionally
    /// before the bundle is validated or appended, and are *not* rolled
    /// back on a later validation or append failure.
    #[instrument(skip(self, bundle), fields(object_id = self.object_id, seqno = bundle.seqno))]
    pub fn issue_kvb(&self, bundle: &BundleInput<'_>, sync: bool) -> Result<(), IssueBundleError> {
        use crate::error::AppendSnafu;

        let mlog = self.mlog().ok_or(IssueBundleError::NotOpen)?;

        let key_count = bundle.key_count();
        let value_count = bundle.value_count();
        let cumulative_key_count = self.committed_keys.fetch_add(key_count, Ordering::SeqCst) + key_count;
        self.committed_values.fetch_add(value_count, Ordering::SeqCst);

        let mut scratch = self.scratch.lock();
        let built = build_payload(
            &mut scratch,
            self.config.scratch_growth_unit,
            self.config.scratch_soft_ceiling,
            bundle,
        );

        let (built, grew_past_ceiling) = match built {
            Ok(ok) => ok,
            Err(err) => {
                warn!(error = %err, "bundle validation failed before any append was attempted");
                return Err(err);
            }
        };

        let header = KvbHeader {
            seqno: bundle.seqno,
            txn_id: bundle.txn_id,
            gen: bundle.gen,
            mutation: bundle.mutation,
            key_count,
            cumulative_key_count,
            payload_size: built.payload_size,
            min_seq: bundle.min_seq,
            max_seq: bundle.max_seq,
            min_key: crate::record::KeyImmediate::from_key(bundle.min_key),
            max_key: crate::record::KeyImmediate::from_key(bundle.max_key),
            ingest_id: bundle.ingest_id,
        };
        let mut header_buf = BytesMut::with_capacity(KvbHeader::ENCODED_LEN);
        header.encode(&mut header_buf);

        // The header append is never durable-forced; only the payload
        // honors the caller's `sync` flag.
        let result = mlog
            .append(&[IoSlice::new(&header_buf)], header_buf.len() as u64, false)
            .context(AppendSnafu)
            .and_then(|()| {
                mlog.append(&built.iovs, built.payload_size, sync).context(AppendSnafu)
            });

        match &result {
            Ok(()) => {
                self.max_value_seq.fetch_max(bundle.max_seq, Ordering::SeqCst);
                self.pending.lock().bundle_seqnos.push(bundle.seqno);
            }
            Err(err) => {
                let length = mlog.len().ok();
                warn!(
                    error = %err,
                    mlog_length = ?length,
                    reserved = self.reserved.reserved(),
                    "bundle append failed"
                );
            }
        }

        if grew_past_ceiling {
            *scratch = Vec::new();
        }

        result
    }

    /// Journals a single tree-transaction record under the ingest mutex,
    /// honoring the caller's `sync` flag.
    #[instrument(skip(self, txn), fields(object_id = self.object_id, seqno = txn.seqno))]
    pub fn issue_txn(&self, txn: &TransactionInput, sync: bool) -> Result<(), IssueTxnError> {
        use crate::error::AppendSnafu;

        let mlog = self.mlog().ok_or(IssueTxnError::NotOpen)?;
        let encoded = txn.encode();
        let iov = build_txn_payload(&encoded);

        let _guard = self.scratch.lock();
        let result = mlog
            .append(&iov, encoded.len() as u64, sync)
            .context(AppendSnafu);
        if result.is_ok() {
            self.pending.lock().txn_seqnos.push(txn.seqno);
        }
        result
    }

    /// Drains and returns the seqnos of bundles and transactions issued
    /// since the last drain, for a higher layer to mark flushed.
    pub fn drain_pending(&self) -> (Vec<u64>, Vec<u64>) {
        let mut pending = self.pending.lock();
        (
            std::mem::take(&mut pending.bundle_seqnos),
            std::mem::take(&mut pending.txn_seqnos),
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::bundle::{BundleInput, KeyTupleInput, ValueTupleInput};
    use crate::common::LogConfig;
    use crate::provider::mock::MockPool;
    use crate::provider::MlogPool;

    use super::{create, make, open, FormatFields};

    fn issue_one_key_bundle(
        log: &super::LogHandle<<MockPool as MlogPool>::Mlog>,
        seqno: u64,
        value_count: u64,
    ) {
        let values: Vec<ValueTupleInput> = (0..value_count)
            .map(|i| ValueTupleInput {
                seq: i,
                extended_len: 0,
                tombstone: false,
                bytes: &[],
            })
            .collect();
        let keys = [KeyTupleInput {
            container_id: 1,
            key: b"k",
            value_total_len: 0,
            value_count,
            values: &values,
        }];
        let bundle = BundleInput {
            seqno,
            txn_id: 0,
            gen: 1,
            mutation: 1,
            ingest_id: seqno,
            min_seq: 0,
            max_seq: value_count,
            min_key: b"k",
            max_key: b"k",
            keys: &keys,
        };
        log.issue_kvb(&bundle, true).unwrap();
    }

    #[test]
    fn scratch_buffer_released_after_high_water_bundle() {
        let pool = MockPool::with_staging();
        let descriptor = create(&pool, 64 * 1024 * 1024).unwrap();
        make(
            &pool,
            &descriptor,
            FormatFields {
                mdcoid1: 0,
                mdcoid2: 0,
                seqno: 1,
                gen: 1,
            },
        )
        .unwrap();
        let log = open(&pool, descriptor.object_id, 64 * 1024 * 1024, 1, LogConfig::default()).unwrap();

        // A bundle whose value-header region alone exceeds the 256 KiB
        // soft ceiling forces the scratch buffer past it.
        issue_one_key_bundle(&log, 1, 10_000);
        assert!(log.scratch.lock().is_empty());
        assert_eq!(log.scratch.lock().capacity(), 0);

        // The next, small bundle reallocates from zero rather than
        // keeping the oversized buffer around.
        issue_one_key_bundle(&log, 2, 4);
        assert!(log.scratch.lock().capacity() < 256 * 1024);
    }
}
