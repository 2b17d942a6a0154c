//! The C1 key-value log: a durable, append-only ingest journal for a
//! log-structured key-value store.
//!
//! Each [`handle::LogHandle`] wraps a single underlying media-log object
//! (an `mlog`: an append-only, segment-backed byte stream provided by a
//! storage pool implementing [`provider::MlogPool`]) and serializes
//! higher-level key-value bundles and tree-transaction records into that
//! stream so they can be recovered after a crash, before being flushed
//! to the main tree.
//!
//! This crate treats the underlying media-log provider as an external
//! collaborator (see [`provider`]); it does not implement a real media
//! log itself. Higher-level orchestration — which log a bundle is routed
//! to, log-group rotation, recovery replay, compaction against the main
//! tree — lives above this crate.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bundle;
pub mod common;
pub mod error;
pub mod handle;
pub mod ledger;
pub mod provider;
pub mod record;
pub mod txn;

pub use bundle::{BundleInput, KeyTupleInput, ValueTupleInput};
pub use common::LogConfig;
pub use handle::{create, destroy, make, open, FormatFields, LogDescriptor, LogHandle};
pub use ledger::ReservationLedger;
pub use provider::{MediaClass, Mlog, MlogPool, ObjectId};
pub use record::{KvbHeader, KvlogHeader, TxnHeader};
pub use txn::TransactionInput;

#[cfg(test)]
mod tests {
    //! End-to-end lifecycle and ingest scenarios, exercised against the
    //! in-memory mock provider.

    use pretty_assertions::assert_eq;

    use crate::bundle::{BundleInput, KeyTupleInput, ValueTupleInput};
    use crate::common::LogConfig;
    use crate::handle::{self, FormatFields};
    use crate::provider::mock::MockPool;
    use crate::provider::{MediaClass, MlogPool};
    use crate::record::{KvbHeader, KvlogHeader};
    use crate::txn::TransactionInput;

    fn make_and_open(pool: &MockPool, capacity: u64) -> crate::handle::LogHandle<<MockPool as MlogPool>::Mlog> {
        let descriptor = handle::create(pool, capacity).unwrap();
        handle::make(
            pool,
            &descriptor,
            FormatFields {
                mdcoid1: 0xA,
                mdcoid2: 0xB,
                seqno: 1,
                gen: 1,
            },
        )
        .unwrap();
        handle::open(pool, descriptor.object_id, capacity, 1, LogConfig::default()).unwrap()
    }

    #[test]
    fn create_and_format_writes_kvlog_header() {
        let pool = MockPool::with_staging();
        let capacity = 16 * 1024 * 1024;
        let descriptor = handle::create(&pool, capacity).unwrap();
        assert_eq!(descriptor.media_class, MediaClass::Staging);

        handle::make(
            &pool,
            &descriptor,
            FormatFields {
                mdcoid1: 0xA,
                mdcoid2: 0xB,
                seqno: 1,
                gen: 1,
            },
        )
        .unwrap();

        let bytes = pool.snapshot(descriptor.object_id);
        let header = KvlogHeader::decode(&bytes).unwrap();
        assert_eq!(header.mdcoid1, 0xA);
        assert_eq!(header.mdcoid2, 0xB);
        assert_eq!(header.oid, descriptor.object_id);
        assert_eq!(header.gen, 1);
        assert_eq!(header.capacity, capacity);
        assert_eq!(header.seqno, 1);
    }

    #[test]
    fn create_falls_back_to_capacity_class_without_staging() {
        let pool = MockPool::without_staging();
        let descriptor = handle::create(&pool, 1024).unwrap();
        assert_eq!(descriptor.media_class, MediaClass::Capacity);
    }

    #[test]
    fn single_bundle_append_updates_counters_and_media() {
        let pool = MockPool::with_staging();
        let log = make_and_open(&pool, 16 * 1024 * 1024);

        let values = [ValueTupleInput {
            seq: 42,
            extended_len: 2,
            tombstone: false,
            bytes: b"v1",
        }];
        let keys = [KeyTupleInput {
            container_id: 7,
            key: b"k1",
            value_total_len: 2,
            value_count: 1,
            values: &values,
        }];
        let bundle = BundleInput {
            seqno: 100,
            txn_id: 0,
            gen: 1,
            mutation: 1,
            ingest_id: 1,
            min_seq: 42,
            max_seq: 42,
            min_key: b"k1",
            max_key: b"k1",
            keys: &keys,
        };

        log.issue_kvb(&bundle, true).unwrap();

        assert_eq!(log.max_value_seq(), 42);
        assert_eq!(log.committed_key_count(), 1);
        assert_eq!(log.committed_value_count(), 1);

        let media = pool.snapshot(log.object_id());
        // The first record on media is the KVLOG format header; the
        // second is this bundle's KVB header.
        let kvlog_len = KvlogHeader::ENCODED_LEN;
        let kvb = KvbHeader::decode(&media[kvlog_len..]).unwrap();
        assert_eq!(kvb.seqno, 100);
        assert_eq!(kvb.min_seq, 42);
        assert_eq!(kvb.max_seq, 42);

        let payload_offset = kvlog_len + KvbHeader::ENCODED_LEN;
        let payload = &media[payload_offset..];
        // [key_hdr, "k1", val_hdr, "v1"]
        assert_eq!(
            &payload[crate::record::KEY_TUPLE_HEADER_LEN..crate::record::KEY_TUPLE_HEADER_LEN + 2],
            b"k1"
        );
    }

    #[test]
    fn aggregate_mismatch_leaves_counters_incremented_but_no_payload_written() {
        // Committed counters are incremented unconditionally before
        // validation, and are not rolled back on failure.
        let pool = MockPool::with_staging();
        let log = make_and_open(&pool, 1024 * 1024);

        let values = [ValueTupleInput {
            seq: 1,
            extended_len: 1,
            tombstone: false,
            bytes: b"v",
        }];
        // Declares 2 values but only one is walked.
        let keys = [KeyTupleInput {
            container_id: 1,
            key: b"k",
            value_total_len: 2,
            value_count: 2,
            values: &values,
        }];
        let bundle = BundleInput {
            seqno: 1,
            txn_id: 0,
            gen: 1,
            mutation: 1,
            ingest_id: 1,
            min_seq: 1,
            max_seq: 1,
            min_key: b"k",
            max_key: b"k",
            keys: &keys,
        };

        let before = pool.snapshot(log.object_id()).len();
        let err = log.issue_kvb(&bundle, true).unwrap_err();
        assert!(matches!(err, crate::error::IssueBundleError::AggregateMismatch { .. }));
        assert_eq!(log.committed_key_count(), 1);
        assert_eq!(log.committed_value_count(), 2);
        assert_eq!(pool.snapshot(log.object_id()).len(), before);
    }

    #[test]
    fn reservation_exhaustion_scenario() {
        let pool = MockPool::with_staging();
        let log = make_and_open(&pool, 1024 * 1024);

        // Usable capacity is 9/10 of 1 MiB ~ 943718 bytes; reserve up to
        // just under that, then exhaust it, then succeed again via the
        // spare (full-capacity) path.
        let usable = log.usable_capacity();
        log.reserve(usable, false).unwrap();
        let err = log.reserve(1, false).unwrap_err();
        assert!(matches!(err, crate::error::ReserveError::OutOfMemory { .. }));
        // spare=true measures against full capacity, not usable capacity,
        // but the ledger is already saturated from the prior reservation
        // so this still depends on outstanding reservations; exercise it
        // against a fresh ledger via refresh first.
        log.refresh_space();
        let ok = log.reserve(log.capacity() - 1, true);
        assert!(ok.is_ok() || matches!(ok, Err(crate::error::ReserveError::OutOfMemory { .. })));
    }

    #[test]
    fn reset_reinitializes_log_to_single_format_header() {
        let pool = MockPool::with_staging();
        let log = make_and_open(&pool, 1024 * 1024);

        let values = [ValueTupleInput {
            seq: 1,
            extended_len: 1,
            tombstone: false,
            bytes: b"v",
        }];
        let keys = [KeyTupleInput {
            container_id: 1,
            key: b"k",
            value_total_len: 1,
            value_count: 1,
            values: &values,
        }];
        let bundle = BundleInput {
            seqno: 1,
            txn_id: 0,
            gen: 1,
            mutation: 1,
            ingest_id: 1,
            min_seq: 1,
            max_seq: 1,
            min_key: b"k",
            max_key: b"k",
            keys: &keys,
        };
        log.issue_kvb(&bundle, true).unwrap();
        assert_eq!(log.committed_key_count(), 1);

        log.reset(FormatFields {
            mdcoid1: 0xC,
            mdcoid2: 0xD,
            seqno: 2,
            gen: 2,
        })
        .unwrap();

        assert_eq!(log.committed_key_count(), 0);
        assert_eq!(log.committed_value_count(), 0);
        assert_eq!(log.max_value_seq(), crate::common::INVALID_SEQNO);
        assert_eq!(log.seqno(), 2);
        assert_eq!(log.generation(), 2);

        let media = pool.snapshot(log.object_id());
        assert_eq!(media.len(), KvlogHeader::ENCODED_LEN);
        let header = KvlogHeader::decode(&media).unwrap();
        assert_eq!(header.seqno, 2);
        assert_eq!(header.gen, 2);
        assert_eq!(header.mdcoid1, 0xC);
        assert_eq!(header.mdcoid2, 0xD);
    }

    #[test]
    fn close_on_detached_handle_is_a_noop() {
        let log = crate::handle::LogHandle::<<MockPool as MlogPool>::Mlog>::detached(
            1,
            1024,
            1,
            1,
            LogConfig::default(),
        );
        assert!(log.close().is_ok());
    }

    #[test]
    fn reserve_on_detached_handle_fails_with_not_open() {
        let log = crate::handle::LogHandle::<<MockPool as MlogPool>::Mlog>::detached(
            1,
            1024,
            1,
            1,
            LogConfig::default(),
        );
        let err = log.reserve(1, false).unwrap_err();
        assert!(matches!(err, crate::error::ReserveError::NotOpen));
    }

    #[test]
    fn txn_issue_appends_single_record() {
        let pool = MockPool::with_staging();
        let log = make_and_open(&pool, 1024 * 1024);

        let txn = TransactionInput {
            seqno: 1,
            gen: 1,
            txn_id: 77,
            kv_seqno: 9,
            mutation: 3,
            command: 1,
            flag: 0,
        };
        log.issue_txn(&txn, true).unwrap();

        let media = pool.snapshot(log.object_id());
        let txn_offset = KvlogHeader::ENCODED_LEN;
        let decoded = crate::record::TxnHeader::decode(&media[txn_offset..]).unwrap();
        assert_eq!(decoded.txn_id, 77);
        assert_eq!(decoded.kv_seqno, 9);
    }

    #[test]
    fn bundles_and_transactions_interleave_without_tearing() {
        use std::sync::Arc;
        use std::thread;

        let pool = Arc::new(MockPool::with_staging());
        let log = Arc::new(make_and_open(&pool, 4 * 1024 * 1024));

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let log = Arc::clone(&log);
            handles.push(thread::spawn(move || {
                let values = [ValueTupleInput {
                    seq: i,
                    extended_len: 1,
                    tombstone: false,
                    bytes: b"v",
                }];
                let keys = [KeyTupleInput {
                    container_id: 1,
                    key: b"k",
                    value_total_len: 1,
                    value_count: 1,
                    values: &values,
                }];
                let bundle = BundleInput {
                    seqno: i,
                    txn_id: 0,
                    gen: 1,
                    mutation: 1,
                    ingest_id: i,
                    min_seq: i,
                    max_seq: i,
                    min_key: b"k",
                    max_key: b"k",
                    keys: &keys,
                };
                log.issue_kvb(&bundle, true).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(log.committed_key_count(), 8);
        assert_eq!(log.committed_value_count(), 8);

        // Walk the media stream and confirm every KVB header is
        // immediately followed by exactly `payload_size` bytes of
        // payload before the next header begins — i.e. no interleaving.
        let media = pool.snapshot(log.object_id());
        let mut offset = KvlogHeader::ENCODED_LEN;
        let mut seen = 0;
        while offset < media.len() {
            let header = KvbHeader::decode(&media[offset..]).unwrap();
            offset += KvbHeader::ENCODED_LEN;
            offset += header.payload_size as usize;
            seen += 1;
        }
        assert_eq!(seen, 8);
        assert_eq!(offset, media.len());
    }
}
