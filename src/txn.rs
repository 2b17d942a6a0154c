//! Tree-transaction descriptor and serializer.
//!
//! Unlike a bundle, a transaction record has no scratch buffer and no
//! reservation interaction: it is a single fixed-size record built
//! directly and appended under the ingest mutex.

use std::io::IoSlice;

use bytes::BytesMut;

use crate::record::TxnHeader;

/// A tree-transaction record to be journaled.
#[derive(Clone, Copy, Debug)]
pub struct TransactionInput {
    pub seqno: u64,
    pub gen: u64,
    pub txn_id: u64,
    pub kv_seqno: u64,
    pub mutation: u64,
    pub command: u32,
    pub flag: u32,
}

impl TransactionInput {
    fn header(&self) -> TxnHeader {
        TxnHeader {
            seqno: self.seqno,
            gen: self.gen,
            txn_id: self.txn_id,
            kv_seqno: self.kv_seqno,
            mutation: self.mutation,
            command: self.command,
            flag: self.flag,
        }
    }

    /// Encodes this descriptor into its on-media record bytes.
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(TxnHeader::ENCODED_LEN);
        self.header().encode(&mut buf);
        buf
    }
}

/// Builds the single-iovec gather vector for a transaction record.
#[must_use]
pub fn build_payload(encoded: &[u8]) -> [IoSlice<'_>; 1] {
    [IoSlice::new(encoded)]
}
