//! On-media record framing.
//!
//! Every record begins with a common header carrying a type tag and the
//! record's declared size. All multi-byte integer fields are big-endian on
//! media; the in-memory form is host-endian. Encoding and decoding go
//! through `bytes`' `BufMut`/`Buf`, whose fixed-width `put_*`/`get_*`
//! methods are already big-endian, which is exactly the wire format this
//! module needs.

use bytes::{Buf, BufMut};
use snafu::Snafu;

use crate::common::{C1_KEY_MAGIC, C1_VAL_MAGIC};

/// Length, in bytes, of the common record header (tag + declared size).
pub const COMMON_HEADER_LEN: usize = 8;

/// Maximum number of bytes of a key stored verbatim in a bundle header's
/// min/max key fields. Longer keys are truncated.
pub const KEY_IMMEDIATE_MAX: usize = 32;

/// Length, in bytes, of an encoded [`KeyImmediate`].
pub const KEY_IMMEDIATE_LEN: usize = 4 + KEY_IMMEDIATE_MAX;

/// Length, in bytes, of an encoded [`KvlogHeader`] body (excluding the
/// common header).
pub const KVLOG_BODY_LEN: usize = 8 * 6;

/// Length, in bytes, of an encoded [`KvbHeader`] body (excluding the
/// common header). Ten `u64` fields (seqno, txn_id, gen, mutation,
/// key_count, cumulative_key_count, payload_size, min_seq, max_seq,
/// ingest_id) plus the two key-immediate fields.
pub const KVB_BODY_LEN: usize = 8 * 10 + KEY_IMMEDIATE_LEN * 2;

/// Length, in bytes, of an encoded [`TxnHeader`] body (excluding the
/// common header).
pub const TXN_BODY_LEN: usize = 8 * 5 + 4 * 2;

/// Length, in bytes, of an encoded key-tuple header.
pub const KEY_TUPLE_HEADER_LEN: usize = 4 + 4 + 4 + 8 + 8;

/// Length, in bytes, of an encoded value-tuple header.
pub const VALUE_TUPLE_HEADER_LEN: usize = 4 + 8 + 8 + 4 + 4;

/// Errors encountered while decoding a record from its on-media bytes.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum DecodeError {
    #[snafu(display("buffer too short: need at least {needed} bytes, have {have}"))]
    TooShort { needed: usize, have: usize },

    #[snafu(display("unrecognized record tag {tag:#010x}"))]
    UnknownTag { tag: u32 },

    #[snafu(display("key-tuple header magic mismatch: expected {C1_KEY_MAGIC:#010x}, got {actual:#010x}"))]
    KeyMagicMismatch { actual: u32 },

    #[snafu(display("value-tuple header magic mismatch: expected {C1_VAL_MAGIC:#010x}, got {actual:#010x}"))]
    ValueMagicMismatch { actual: u32 },
}

/// The type tag carried by every record's common header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum RecordTag {
    /// Log-format record, written once per incarnation.
    Kvlog = 0x4B56_4C47, // "KVLG"
    /// Key-value bundle record.
    Kvb = 0x4B56_4200, // "KVB\0"
    /// Tree-transaction record.
    Txn = 0x5458_4E00, // "TXN\0"
}

impl RecordTag {
    fn from_u32(tag: u32) -> Result<Self, DecodeError> {
        match tag {
            x if x == RecordTag::Kvlog as u32 => Ok(RecordTag::Kvlog),
            x if x == RecordTag::Kvb as u32 => Ok(RecordTag::Kvb),
            x if x == RecordTag::Txn as u32 => Ok(RecordTag::Txn),
            tag => Err(DecodeError::UnknownTag { tag }),
        }
    }
}

/// How a value tuple's bytes are stored relative to the record stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum LogType {
    /// Value bytes are written inline in the mlog stream. The only
    /// variant this core ever produces.
    Mlog = 1,
}

impl LogType {
    fn from_u32(v: u32) -> Self {
        // This core only ever writes `Mlog`; an out-of-line split is a
        // collaborator concern (VLB) outside this crate's scope.
        debug_assert_eq!(v, LogType::Mlog as u32);
        LogType::Mlog
    }
}

/// Writes the common record header (tag + declared size) to `buf`.
pub fn encode_common_header(buf: &mut impl BufMut, tag: RecordTag, size: u32) {
    buf.put_u32(tag as u32);
    buf.put_u32(size);
}

/// Decodes the common record header from the front of `buf`.
pub fn decode_common_header(mut buf: &[u8]) -> Result<(RecordTag, u32), DecodeError> {
    if buf.len() < COMMON_HEADER_LEN {
        return Err(DecodeError::TooShort {
            needed: COMMON_HEADER_LEN,
            have: buf.len(),
        });
    }
    let tag = RecordTag::from_u32(buf.get_u32())?;
    let size = buf.get_u32();
    Ok((tag, size))
}

/// The `KVLOG` format header: the first record written after a log's
/// backing mlog is committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KvlogHeader {
    pub mdcoid1: u64,
    pub mdcoid2: u64,
    pub oid: u64,
    pub gen: u64,
    pub capacity: u64,
    pub seqno: u64,
}

impl KvlogHeader {
    /// Total on-media size of this record, including the common header.
    pub const ENCODED_LEN: usize = COMMON_HEADER_LEN + KVLOG_BODY_LEN;

    pub fn encode(&self, buf: &mut impl BufMut) {
        encode_common_header(buf, RecordTag::Kvlog, Self::ENCODED_LEN as u32);
        buf.put_u64(self.mdcoid1);
        buf.put_u64(self.mdcoid2);
        buf.put_u64(self.oid);
        buf.put_u64(self.gen);
        buf.put_u64(self.capacity);
        buf.put_u64(self.seqno);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(DecodeError::TooShort {
                needed: Self::ENCODED_LEN,
                have: buf.len(),
            });
        }
        let (tag, _size) = decode_common_header(buf)?;
        if tag != RecordTag::Kvlog {
            return Err(DecodeError::UnknownTag { tag: tag as u32 });
        }
        let mut body = &buf[COMMON_HEADER_LEN..];
        Ok(Self {
            mdcoid1: body.get_u64(),
            mdcoid2: body.get_u64(),
            oid: body.get_u64(),
            gen: body.get_u64(),
            capacity: body.get_u64(),
            seqno: body.get_u64(),
        })
    }
}

/// A key, truncated to [`KEY_IMMEDIATE_MAX`] bytes, stored inline in a
/// bundle header for the min/max key fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyImmediate {
    len: u32,
    bytes: [u8; KEY_IMMEDIATE_MAX],
}

impl KeyImmediate {
    #[must_use]
    pub fn from_key(key: &[u8]) -> Self {
        let len = key.len().min(KEY_IMMEDIATE_MAX);
        let mut bytes = [0u8; KEY_IMMEDIATE_MAX];
        bytes[..len].copy_from_slice(&key[..len]);
        Self {
            len: len as u32,
            bytes,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.len);
        buf.put_slice(&self.bytes);
    }

    fn decode(buf: &mut &[u8]) -> Self {
        let len = buf.get_u32();
        let mut bytes = [0u8; KEY_IMMEDIATE_MAX];
        bytes.copy_from_slice(&buf[..KEY_IMMEDIATE_MAX]);
        buf.advance(KEY_IMMEDIATE_MAX);
        Self { len, bytes }
    }
}

/// The `KVB` bundle header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KvbHeader {
    pub seqno: u64,
    pub txn_id: u64,
    pub gen: u64,
    pub mutation: u64,
    pub key_count: u64,
    pub cumulative_key_count: u64,
    pub payload_size: u64,
    pub min_seq: u64,
    pub max_seq: u64,
    pub min_key: KeyImmediate,
    pub max_key: KeyImmediate,
    pub ingest_id: u64,
}

impl KvbHeader {
    pub const ENCODED_LEN: usize = COMMON_HEADER_LEN + KVB_BODY_LEN;

    pub fn encode(&self, buf: &mut impl BufMut) {
        encode_common_header(buf, RecordTag::Kvb, Self::ENCODED_LEN as u32);
        buf.put_u64(self.seqno);
        buf.put_u64(self.txn_id);
        buf.put_u64(self.gen);
        buf.put_u64(self.mutation);
        buf.put_u64(self.key_count);
        buf.put_u64(self.cumulative_key_count);
        buf.put_u64(self.payload_size);
        buf.put_u64(self.min_seq);
        buf.put_u64(self.max_seq);
        self.min_key.encode(buf);
        self.max_key.encode(buf);
        buf.put_u64(self.ingest_id);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(DecodeError::TooShort {
                needed: Self::ENCODED_LEN,
                have: buf.len(),
            });
        }
        let (tag, _size) = decode_common_header(buf)?;
        if tag != RecordTag::Kvb {
            return Err(DecodeError::UnknownTag { tag: tag as u32 });
        }
        let mut body = &buf[COMMON_HEADER_LEN..];
        Ok(Self {
            seqno: body.get_u64(),
            txn_id: body.get_u64(),
            gen: body.get_u64(),
            mutation: body.get_u64(),
            key_count: body.get_u64(),
            cumulative_key_count: body.get_u64(),
            payload_size: body.get_u64(),
            min_seq: body.get_u64(),
            max_seq: body.get_u64(),
            min_key: KeyImmediate::decode(&mut body),
            max_key: KeyImmediate::decode(&mut body),
            ingest_id: body.get_u64(),
        })
    }
}

/// The `TXN` transaction header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxnHeader {
    pub seqno: u64,
    pub gen: u64,
    pub txn_id: u64,
    pub kv_seqno: u64,
    pub mutation: u64,
    pub command: u32,
    pub flag: u32,
}

impl TxnHeader {
    pub const ENCODED_LEN: usize = COMMON_HEADER_LEN + TXN_BODY_LEN;

    pub fn encode(&self, buf: &mut impl BufMut) {
        encode_common_header(buf, RecordTag::Txn, Self::ENCODED_LEN as u32);
        buf.put_u64(self.seqno);
        buf.put_u64(self.gen);
        buf.put_u64(self.txn_id);
        buf.put_u64(self.kv_seqno);
        buf.put_u64(self.mutation);
        buf.put_u32(self.command);
        buf.put_u32(self.flag);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(DecodeError::TooShort {
                needed: Self::ENCODED_LEN,
                have: buf.len(),
            });
        }
        let (tag, _size) = decode_common_header(buf)?;
        if tag != RecordTag::Txn {
            return Err(DecodeError::UnknownTag { tag: tag as u32 });
        }
        let mut body = &buf[COMMON_HEADER_LEN..];
        Ok(Self {
            seqno: body.get_u64(),
            gen: body.get_u64(),
            txn_id: body.get_u64(),
            kv_seqno: body.get_u64(),
            mutation: body.get_u64(),
            command: body.get_u32(),
            flag: body.get_u32(),
        })
    }
}

/// A key-tuple header, framed immediately before a key's bytes in a
/// bundle's payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyTupleHeader {
    pub key_len: u32,
    pub container_id: u32,
    pub value_total_len: u64,
    pub value_count: u64,
}

impl KeyTupleHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(C1_KEY_MAGIC);
        buf.put_u32(self.key_len);
        buf.put_u32(self.container_id);
        buf.put_u64(self.value_total_len);
        buf.put_u64(self.value_count);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < KEY_TUPLE_HEADER_LEN {
            return Err(DecodeError::TooShort {
                needed: KEY_TUPLE_HEADER_LEN,
                have: buf.len(),
            });
        }
        let mut body = buf;
        let magic = body.get_u32();
        if magic != C1_KEY_MAGIC {
            return Err(DecodeError::KeyMagicMismatch { actual: magic });
        }
        Ok(Self {
            key_len: body.get_u32(),
            container_id: body.get_u32(),
            value_total_len: body.get_u64(),
            value_count: body.get_u64(),
        })
    }
}

/// A value-tuple header, framed immediately before a value's bytes in a
/// bundle's payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueTupleHeader {
    pub seq: u64,
    pub extended_len: u64,
    pub tombstone: bool,
    pub logtype: LogType,
}

impl ValueTupleHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(C1_VAL_MAGIC);
        buf.put_u64(self.seq);
        buf.put_u64(self.extended_len);
        buf.put_u32(u32::from(self.tombstone));
        buf.put_u32(self.logtype as u32);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < VALUE_TUPLE_HEADER_LEN {
            return Err(DecodeError::TooShort {
                needed: VALUE_TUPLE_HEADER_LEN,
                have: buf.len(),
            });
        }
        let mut body = buf;
        let magic = body.get_u32();
        if magic != C1_VAL_MAGIC {
            return Err(DecodeError::ValueMagicMismatch { actual: magic });
        }
        let seq = body.get_u64();
        let extended_len = body.get_u64();
        let tombstone = body.get_u32() != 0;
        let logtype = LogType::from_u32(body.get_u32());
        Ok(Self {
            seq,
            extended_len,
            tombstone,
            logtype,
        })
    }
}
