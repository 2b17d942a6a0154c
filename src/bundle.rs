//! Bundle input types and the scratch-buffer serializer.
//!
//! [`BundleInput`] is borrowed for the duration of a single issue call: the
//! log never clones a caller's key or value bytes, it only gathers them by
//! reference into the append vector built by [`build_payload`]. The actual
//! mutex-guarded, two-append emit lives on [`crate::handle::LogHandle`];
//! this module only builds the wire image.

use std::io::IoSlice;

use snafu::ensure;

use crate::common::{align16, round_up_to, KEY_IOVS, VAL_IOVS};
use crate::error::{AggregateMismatchSnafu, InvalidArgumentSnafu, IssueBundleError};
use crate::record::{KeyTupleHeader, ValueTupleHeader, KEY_TUPLE_HEADER_LEN, VALUE_TUPLE_HEADER_LEN};

/// One value belonging to a [`KeyTupleInput`].
#[derive(Clone, Copy, Debug)]
pub struct ValueTupleInput<'a> {
    pub seq: u64,
    /// Declared total length of this value. This core always writes
    /// values inline, so in practice this equals `bytes.len()`; the field
    /// stays a separate `u64` because it is sized for a future inline /
    /// out-of-line split.
    pub extended_len: u64,
    pub tombstone: bool,
    pub bytes: &'a [u8],
}

/// One key belonging to a [`BundleInput`], with its list of values.
///
/// `value_count` and `value_total_len` are the *declared* aggregates for
/// this key, checked against what `values` actually walks to — they are
/// not derived from `values.len()`. A mismatch is how the "vtacount off
/// by one" boundary case is expressed: the scratch buffer is sized
/// from the declared count, so an actual walk that overruns it fails with
/// [`IssueBundleError::InvalidArgument`], and a walk that undershoots it
/// fails with [`IssueBundleError::AggregateMismatch`].
#[derive(Clone, Copy, Debug)]
pub struct KeyTupleInput<'a> {
    pub container_id: u32,
    pub key: &'a [u8],
    pub value_total_len: u64,
    pub value_count: u64,
    pub values: &'a [ValueTupleInput<'a>],
}

/// A key-value bundle to be journaled atomically.
#[derive(Clone, Copy, Debug)]
pub struct BundleInput<'a> {
    pub seqno: u64,
    pub txn_id: u64,
    pub gen: u64,
    pub mutation: u64,
    pub ingest_id: u64,
    pub min_seq: u64,
    pub max_seq: u64,
    pub min_key: &'a [u8],
    pub max_key: &'a [u8],
    pub keys: &'a [KeyTupleInput<'a>],
}

impl<'a> BundleInput<'a> {
    /// Declared key count: one key tuple per entry in `keys`.
    #[must_use]
    pub fn key_count(&self) -> u64 {
        self.keys.len() as u64
    }

    /// Declared value count: the sum of each key's declared
    /// `value_count`, not the sum of `values.len()`.
    #[must_use]
    pub fn value_count(&self) -> u64 {
        self.keys.iter().map(|k| k.value_count).sum()
    }
}

/// The outcome of [`build_payload`]: a gather vector ready to append and
/// the total byte size it covers.
pub struct BuiltPayload<'a> {
    pub iovs: Vec<IoSlice<'a>>,
    pub payload_size: u64,
}

/// Ensures `scratch` is at least `required` bytes, growing it in
/// `growth_unit` increments, and reports whether this call grew the
/// buffer past `soft_ceiling` (the caller releases it afterward in that
/// case).
///
/// Returns [`IssueBundleError::NoMemory`] if the buffer cannot be grown.
fn ensure_scratch_capacity(
    scratch: &mut Vec<u8>,
    required: usize,
    growth_unit: usize,
    soft_ceiling: usize,
) -> Result<bool, IssueBundleError> {
    if scratch.capacity() < required {
        let target = round_up_to(required, growth_unit);
        let additional = target.saturating_sub(scratch.len());
        if scratch.try_reserve_exact(additional).is_err() {
            *scratch = Vec::new();
            return Err(IssueBundleError::NoMemory { needed: target });
        }
    }
    scratch.resize(required, 0);
    Ok(required > soft_ceiling)
}

/// Builds the on-media payload for `bundle` into `scratch`, validating the
/// declared per-key aggregates against what is actually walked.
///
/// `scratch` is grown as needed and left
/// sized to exactly the bytes this bundle needs; the caller decides
/// whether to shrink it back down afterward based on the returned
/// `grew_past_ceiling` flag.
///
/// Unlike the layout this is ported from, the returned iovecs do not
/// include a third "iovec array" scratch region: `Vec<IoSlice>` is its
/// own heap allocation in safe Rust, so only the value-header and
/// key-header regions are backed by `scratch`.
pub fn build_payload<'a>(
    scratch: &'a mut Vec<u8>,
    growth_unit: usize,
    soft_ceiling: usize,
    bundle: &BundleInput<'a>,
) -> Result<(BuiltPayload<'a>, bool), IssueBundleError> {
    let key_count = bundle.key_count() as usize;
    let value_count = bundle.value_count() as usize;

    let vtsz = align16(value_count * VALUE_TUPLE_HEADER_LEN);
    let ktsz = align16(key_count * KEY_TUPLE_HEADER_LEN);
    let required = vtsz + ktsz;
    let numiov = key_count * KEY_IOVS + value_count * VAL_IOVS;

    let grew_past_ceiling = ensure_scratch_capacity(scratch, required, growth_unit, soft_ceiling)?;

    // First pass: write every header into its slot and validate the
    // declared aggregates, without yet building iovecs (that would
    // require an immutable borrow of `scratch` while we still need to
    // write into it).
    let mut iov_index = 0usize;
    let mut value_cursor = 0usize;
    let mut payload_size = 0u64;
    let mut offsets = Vec::with_capacity(key_count);

    for (key_index, key) in bundle.keys.iter().enumerate() {
        let kt_offset = vtsz + key_index * KEY_TUPLE_HEADER_LEN;

        ensure!(
            iov_index + KEY_IOVS <= numiov,
            InvalidArgumentSnafu {
                index: iov_index,
                numiov,
            }
        );
        let header = KeyTupleHeader {
            key_len: key.key.len() as u32,
            container_id: key.container_id,
            value_total_len: key.value_total_len,
            value_count: key.value_count,
        };
        let mut dst = &mut scratch[kt_offset..kt_offset + KEY_TUPLE_HEADER_LEN];
        header.encode(&mut dst);
        iov_index += KEY_IOVS;
        payload_size += KEY_TUPLE_HEADER_LEN as u64 + key.key.len() as u64;

        let mut residual_count = key.value_count;
        let mut residual_len = key.value_total_len;
        let mut value_offsets = Vec::with_capacity(key.values.len());

        for value in key.values {
            ensure!(
                value.seq >= bundle.min_seq && value.seq <= bundle.max_seq,
                AggregateMismatchSnafu {
                    detail: format!(
                        "value seq {} outside bundle range [{}, {}]",
                        value.seq, bundle.min_seq, bundle.max_seq
                    ),
                }
            );
            ensure!(
                value_cursor < value_count,
                InvalidArgumentSnafu {
                    index: iov_index,
                    numiov,
                }
            );
            ensure!(
                iov_index + VAL_IOVS <= numiov,
                InvalidArgumentSnafu {
                    index: iov_index,
                    numiov,
                }
            );

            let vt_offset = value_cursor * VALUE_TUPLE_HEADER_LEN;
            let header = ValueTupleHeader {
                seq: value.seq,
                extended_len: value.extended_len,
                tombstone: value.tombstone,
                logtype: crate::record::LogType::Mlog,
            };
            let mut dst = &mut scratch[vt_offset..vt_offset + VALUE_TUPLE_HEADER_LEN];
            header.encode(&mut dst);
            iov_index += VAL_IOVS;
            payload_size += VALUE_TUPLE_HEADER_LEN as u64 + value.bytes.len() as u64;
            value_offsets.push(vt_offset);
            value_cursor += 1;

            residual_count = residual_count.checked_sub(1).ok_or_else(|| {
                IssueBundleError::AggregateMismatch {
                    detail: format!("key {key_index}: more values walked than declared value_count"),
                }
            })?;
            residual_len = residual_len.checked_sub(value.extended_len).ok_or_else(|| {
                IssueBundleError::AggregateMismatch {
                    detail: format!("key {key_index}: walked value length exceeds declared value_total_len"),
                }
            })?;
        }

        ensure!(
            residual_count == 0 && residual_len == 0,
            AggregateMismatchSnafu {
                detail: format!(
                    "key {key_index}: declared value_count/value_total_len did not reach zero \
                     (residual_count={residual_count}, residual_len={residual_len})"
                ),
            }
        );

        offsets.push((kt_offset, value_offsets));
    }

    // Second pass: the header bytes are final, so we can now reborrow
    // `scratch` immutably and build the gather vector against it.
    let mut iovs = Vec::with_capacity(numiov);
    let scratch_ref: &'a [u8] = &scratch[..];
    for (key, (kt_offset, value_offsets)) in bundle.keys.iter().zip(offsets.iter()) {
        iovs.push(IoSlice::new(&scratch_ref[*kt_offset..*kt_offset + KEY_TUPLE_HEADER_LEN]));
        iovs.push(IoSlice::new(key.key));
        for (value, vt_offset) in key.values.iter().zip(value_offsets.iter()) {
            iovs.push(IoSlice::new(&scratch_ref[*vt_offset..*vt_offset + VALUE_TUPLE_HEADER_LEN]));
            iovs.push(IoSlice::new(value.bytes));
        }
    }

    Ok((BuiltPayload { iovs, payload_size }, grew_past_ceiling))
}
