//! Error types surfaced by this crate.
//!
//! Every subsystem boundary gets its own [`snafu`]-derived enum:
//! reservation, bundle issue, transaction issue, and lifecycle each have
//! distinct failure modes, and any failure reported by the underlying
//! media-log provider is preserved as the `source` of the relevant
//! variant rather than being flattened away.

use snafu::Snafu;

/// Opaque error type for failures reported by the media-log provider.
/// The provider is an external collaborator with its own error
/// type; this crate only needs to display and propagate it.
pub type ProviderError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while allocating, committing, or tearing down a
/// log's backing media-log object, or while opening, closing, resetting,
/// or flushing an already-open handle.
#[derive(Debug, Snafu)]
pub enum LifecycleError {
    /// `mlog_alloc` failed; the descriptor was left untouched.
    #[snafu(display("failed to allocate mlog: {source}"))]
    Alloc { source: ProviderError },

    /// `mlog_commit` failed. The allocation was aborted (best-effort)
    /// before this error was returned.
    #[snafu(display("failed to commit mlog: {source}"))]
    Commit { source: ProviderError },

    /// `mlog_abort` failed after an allocation was made but never
    /// committed.
    #[snafu(display("failed to abort mlog allocation: {source}"))]
    Abort { source: ProviderError },

    /// `mlog_delete` failed while destroying a committed log.
    #[snafu(display("failed to delete mlog: {source}"))]
    Delete { source: ProviderError },

    /// `mlog_open` failed while opening a log for ingest.
    #[snafu(display("failed to open mlog: {source}"))]
    Open { source: ProviderError },

    /// `mlog_close` failed. The in-memory handle is freed regardless;
    /// this error is surfaced for diagnostics only.
    #[snafu(display("failed to close mlog: {source}"))]
    Close { source: ProviderError },

    /// `mlog_erase` failed during `reset`.
    #[snafu(display("failed to erase mlog: {source}"))]
    Erase { source: ProviderError },

    /// `mlog_sync` failed during `flush`.
    #[snafu(display("failed to sync mlog: {source}"))]
    Sync { source: ProviderError },

    /// Writing the `KVLOG` format header failed.
    #[snafu(display("failed to write format header: {source}"))]
    FormatHeader { source: ProviderError },

    /// An operation that requires a live mlog handle (reset, flush) was
    /// attempted on a handle that was never opened.
    #[snafu(display("log has no open mlog handle"))]
    NotOpen,
}

/// Errors returned by [`crate::ledger::ReservationLedger::reserve`].
#[derive(Debug, Snafu)]
pub enum ReserveError {
    /// The requested size exceeds the available capacity outright.
    #[snafu(display(
        "reservation of {size} bytes exceeds available capacity of {available} bytes"
    ))]
    NoSpace { size: u64, available: u64 },

    /// The reservation would push either the live mlog length or the
    /// total reserved bytes past the available capacity. Transient:
    /// the caller may retry once outstanding reservations are
    /// resynchronized via `refresh`.
    #[snafu(display(
        "reservation of {size} bytes would exceed available capacity of {available} bytes \
         (live length or reserved total already near the limit)"
    ))]
    OutOfMemory { size: u64, available: u64 },

    /// Querying the live mlog length failed.
    #[snafu(display("failed to query mlog length: {source}"))]
    QueryLength { source: ProviderError },

    /// Reservation was attempted on a handle with no open mlog.
    #[snafu(display("log has no open mlog handle"))]
    NotOpen,
}

/// Errors returned while issuing a key-value bundle.
#[derive(Debug, Snafu)]
pub enum IssueBundleError {
    /// The scratch buffer could not be grown to the size this bundle
    /// requires.
    #[snafu(display("failed to grow scratch buffer to {needed} bytes"))]
    NoMemory { needed: usize },

    /// Walking the bundle's key/value tuples would have overflowed the
    /// precomputed iovec count.
    #[snafu(display(
        "iovec index {index} would overflow the precomputed count of {numiov}"
    ))]
    InvalidArgument { index: usize, numiov: usize },

    /// The bundle's declared key/value aggregates did not match what was
    /// actually walked.
    #[snafu(display(
        "bundle aggregates disagreed with walked tuples: {detail}"
    ))]
    AggregateMismatch { detail: String },

    /// The header or payload append to the mlog failed.
    #[snafu(display("mlog append failed: {source}"))]
    Append { source: ProviderError },

    /// Issue was attempted on a handle with no open mlog.
    #[snafu(display("log has no open mlog handle"))]
    NotOpen,
}

/// Errors returned while issuing a tree-transaction record.
#[derive(Debug, Snafu)]
pub enum IssueTxnError {
    /// The append to the mlog failed.
    #[snafu(display("mlog append failed: {source}"))]
    Append { source: ProviderError },

    /// Issue was attempted on a handle with no open mlog.
    #[snafu(display("log has no open mlog handle"))]
    NotOpen,
}
