//! The media-log provider interface.
//!
//! Everything in this module is a consumed interface: allocation, commit,
//! abort, delete, open, and the per-handle operations (close, erase, sync,
//! len, append) are implemented by the storage pool this crate is embedded
//! in. This crate never implements a real media log itself — it only
//! defines the trait boundary and, for tests, an in-memory stand-in
//! backed by a plain `Vec<u8>`.

use std::io::IoSlice;

use crate::error::ProviderError;

/// Media class a log's backing mlog can be allocated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaClass {
    /// Preferred class for new logs.
    Staging,
    /// Fallback class when the pool has no staging media.
    Capacity,
}

/// Identifies a backing mlog object. Stable across allocate, commit,
/// open, and destroy.
pub type ObjectId = u64;

/// An mlog incarnation counter, returned by `open` and otherwise opaque
/// to this crate.
pub type MlogGeneration = u64;

/// The storage pool that allocates, commits, and deletes mlog objects.
///
/// Allocation is a two-phase affair: an
/// allocation via [`MlogPool::alloc`] is not durable until
/// [`MlogPool::commit`] succeeds, and may be released early via
/// [`MlogPool::abort`].
pub trait MlogPool: Send + Sync {
    /// The live, opened mlog handle type this pool produces.
    type Mlog: Mlog;

    /// Reports whether the given media class is present in this pool.
    fn probe_class(&self, class: MediaClass) -> bool;

    /// Allocates (but does not commit) an mlog of the given capacity in
    /// the given class. Returns the object id and the class actually
    /// used (which may differ if the pool silently substitutes).
    fn alloc(&self, class: MediaClass, capacity: u64) -> Result<(ObjectId, MediaClass), ProviderError>;

    /// Commits a previously allocated mlog, making it durable.
    fn commit(&self, oid: ObjectId) -> Result<(), ProviderError>;

    /// Releases an allocated-but-not-committed mlog.
    fn abort(&self, oid: ObjectId) -> Result<(), ProviderError>;

    /// Deletes a committed mlog.
    fn delete(&self, oid: ObjectId) -> Result<(), ProviderError>;

    /// Opens a committed mlog for ingest, returning its generation and a
    /// live handle.
    fn open(&self, oid: ObjectId) -> Result<(MlogGeneration, Self::Mlog), ProviderError>;
}

/// A live, opened mlog: an append-only, segment-backed byte stream.
///
/// All operations here may block; none are cancellable.
pub trait Mlog: Send + Sync {
    /// Closes the mlog. Errors are reported but do not prevent the
    /// caller from releasing its own in-memory state.
    fn close(&self) -> Result<(), ProviderError>;

    /// Erases the mlog's contents from the given byte offset onward.
    fn erase(&self, offset: u64) -> Result<(), ProviderError>;

    /// Flushes any buffered writes durably to media.
    fn sync(&self) -> Result<(), ProviderError>;

    /// Returns the current length, in bytes, of the mlog.
    fn len(&self) -> Result<u64, ProviderError>;

    /// Appends a gather vector of bytes to the mlog.
    ///
    /// `total_bytes` is the sum of all slice lengths in `iovs`, supplied
    /// separately so implementations that can avoid re-walking the
    /// vector don't have to. `sync` requests a durable (synchronous)
    /// append; when false, the provider may buffer the write.
    ///
    /// Appends are non-retryable: a caller must have reserved enough
    /// space that this call is not expected to fail for lack of
    /// room, because a partial write would leave a torn record.
    fn append(&self, iovs: &[IoSlice<'_>], total_bytes: u64, sync: bool) -> Result<(), ProviderError>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    //! An in-memory [`MlogPool`]/[`Mlog`] pair for exercising this crate
    //! without a real storage pool backing it.

    use std::{
        io::IoSlice,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc, Mutex,
        },
    };

    use super::{MediaClass, Mlog, MlogGeneration, MlogPool, ObjectId};
    use crate::error::ProviderError;

    #[derive(Debug)]
    struct MockObject {
        data: Mutex<Vec<u8>>,
        committed: AtomicBool,
        generation: AtomicU64,
    }

    /// An in-memory storage pool. Every allocated object lives for the
    /// lifetime of the pool; `delete` merely marks it gone.
    #[derive(Debug, Default)]
    pub struct MockPool {
        staging_present: bool,
        next_oid: AtomicU64,
        objects: Mutex<std::collections::HashMap<ObjectId, Arc<MockObject>>>,
    }

    impl MockPool {
        /// Creates a pool that reports a staging media class as present.
        #[must_use]
        pub fn with_staging() -> Self {
            Self {
                staging_present: true,
                next_oid: AtomicU64::new(1),
                objects: Mutex::default(),
            }
        }

        /// Creates a pool with no staging media class, forcing callers
        /// to fall back to the capacity class.
        #[must_use]
        pub fn without_staging() -> Self {
            Self {
                staging_present: false,
                next_oid: AtomicU64::new(1),
                objects: Mutex::default(),
            }
        }

        /// Returns the raw bytes currently stored for `oid`, for test
        /// assertions.
        ///
        /// # Panics
        ///
        /// Panics if `oid` was never allocated from this pool.
        #[must_use]
        pub fn snapshot(&self, oid: ObjectId) -> Vec<u8> {
            let objects = self.objects.lock().unwrap();
            let object = objects.get(&oid).expect("object not allocated");
            object.data.lock().unwrap().clone()
        }
    }

    impl MlogPool for MockPool {
        type Mlog = MockMlog;

        fn probe_class(&self, class: MediaClass) -> bool {
            match class {
                MediaClass::Staging => self.staging_present,
                MediaClass::Capacity => true,
            }
        }

        fn alloc(
            &self,
            class: MediaClass,
            _capacity: u64,
        ) -> Result<(ObjectId, MediaClass), ProviderError> {
            let used_class = if class == MediaClass::Staging && !self.staging_present {
                MediaClass::Capacity
            } else {
                class
            };

            let oid = self.next_oid.fetch_add(1, Ordering::Relaxed);
            self.objects.lock().unwrap().insert(
                oid,
                Arc::new(MockObject {
                    data: Mutex::new(Vec::new()),
                    committed: AtomicBool::new(false),
                    generation: AtomicU64::new(0),
                }),
            );
            Ok((oid, used_class))
        }

        fn commit(&self, oid: ObjectId) -> Result<(), ProviderError> {
            let objects = self.objects.lock().unwrap();
            let object = objects.get(&oid).ok_or("unknown object id")?;
            object.committed.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn abort(&self, oid: ObjectId) -> Result<(), ProviderError> {
            self.objects.lock().unwrap().remove(&oid);
            Ok(())
        }

        fn delete(&self, oid: ObjectId) -> Result<(), ProviderError> {
            self.objects.lock().unwrap().remove(&oid);
            Ok(())
        }

        fn open(&self, oid: ObjectId) -> Result<(MlogGeneration, Self::Mlog), ProviderError> {
            let objects = self.objects.lock().unwrap();
            let object = objects.get(&oid).ok_or("unknown object id")?;
            let generation = object.generation.fetch_add(1, Ordering::Relaxed) + 1;
            Ok((generation, MockMlog { object: Arc::clone(object) }))
        }
    }

    /// A live handle onto a [`MockPool`] object.
    #[derive(Debug)]
    pub struct MockMlog {
        object: Arc<MockObject>,
    }

    impl Mlog for MockMlog {
        fn close(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        fn erase(&self, offset: u64) -> Result<(), ProviderError> {
            let mut data = self.object.data.lock().unwrap();
            data.truncate(offset as usize);
            Ok(())
        }

        fn sync(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        fn len(&self) -> Result<u64, ProviderError> {
            Ok(self.object.data.lock().unwrap().len() as u64)
        }

        fn append(&self, iovs: &[IoSlice<'_>], total_bytes: u64, _sync: bool) -> Result<(), ProviderError> {
            let mut data = self.object.data.lock().unwrap();
            let before = data.len();
            for iov in iovs {
                data.extend_from_slice(iov);
            }
            debug_assert_eq!((data.len() - before) as u64, total_bytes);
            Ok(())
        }
    }
}
