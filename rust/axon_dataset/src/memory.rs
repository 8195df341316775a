//! Memory pools and reservation listeners
//!
//! Native memory held on behalf of the host is accounted through a
//! [`MemoryPool`]. The process default pool only counts bytes. A
//! [`ReservationListenableMemoryPool`] additionally asks a
//! [`ReservationListener`] before every allocation and tells it after every
//! free, which lets host-side policy track or veto native memory use.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;

use crate::error::{DatasetError, Result};

/// Allocation statistics tracked using atomic operations
#[derive(Debug, Default)]
pub struct AllocationStats {
    pub total_allocations: AtomicU64,
    pub total_deallocations: AtomicU64,
    pub total_bytes_allocated: AtomicI64,
    pub current_bytes: AtomicI64,
    pub peak_bytes: AtomicI64,
}

impl AllocationStats {
    pub const fn new() -> Self {
        Self {
            total_allocations: AtomicU64::new(0),
            total_deallocations: AtomicU64::new(0),
            total_bytes_allocated: AtomicI64::new(0),
            current_bytes: AtomicI64::new(0),
            peak_bytes: AtomicI64::new(0),
        }
    }

    pub fn record_allocation(&self, size: i64) {
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_allocated.fetch_add(size, Ordering::Relaxed);
        let prev = self.current_bytes.fetch_add(size, Ordering::AcqRel);
        self.peak_bytes.fetch_max(prev + size, Ordering::Relaxed);
    }

    /// Fails without touching the counters if `size` exceeds what is held
    pub fn record_deallocation(&self, size: i64) -> Result<()> {
        self.current_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current >= size).then(|| current - size)
            })
            .map_err(|current| {
                DatasetError::InvalidArgument(format!(
                    "cannot free {} bytes, only {} allocated",
                    size, current
                ))
            })?;
        self.total_deallocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn check_size(size: i64) -> Result<()> {
    if size < 0 {
        return Err(DatasetError::InvalidArgument(format!(
            "negative allocation size: {}",
            size
        )));
    }
    Ok(())
}

/// Native allocation arena accounting
///
/// Implementations must be thread-safe: the same pool may back several scans
/// running on different threads at once.
pub trait MemoryPool: Send + Sync {
    /// Account for `size` new bytes, or fail without accounting anything
    fn allocate(&self, size: i64) -> Result<()>;

    /// Give back `size` bytes previously allocated from this pool
    fn free(&self, size: i64) -> Result<()>;

    fn bytes_allocated(&self) -> i64;

    /// Peak of [`bytes_allocated`](Self::bytes_allocated)
    fn max_memory(&self) -> i64;

    fn total_bytes_allocated(&self) -> i64;

    fn backend_name(&self) -> &'static str;
}

impl fmt::Debug for dyn MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("backend", &self.backend_name())
            .field("bytes_allocated", &self.bytes_allocated())
            .finish()
    }
}

/// Counting pool backing the process default
#[derive(Debug, Default)]
pub struct SystemMemoryPool {
    stats: AllocationStats,
}

impl SystemMemoryPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryPool for SystemMemoryPool {
    fn allocate(&self, size: i64) -> Result<()> {
        check_size(size)?;
        self.stats.record_allocation(size);
        Ok(())
    }

    fn free(&self, size: i64) -> Result<()> {
        check_size(size)?;
        self.stats.record_deallocation(size)
    }

    fn bytes_allocated(&self) -> i64 {
        self.stats.current_bytes.load(Ordering::Acquire)
    }

    fn max_memory(&self) -> i64 {
        self.stats.peak_bytes.load(Ordering::Relaxed)
    }

    fn total_bytes_allocated(&self) -> i64 {
        self.stats.total_bytes_allocated.load(Ordering::Relaxed)
    }

    fn backend_name(&self) -> &'static str {
        "system"
    }
}

static DEFAULT_POOL: Lazy<Arc<SystemMemoryPool>> = Lazy::new(|| Arc::new(SystemMemoryPool::new()));

/// The process-wide default pool; it lives as long as the process
pub fn default_memory_pool() -> Arc<dyn MemoryPool> {
    DEFAULT_POOL.clone()
}

/// Host-side policy consulted on every reservation and release
pub trait ReservationListener: Send + Sync {
    /// Called before `size` bytes are allocated; an error vetoes the allocation
    fn on_reservation(&self, size: i64) -> Result<()>;

    /// Called when `size` previously reserved bytes are given back
    fn on_release(&self, size: i64) -> Result<()>;
}

#[derive(Debug, Default)]
struct BlockBook {
    used: i64,
    reserved: i64,
}

/// Pool that forwards every allocation and free to a [`ReservationListener`]
///
/// With the default block size of 1 the listener sees the exact sizes and no
/// lock is taken. With a larger block size reservations are rounded up to
/// whole blocks; the block bookkeeping is serialized, but the listener is
/// always called with the lock released, so it may use the pool itself.
pub struct ReservationListenableMemoryPool {
    inner: Arc<dyn MemoryPool>,
    listener: Arc<dyn ReservationListener>,
    block_size: i64,
    blocks: Mutex<BlockBook>,
    stats: AllocationStats,
}

impl ReservationListenableMemoryPool {
    pub fn new(inner: Arc<dyn MemoryPool>, listener: Arc<dyn ReservationListener>) -> Self {
        Self::with_block_size(inner, listener, 1)
    }

    pub fn with_block_size(
        inner: Arc<dyn MemoryPool>,
        listener: Arc<dyn ReservationListener>,
        block_size: i64,
    ) -> Self {
        Self {
            inner,
            listener,
            block_size: block_size.max(1),
            blocks: Mutex::new(BlockBook::default()),
            stats: AllocationStats::new(),
        }
    }

    pub fn listener(&self) -> &Arc<dyn ReservationListener> {
        &self.listener
    }

    /// Bytes currently reserved from the listener
    pub fn bytes_reserved(&self) -> i64 {
        if self.block_size == 1 {
            self.bytes_allocated()
        } else {
            self.lock_blocks().reserved
        }
    }

    fn lock_blocks(&self) -> MutexGuard<'_, BlockBook> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn round_up(&self, bytes: i64) -> i64 {
        (bytes + self.block_size - 1) / self.block_size * self.block_size
    }

    fn reserve(&self, size: i64) -> Result<()> {
        if self.block_size == 1 {
            return self.listener.on_reservation(size);
        }
        // Blocks are booked before the listener runs, with the lock released.
        let delta = {
            let mut book = self.lock_blocks();
            book.used += size;
            let delta = (self.round_up(book.used) - book.reserved).max(0);
            book.reserved += delta;
            delta
        };
        if delta == 0 {
            return Ok(());
        }
        if let Err(err) = self.listener.on_reservation(delta) {
            let mut book = self.lock_blocks();
            book.used = (book.used - size).max(0);
            book.reserved -= delta;
            return Err(err);
        }
        Ok(())
    }

    fn unreserve(&self, size: i64) -> Result<()> {
        if self.block_size == 1 {
            return self.listener.on_release(size);
        }
        let delta = {
            let mut book = self.lock_blocks();
            book.used = (book.used - size).max(0);
            let delta = (book.reserved - self.round_up(book.used)).max(0);
            book.reserved -= delta;
            delta
        };
        if delta == 0 {
            return Ok(());
        }
        self.listener.on_release(delta)
    }
}

impl MemoryPool for ReservationListenableMemoryPool {
    fn allocate(&self, size: i64) -> Result<()> {
        check_size(size)?;
        if size == 0 {
            return Ok(());
        }
        self.reserve(size)?;
        if let Err(err) = self.inner.allocate(size) {
            if let Err(release_err) = self.unreserve(size) {
                log::warn!(
                    "failed to return {} reserved bytes after allocation failure: {}",
                    size,
                    release_err
                );
            }
            return Err(err);
        }
        self.stats.record_allocation(size);
        Ok(())
    }

    fn free(&self, size: i64) -> Result<()> {
        check_size(size)?;
        if size == 0 {
            return Ok(());
        }
        self.stats.record_deallocation(size)?;
        // The listener hears about the release first, but the inner pool is
        // freed regardless of what the listener says.
        let released = self.unreserve(size);
        self.inner.free(size)?;
        released
    }

    fn bytes_allocated(&self) -> i64 {
        self.stats.current_bytes.load(Ordering::Acquire)
    }

    fn max_memory(&self) -> i64 {
        self.stats.peak_bytes.load(Ordering::Relaxed)
    }

    fn total_bytes_allocated(&self) -> i64 {
        self.stats.total_bytes_allocated.load(Ordering::Relaxed)
    }

    fn backend_name(&self) -> &'static str {
        "listenable"
    }
}

/// RAII reservation that gives its bytes back to the pool on drop
pub struct MemoryReservation {
    pool: Arc<dyn MemoryPool>,
    size: i64,
}

impl MemoryReservation {
    pub fn try_new(pool: Arc<dyn MemoryPool>, size: i64) -> Result<Self> {
        pool.allocate(size)?;
        Ok(Self { pool, size })
    }

    pub fn size(&self) -> i64 {
        self.size
    }
}

impl fmt::Debug for MemoryReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryReservation")
            .field("backend", &self.pool.backend_name())
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if self.size > 0 {
            if let Err(err) = self.pool.free(self.size) {
                log::warn!("failed to release {} bytes: {}", self.size, err);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{OnceLock, Weak};
    use std::thread;

    /// Listener that records every call and can be told to reject
    #[derive(Default)]
    pub(crate) struct RecordingListener {
        pub reserved: AtomicI64,
        pub released: AtomicI64,
        pub reservation_calls: AtomicU64,
        pub reject: AtomicBool,
    }

    impl ReservationListener for RecordingListener {
        fn on_reservation(&self, size: i64) -> Result<()> {
            self.reservation_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject.load(Ordering::SeqCst) {
                return Err(DatasetError::HostRejected("over budget".to_string()));
            }
            self.reserved.fetch_add(size, Ordering::SeqCst);
            Ok(())
        }

        fn on_release(&self, size: i64) -> Result<()> {
            self.released.fetch_add(size, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingPool;

    impl MemoryPool for FailingPool {
        fn allocate(&self, _size: i64) -> Result<()> {
            Err(DatasetError::IoError("out of memory".to_string()))
        }
        fn free(&self, _size: i64) -> Result<()> {
            Ok(())
        }
        fn bytes_allocated(&self) -> i64 {
            0
        }
        fn max_memory(&self) -> i64 {
            0
        }
        fn total_bytes_allocated(&self) -> i64 {
            0
        }
        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    fn listenable(listener: &Arc<RecordingListener>) -> ReservationListenableMemoryPool {
        ReservationListenableMemoryPool::new(
            Arc::new(SystemMemoryPool::new()),
            Arc::clone(listener) as Arc<dyn ReservationListener>,
        )
    }

    // ==========================================================================
    // System Pool Tests
    // ==========================================================================

    #[test]
    fn test_system_pool_counts() {
        let pool = SystemMemoryPool::new();
        pool.allocate(100).unwrap();
        pool.allocate(50).unwrap();
        assert_eq!(pool.bytes_allocated(), 150);
        pool.free(100).unwrap();
        assert_eq!(pool.bytes_allocated(), 50);
        assert_eq!(pool.max_memory(), 150);
        assert_eq!(pool.total_bytes_allocated(), 150);
    }

    #[test]
    fn test_system_pool_zero_allocation() {
        let pool = SystemMemoryPool::new();
        pool.allocate(0).unwrap();
        assert_eq!(pool.bytes_allocated(), 0);
    }

    #[test]
    fn test_system_pool_rejects_overfree_and_negative() {
        let pool = SystemMemoryPool::new();
        pool.allocate(10).unwrap();
        assert!(pool.free(11).is_err());
        assert!(pool.allocate(-1).is_err());
        assert_eq!(pool.bytes_allocated(), 10);
    }

    #[test]
    fn test_default_pool_is_singleton() {
        let a = default_memory_pool();
        let b = default_memory_pool();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.backend_name(), "system");
    }

    // ==========================================================================
    // Listenable Pool Tests
    // ==========================================================================

    #[test]
    fn test_reservation_balance() {
        let listener = Arc::new(RecordingListener::default());
        let pool = listenable(&listener);
        let sizes = [64i64, 1, 4096, 300, 7];

        for size in sizes {
            pool.allocate(size).unwrap();
        }
        let total: i64 = sizes.iter().sum();
        assert_eq!(listener.reserved.load(Ordering::SeqCst), total);
        assert_eq!(pool.bytes_allocated(), total);
        assert_eq!(pool.max_memory(), total);

        // Release in a different order
        for size in [300i64, 64, 7, 4096, 1] {
            pool.free(size).unwrap();
        }
        assert_eq!(listener.released.load(Ordering::SeqCst), total);
        assert_eq!(pool.bytes_allocated(), 0);
        assert_eq!(pool.max_memory(), total);
    }

    #[test]
    fn test_rejected_reservation_fails_allocation() {
        let listener = Arc::new(RecordingListener::default());
        listener.reject.store(true, Ordering::SeqCst);
        let pool = listenable(&listener);

        match pool.allocate(128) {
            Err(DatasetError::HostRejected(msg)) => assert!(msg.contains("over budget")),
            other => panic!("Expected HostRejected, got {:?}", other),
        }
        assert_eq!(pool.bytes_allocated(), 0);
        assert_eq!(listener.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_inner_failure_returns_reservation() {
        let listener = Arc::new(RecordingListener::default());
        let pool = ReservationListenableMemoryPool::new(
            Arc::new(FailingPool),
            Arc::clone(&listener) as Arc<dyn ReservationListener>,
        );

        assert!(pool.allocate(256).is_err());
        assert_eq!(listener.reserved.load(Ordering::SeqCst), 256);
        assert_eq!(listener.released.load(Ordering::SeqCst), 256);
        assert_eq!(pool.bytes_allocated(), 0);
    }

    #[test]
    fn test_zero_size_skips_listener() {
        let listener = Arc::new(RecordingListener::default());
        let pool = listenable(&listener);
        pool.allocate(0).unwrap();
        pool.free(0).unwrap();
        assert_eq!(listener.reservation_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_overfree_does_not_reach_listener() {
        let listener = Arc::new(RecordingListener::default());
        let pool = listenable(&listener);
        pool.allocate(10).unwrap();
        assert!(pool.free(20).is_err());
        assert_eq!(listener.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_block_rounding() {
        let listener = Arc::new(RecordingListener::default());
        let pool = ReservationListenableMemoryPool::with_block_size(
            Arc::new(SystemMemoryPool::new()),
            Arc::clone(&listener) as Arc<dyn ReservationListener>,
            1024,
        );

        pool.allocate(100).unwrap();
        assert_eq!(listener.reserved.load(Ordering::SeqCst), 1024);
        pool.allocate(900).unwrap();
        // Still fits in the first block
        assert_eq!(listener.reservation_calls.load(Ordering::SeqCst), 1);
        pool.allocate(100).unwrap();
        assert_eq!(listener.reserved.load(Ordering::SeqCst), 2048);
        assert_eq!(pool.bytes_reserved(), 2048);

        pool.free(900).unwrap();
        pool.free(100).unwrap();
        pool.free(100).unwrap();
        assert_eq!(listener.released.load(Ordering::SeqCst), 2048);
        assert_eq!(pool.bytes_reserved(), 0);
    }

    /// Listener that allocates from its own pool on the first reservation
    #[derive(Default)]
    struct ReentrantListener {
        pool: OnceLock<Weak<ReservationListenableMemoryPool>>,
        entered: AtomicBool,
        reserved: AtomicI64,
        released: AtomicI64,
    }

    impl ReservationListener for ReentrantListener {
        fn on_reservation(&self, size: i64) -> Result<()> {
            self.reserved.fetch_add(size, Ordering::SeqCst);
            if !self.entered.swap(true, Ordering::SeqCst) {
                if let Some(pool) = self.pool.get().and_then(Weak::upgrade) {
                    pool.allocate(10)?;
                    assert_eq!(pool.bytes_reserved(), 1024);
                }
            }
            Ok(())
        }

        fn on_release(&self, size: i64) -> Result<()> {
            self.released.fetch_add(size, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_block_listener_may_reenter_pool() {
        let listener = Arc::new(ReentrantListener::default());
        let pool = Arc::new(ReservationListenableMemoryPool::with_block_size(
            Arc::new(SystemMemoryPool::new()),
            Arc::clone(&listener) as Arc<dyn ReservationListener>,
            1024,
        ));
        listener.pool.set(Arc::downgrade(&pool)).unwrap();

        pool.allocate(100).unwrap();
        assert_eq!(pool.bytes_allocated(), 110);
        assert_eq!(listener.reserved.load(Ordering::SeqCst), 1024);

        pool.free(10).unwrap();
        pool.free(100).unwrap();
        assert_eq!(listener.released.load(Ordering::SeqCst), 1024);
        assert_eq!(pool.bytes_reserved(), 0);
    }

    #[test]
    fn test_block_rejection_rolls_back() {
        let listener = Arc::new(RecordingListener::default());
        let pool = ReservationListenableMemoryPool::with_block_size(
            Arc::new(SystemMemoryPool::new()),
            Arc::clone(&listener) as Arc<dyn ReservationListener>,
            1024,
        );
        pool.allocate(1000).unwrap();

        listener.reject.store(true, Ordering::SeqCst);
        assert!(pool.allocate(100).is_err());
        assert_eq!(pool.bytes_reserved(), 1024);
        // The first block still has room
        pool.allocate(24).unwrap();

        pool.free(1024).unwrap();
        assert_eq!(pool.bytes_reserved(), 0);
        assert_eq!(listener.released.load(Ordering::SeqCst), 1024);
    }

    #[test]
    fn test_concurrent_allocations_balance() {
        let listener = Arc::new(RecordingListener::default());
        let pool = Arc::new(listenable(&listener));

        let workers: Vec<_> = (0..8)
            .map(|t| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for i in 1..=100i64 {
                        let size = t * 10 + i;
                        pool.allocate(size).unwrap();
                        pool.free(size).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(pool.bytes_allocated(), 0);
        assert_eq!(
            listener.reserved.load(Ordering::SeqCst),
            listener.released.load(Ordering::SeqCst)
        );
        assert_eq!(
            listener.reserved.load(Ordering::SeqCst),
            pool.total_bytes_allocated()
        );
    }

    // ==========================================================================
    // Reservation Guard Tests
    // ==========================================================================

    #[test]
    fn test_reservation_releases_on_drop() {
        let pool: Arc<dyn MemoryPool> = Arc::new(SystemMemoryPool::new());
        {
            let reservation = MemoryReservation::try_new(Arc::clone(&pool), 512).unwrap();
            assert_eq!(reservation.size(), 512);
            assert_eq!(pool.bytes_allocated(), 512);
        }
        assert_eq!(pool.bytes_allocated(), 0);
    }

    #[test]
    fn test_failed_reservation_holds_nothing() {
        let listener = Arc::new(RecordingListener::default());
        listener.reject.store(true, Ordering::SeqCst);
        let pool: Arc<dyn MemoryPool> = Arc::new(listenable(&listener));
        assert!(MemoryReservation::try_new(Arc::clone(&pool), 64).is_err());
        assert_eq!(pool.bytes_allocated(), 0);
        assert_eq!(listener.released.load(Ordering::SeqCst), 0);
    }
}
