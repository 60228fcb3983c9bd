//! Size-classed packet buffer pool.
//!
//! The pool keeps one free list per buffer size class (ascending sizes).
//! Acquisition takes the smallest class that fits; when a class's free list
//! is empty and its cap has not been reached, a fresh buffer is created and
//! counted against the class. A loaned buffer returns to its class when the
//! [`PooledBuffer`] is dropped, which is the single-return ownership rule
//! the rest of the server relies on.
//!
//! Two acquisition flavors exist on purpose: the transport reader waits a
//! bounded time for a buffer (backpressure at ingress), handlers that need a
//! larger reply buffer fail immediately so a request never stalls inside the
//! worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};

/// Per-class pool configuration: buffer size, eagerly created count, cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassConfig {
    pub size: usize,
    pub initial: usize,
    pub maximum: usize,
}

/// Default class table: small control frames, typical requests, large
/// read/write payloads, and the negotiated-maximum frame.
pub fn default_classes() -> Vec<ClassConfig> {
    vec![
        ClassConfig { size: 256, initial: 20, maximum: 100 },
        ClassConfig { size: 4096, initial: 10, maximum: 50 },
        ClassConfig { size: 16384, initial: 5, maximum: 50 },
        ClassConfig { size: 66000, initial: 5, maximum: 50 },
    ]
}

/// Raised when a class is exhausted, its cap reached, and no buffer came
/// back within the caller's patience.
#[derive(Debug, PartialEq, Eq)]
pub struct NoBufferAvailable {
    pub requested: usize,
}

impl std::fmt::Display for NoBufferAvailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no pooled buffer of at least {} bytes available", self.requested)
    }
}

impl std::error::Error for NoBufferAvailable {}

struct Class {
    size: usize,
    maximum: usize,
    created: AtomicUsize,
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
}

impl Class {
    fn new(config: ClassConfig) -> Class {
        let (free_tx, free_rx) = async_channel::bounded(config.maximum.max(1));
        let class = Class {
            size: config.size,
            maximum: config.maximum,
            created: AtomicUsize::new(config.initial),
            free_tx,
            free_rx,
        };
        for _ in 0..config.initial {
            // Cannot fail: the channel was sized to hold every buffer.
            let _ = class.free_tx.try_send(Vec::with_capacity(config.size));
        }
        class
    }

    fn take_or_create(&self) -> Option<Vec<u8>> {
        if let Ok(vec) = self.free_rx.try_recv() {
            return Some(vec);
        }
        let grown = self
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.maximum).then_some(n + 1)
            })
            .is_ok();
        if grown {
            return Some(Vec::with_capacity(self.size));
        }
        // A return may have raced the cap check.
        self.free_rx.try_recv().ok()
    }
}

/// The shared buffer pool. Cheap to clone via [`Arc`].
pub struct BufferPool {
    classes: Vec<Class>,
}

impl BufferPool {
    pub fn new(configs: &[ClassConfig]) -> Arc<BufferPool> {
        let mut classes: Vec<Class> = configs.iter().copied().map(Class::new).collect();
        classes.sort_by_key(|c| c.size);
        Arc::new(BufferPool { classes })
    }

    /// Largest pooled buffer size.
    pub fn largest(&self) -> usize {
        self.classes.last().map(|c| c.size).unwrap_or(0)
    }

    fn class_for(&self, size: usize) -> Option<(usize, &Class)> {
        self.classes.iter().enumerate().find(|(_, c)| c.size >= size)
    }

    /// Acquires a buffer of at least `size` bytes without waiting.
    pub fn try_acquire(self: &Arc<Self>, size: usize) -> Result<PooledBuffer, NoBufferAvailable> {
        let Some((index, class)) = self.class_for(size) else {
            // Above the largest class: ad-hoc, discarded on drop.
            return Ok(PooledBuffer { vec: Vec::with_capacity(size), origin: None });
        };
        match class.take_or_create() {
            Some(vec) => Ok(PooledBuffer { vec, origin: Some(Origin::new(self, index)) }),
            None => Err(NoBufferAvailable { requested: size }),
        }
    }

    /// Acquires a buffer of at least `size` bytes, waiting up to `patience`
    /// for one to be returned when the class is at its cap.
    pub async fn acquire(
        self: &Arc<Self>,
        size: usize,
        patience: Duration,
    ) -> Result<PooledBuffer, NoBufferAvailable> {
        let Some((index, class)) = self.class_for(size) else {
            return Ok(PooledBuffer { vec: Vec::with_capacity(size), origin: None });
        };
        if let Some(vec) = class.take_or_create() {
            return Ok(PooledBuffer { vec, origin: Some(Origin::new(self, index)) });
        }
        match tokio::time::timeout(patience, class.free_rx.recv()).await {
            Ok(Ok(vec)) => Ok(PooledBuffer { vec, origin: Some(Origin::new(self, index)) }),
            _ => Err(NoBufferAvailable { requested: size }),
        }
    }

    /// Free + loanable headroom of the class covering `size`, for
    /// diagnostics.
    pub fn available(&self, size: usize) -> usize {
        match self.class_for(size) {
            Some((_, class)) => {
                class.free_rx.len() + class.maximum - class.created.load(Ordering::Acquire)
            }
            None => 0,
        }
    }
}

struct Origin {
    pool: Arc<BufferPool>,
    class: usize,
}

impl Origin {
    fn new(pool: &Arc<BufferPool>, class: usize) -> Origin {
        Origin { pool: Arc::clone(pool), class }
    }
}

/// A buffer on loan from the pool. Dropping it returns the memory to its
/// class; a buffer that was grown past its class size is discarded instead
/// so the class stays uniformly sized.
pub struct PooledBuffer {
    vec: Vec<u8>,
    origin: Option<Origin>,
}

impl PooledBuffer {
    /// The underlying storage, for in-place frame building.
    pub fn vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.vec
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.vec
    }

    /// Clears and resizes the buffer to hold exactly `len` bytes.
    pub fn reset(&mut self, len: usize) {
        self.vec.clear();
        self.vec.resize(len, 0);
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.vec
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.vec
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(origin) = self.origin.take() else { return };
        let class = &origin.pool.classes[origin.class];
        let mut vec = std::mem::take(&mut self.vec);
        if vec.capacity() != class.size {
            class.created.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        vec.clear();
        if class.free_tx.try_send(vec).is_err() {
            class.created.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_pool() -> Arc<BufferPool> {
        BufferPool::new(&[
            ClassConfig { size: 64, initial: 1, maximum: 2 },
            ClassConfig { size: 1024, initial: 1, maximum: 1 },
        ])
    }

    #[tokio::test]
    async fn smallest_fitting_class_wins() {
        let pool = tiny_pool();
        let small = pool.try_acquire(10).unwrap();
        assert_eq!(small.vec.capacity(), 64);
        let large = pool.try_acquire(65).unwrap();
        assert_eq!(large.vec.capacity(), 1024);
    }

    #[tokio::test]
    async fn cap_enforced_and_release_recycles() {
        let pool = tiny_pool();
        let first = pool.try_acquire(64).unwrap();
        let _second = pool.try_acquire(64).unwrap();
        assert!(matches!(pool.try_acquire(64), Err(NoBufferAvailable { requested: 64 })));
        drop(first);
        assert!(pool.try_acquire(64).is_ok());
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let pool = tiny_pool();
        let _held = pool.try_acquire(1024).unwrap();
        let err = pool.acquire(1024, Duration::from_millis(20)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn bounded_wait_wakes_on_return() {
        let pool = tiny_pool();
        let held = pool.try_acquire(1024).unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(1024, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn oversize_requests_bypass_the_pool() {
        let pool = tiny_pool();
        let huge = pool.try_acquire(100_000).unwrap();
        assert!(huge.origin.is_none());
    }

    #[tokio::test]
    async fn grown_buffers_are_discarded_not_pooled() {
        let pool = tiny_pool();
        {
            let mut buf = pool.try_acquire(64).unwrap();
            buf.vec_mut().reserve(4096);
        }
        // The class slot was freed, so a fresh acquire still succeeds.
        let replacement = pool.try_acquire(64).unwrap();
        assert_eq!(replacement.vec.capacity(), 64);
    }
}
