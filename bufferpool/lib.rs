#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use bytes::BytesMut;
use parking_lot::Mutex;

/// A bounded freelist of fixed-capacity buffers.
///
/// Buffers return to the pool on drop. The pool keeps at most `max_idle`
/// spare buffers; anything beyond that is released to the allocator.
/// [`BufferPool::drain`] empties the freelist, so an idle consumer can give
/// memory back without dropping the pool itself.
#[derive(Clone)]
pub struct BufferPool<B> {
    inner: Arc<PoolInner<B>>,
}

struct PoolInner<B> {
    free: Mutex<Vec<B>>,
    buffer_capacity: usize,
    max_idle: usize,
}

impl<B> BufferPool<B>
where
    B: Buf,
{
    pub fn new(buffer_capacity: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                buffer_capacity,
                max_idle,
            }),
        }
    }

    pub fn pull(&self) -> Buffer<B> {
        let mut storage = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| B::with_capacity(self.inner.buffer_capacity));

        storage.resize_to(self.inner.buffer_capacity);

        Buffer {
            inner: Some(storage),
            pool: Arc::clone(&self.inner),
        }
    }

    /// The number of spare buffers currently held.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Release all spare buffers to the allocator.
    pub fn drain(&self) {
        self.inner.free.lock().clear();
    }
}

impl<B> BufferPool<B>
where
    B: Buf + DerefMut<Target = [u8]>,
{
    pub fn pull_initialised(&self, data: &[u8]) -> Buffer<B> {
        let mut buffer = self.pull();
        buffer.resize_to(data.len());
        buffer.copy_from_slice(data);

        buffer
    }
}

pub struct Buffer<B> {
    /// `Some` until the buffer is dropped back into the pool.
    inner: Option<B>,
    pool: Arc<PoolInner<B>>,
}

impl<B> Buffer<B>
where
    B: Buf,
{
    /// Shorten the buffer to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.storage_mut().resize_to(len);
    }

    fn storage(&self) -> &B {
        self.inner.as_ref().expect("present until drop")
    }

    fn storage_mut(&mut self) -> &mut B {
        self.inner.as_mut().expect("present until drop")
    }
}

impl<B> Drop for Buffer<B> {
    fn drop(&mut self) {
        let Some(storage) = self.inner.take() else {
            return;
        };

        let mut free = self.pool.free.lock();

        if free.len() < self.pool.max_idle {
            free.push(storage);
        }
    }
}

impl<B> Deref for Buffer<B>
where
    B: Buf,
{
    type Target = B;

    fn deref(&self) -> &Self::Target {
        self.storage()
    }
}

impl<B> DerefMut for Buffer<B>
where
    B: Buf,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.storage_mut()
    }
}

impl<B> std::fmt::Debug for Buffer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Buffer").finish()
    }
}

pub trait Buf: Sized {
    fn with_capacity(capacity: usize) -> Self;
    fn resize_to(&mut self, len: usize);
}

impl Buf for Vec<u8> {
    fn with_capacity(capacity: usize) -> Self {
        vec![0; capacity]
    }

    fn resize_to(&mut self, len: usize) {
        self.resize(len, 0);
    }
}

impl Buf for BytesMut {
    fn with_capacity(capacity: usize) -> Self {
        BytesMut::zeroed(capacity)
    }

    fn resize_to(&mut self, len: usize) {
        self.resize(len, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialised_buffer_is_only_as_long_as_content() {
        let pool = BufferPool::<Vec<u8>>::new(1024, 16);

        let buffer = pool.pull_initialised(b"hello world");

        assert_eq!(buffer.len(), 11);
    }

    #[test]
    fn buffer_returns_to_pool_on_drop() {
        let pool = BufferPool::<Vec<u8>>::new(1024, 16);

        drop(pool.pull());

        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn reused_buffer_has_full_capacity_again() {
        let pool = BufferPool::<Vec<u8>>::new(1024, 16);

        let mut buffer = pool.pull();
        buffer.truncate(3);
        drop(buffer);

        assert_eq!(pool.pull().len(), 1024);
    }

    #[test]
    fn pool_does_not_grow_beyond_max_idle() {
        let pool = BufferPool::<Vec<u8>>::new(1024, 2);

        let buffers = (0..5).map(|_| pool.pull()).collect::<Vec<_>>();
        drop(buffers);

        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn drain_releases_spare_buffers() {
        let pool = BufferPool::<Vec<u8>>::new(1024, 16);

        drop(pool.pull());
        drop(pool.pull());
        pool.drain();

        assert_eq!(pool.idle(), 0);
    }
}
