//! Message buffer pooling
//!
//! A bounded freelist of boxed buffers. Handles returned by
//! [`BufferPool::allocate`] put themselves back on drop, so a buffer is
//! recycled whether it was consumed, sent or discarded on an error path.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

/// Types that can be recycled through a [`BufferPool`]
pub trait Poolable: Send + 'static {
    /// Build a fresh instance for a new slot
    fn create() -> Self;

    /// Restore the instance to its freshly created state
    fn reset(&mut self);
}

struct PoolState<T> {
    free: Vec<Box<T>>,
    created: usize,
}

struct PoolShared<T> {
    name: &'static str,
    capacity: usize,
    state: Mutex<PoolState<T>>,
}

impl<T: Poolable> PoolShared<T> {
    fn release(&self, mut item: Box<T>) {
        item.reset();
        self.state.lock().free.push(item);
    }
}

/// Fixed-capacity pool of reusable buffers
pub struct BufferPool<T: Poolable> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Poolable> BufferPool<T> {
    /// Create a pool that will hand out at most `capacity` buffers at once
    ///
    /// Slots are created lazily, so an idle pool costs nothing.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                name,
                capacity,
                state: Mutex::new(PoolState {
                    free: Vec::with_capacity(capacity.min(256)),
                    created: 0,
                }),
            }),
        }
    }

    /// Take a buffer, or `None` if every slot is outstanding
    pub fn allocate(&self) -> Option<Pooled<T>> {
        let item = {
            let mut state = self.shared.state.lock();
            match state.free.pop() {
                Some(item) => Some(item),
                None if state.created < self.shared.capacity => {
                    state.created += 1;
                    None
                }
                None => {
                    drop(state);
                    warn!(pool = self.shared.name, capacity = self.shared.capacity, "Buffer pool exhausted");
                    return None;
                }
            }
        };

        // New slots are built outside the lock
        let item = item.unwrap_or_else(|| Box::new(T::create()));
        Some(Pooled {
            item: Some(item),
            pool: Arc::clone(&self.shared),
        })
    }

    /// Return a buffer explicitly (equivalent to dropping it)
    pub fn deallocate(&self, handle: Pooled<T>) {
        drop(handle);
    }

    /// Buffers currently handed out
    pub fn outstanding(&self) -> usize {
        let state = self.shared.state.lock();
        state.created - state.free.len()
    }

    /// Buffers that can still be allocated
    pub fn available(&self) -> usize {
        self.shared.capacity - self.outstanding()
    }

    /// Maximum number of outstanding buffers
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Pool name used in diagnostics
    pub fn name(&self) -> &'static str {
        self.shared.name
    }
}

impl<T: Poolable> Clone for BufferPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Poolable> fmt::Debug for BufferPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`]
pub struct Pooled<T: Poolable> {
    item: Option<Box<T>>,
    pool: Arc<PoolShared<T>>,
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only taken in drop
        self.item.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}

impl<T: Poolable + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&**self).finish()
    }
}
