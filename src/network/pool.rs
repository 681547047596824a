use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::core::{Error, Result};

/// Fixed set of equally sized buffers for outbound multicast packets
///
/// All memory is allocated up front. A slot is in use while its storage is
/// lent out to a [`PooledBuffer`].
pub struct BufferPool {
    slots: Mutex<Vec<Option<Box<[u8]>>>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Creates a pool of `count` buffers of `size` bytes each
    pub fn new(count: usize, size: usize) -> Arc<Self> {
        let slots = (0..count)
            .map(|_| Some(vec![0u8; size].into_boxed_slice()))
            .collect();
        Arc::new(BufferPool {
            slots: Mutex::new(slots),
            buffer_size: size,
        })
    }

    /// Takes a free buffer, failing immediately when none is left
    pub fn allocate(self: &Arc<Self>) -> Result<PooledBuffer> {
        let mut slots = self.slots.lock();
        let free = slots.iter_mut().enumerate().find(|(_, s)| s.is_some());

        match free {
            Some((index, slot)) => {
                let data = slot.take();
                Ok(PooledBuffer {
                    pool: Arc::clone(self),
                    index,
                    data,
                })
            }
            None => {
                error!("No available multicast buffers ({} in use)", slots.len());
                Err(Error::resource_exhausted("multicast buffer pool is empty"))
            }
        }
    }

    fn release(&self, index: usize, data: Box<[u8]>) {
        let mut slots = self.slots.lock();
        match slots.get_mut(index) {
            Some(slot) if slot.is_none() => *slot = Some(data),
            _ => error!("Buffer {} returned to a slot that is not lent out", index),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_none()).count()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// A buffer lent out by a [`BufferPool`]
///
/// Dropping it returns the slot, so every exit path releases it exactly once.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    index: usize,
    data: Option<Box<[u8]>>,
}

impl PooledBuffer {
    /// Slot handle within the pool
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the buffer to the pool
    pub fn free(self) {}
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(self.index, data);
        }
    }
}
