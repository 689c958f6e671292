// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  ops::{Deref, DerefMut},
  sync::{Arc, Mutex},
};

/// Copy buffer size used by access and hop forwarders
pub const OVERLAY_BUFFER_SIZE: usize = 4 * 1024;
/// Copy buffer size used when writing to a real destination
pub const TARGET_BUFFER_SIZE: usize = 64 * 1024;

const DEFAULT_MAX_POOLED: usize = 1024;

struct PoolInner {
  buffer_size: usize,
  max_pooled: usize,
  free: Mutex<Vec<Box<[u8]>>>,
}

/// Fixed-size copy buffers shared by the relays of one forwarding component
#[derive(Clone)]
pub struct BufferPool {
  inner: Arc<PoolInner>,
}

impl std::fmt::Debug for BufferPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BufferPool")
      .field("buffer_size", &self.inner.buffer_size)
      .field("idle", &self.idle())
      .finish()
  }
}

impl BufferPool {
  pub fn new(buffer_size: usize) -> Self {
    Self::with_capacity(buffer_size, DEFAULT_MAX_POOLED)
  }

  /// At most `max_pooled` idle buffers are retained; extras are freed on return
  pub fn with_capacity(buffer_size: usize, max_pooled: usize) -> Self {
    Self {
      inner: Arc::new(PoolInner {
        buffer_size: buffer_size.max(1),
        max_pooled,
        free: Mutex::new(Vec::new()),
      }),
    }
  }

  pub fn buffer_size(&self) -> usize {
    self.inner.buffer_size
  }

  /// Number of buffers waiting for reuse
  pub fn idle(&self) -> usize {
    self.inner.free.lock().expect("Mutex poisoned").len()
  }

  /// Borrows a buffer, which goes back to the pool when dropped
  pub fn take(&self) -> PooledBuffer {
    let recycled = self.inner.free.lock().expect("Mutex poisoned").pop();
    let buffer =
      recycled.unwrap_or_else(|| vec![0u8; self.inner.buffer_size].into_boxed_slice());
    PooledBuffer {
      buffer: Some(buffer),
      pool: Arc::clone(&self.inner),
    }
  }
}

pub struct PooledBuffer {
  buffer: Option<Box<[u8]>>,
  pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    self.buffer.as_deref().unwrap_or_default()
  }
}

impl DerefMut for PooledBuffer {
  fn deref_mut(&mut self) -> &mut [u8] {
    self.buffer.as_deref_mut().unwrap_or_default()
  }
}

impl Drop for PooledBuffer {
  fn drop(&mut self) {
    if let Some(buffer) = self.buffer.take() {
      let mut free = self.pool.free.lock().expect("Mutex poisoned");
      if free.len() < self.pool.max_pooled {
        free.push(buffer);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::BufferPool;

  #[test]
  fn buffers_are_recycled() {
    let pool = BufferPool::new(16);
    assert_eq!(pool.idle(), 0);
    {
      let mut buffer = pool.take();
      assert_eq!(buffer.len(), 16);
      buffer[0] = 7;
    }
    assert_eq!(pool.idle(), 1);
    let _buffer = pool.take();
    assert_eq!(pool.idle(), 0);
  }

  #[test]
  fn idle_buffers_are_capped() {
    let pool = BufferPool::with_capacity(8, 1);
    let first = pool.take();
    let second = pool.take();
    drop(first);
    drop(second);
    assert_eq!(pool.idle(), 1);
  }
}
