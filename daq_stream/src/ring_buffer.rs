//! Lock-free single-producer single-consumer byte FIFO.
//!
//! The producer half ([`FifoInput`]) is meant to be driven from interrupt-like
//! context: it never blocks, never allocates and either stores a whole burst or
//! nothing. The consumer half ([`FifoOutput`]) only hands out lengths that are
//! multiples of the element size.
//!
//! Cursors are `u32` counters that wrap modulo 2^32; only `in - out` is meaningful.

use crate::common::*;
use std::sync::{atomic::{AtomicBool, AtomicU32, AtomicUsize}, Arc};
use atomic::{Atomic, Ordering};
use itertools::Itertools;
use thiserror::Error;

/// Largest capacity for which `in - out` still fits the cursor type unambiguously
pub const MAX_CAPACITY: usize = 1 << 31;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoError {
  #[error("capacity {0} is not a power of two in range 1..=2^31")]
  InvalidCapacity(usize),
  #[error("element size {element_size} does not divide capacity {capacity}")]
  InvalidElementSize { capacity: usize, element_size: usize },
  #[error("burst of {needed} bytes does not fit, only {free} bytes free")]
  Full { needed: usize, free: usize },
  #[error("no aligned data available")]
  WouldBlock,
}

struct FifoShared {
  buffer: Vec<Atomic<u8>>,
  element_size: usize,
  in_pos: AtomicU32,
  out_pos: AtomicU32,
  overflowing: AtomicBool,
  dropped_bursts: AtomicUsize,
}

impl FifoShared {
  fn capacity(&self) -> usize {
    self.buffer.len()
  }
  #[inline(always)]
  fn len(&self) -> usize {
    let in_pos = self.in_pos.load(Ordering::Acquire);
    let out_pos = self.out_pos.load(Ordering::Acquire);
    in_pos.wrapping_sub(out_pos) as usize
  }
  #[inline(always)]
  fn avail(&self) -> usize {
    // in - out <= capacity holds by construction, saturate anyway so avail is never "negative"
    self.capacity().saturating_sub(self.len())
  }
  #[inline(always)]
  fn aligned(&self, len: usize) -> usize {
    len - (len % self.element_size)
  }
}

/// Calls `cb(ring_index, linear_index)` for `count` consecutive positions starting at cursor `start`
#[inline(always)]
fn for_in_ring(length: usize, start: u32, count: usize, mut cb: impl FnMut(usize, usize)) {
  if count == 0 {
    return;
  }
  let w_start = (start as usize) & (length - 1);
  let first = count.min(length - w_start);
  for i in 0..first {
    cb(w_start + i, i);
  }
  for i in first..count {
    cb(i - first, i);
  }
}

/// Producer half. There is exactly one per FIFO.
pub struct FifoInput {
  fifo: Arc<FifoShared>,
}

impl FifoInput {
  pub fn capacity(&self) -> usize {
    self.fifo.capacity()
  }
  pub fn len(&self) -> usize {
    self.fifo.len()
  }
  pub fn avail(&self) -> usize {
    self.fifo.avail()
  }

  /// Stores the whole `src` or nothing.
  ///
  /// Never blocks. On [`FifoError::Full`] the caller is expected to drop the burst.
  pub fn push(&mut self, src: &[u8]) -> Result<(), FifoError> {
    let needed = src.len();
    let free = self.fifo.avail();
    if free < needed {
      return Err(FifoError::Full { needed, free });
    }
    // only this half ever writes in_pos
    let in_pos = self.fifo.in_pos.load(Ordering::Relaxed);
    let buffer = &self.fifo.buffer;
    for_in_ring(buffer.len(), in_pos, needed, |ring_index, i| {
      buffer[ring_index].store(src[i], Ordering::Relaxed);
    });
    atomic::fence(Ordering::Release);
    self.fifo.in_pos.store(in_pos.wrapping_add(needed as u32), Ordering::Release);
    Ok(())
  }

  /// Updates the overflow state. Returns `Some(new_state)` only when the state changed,
  /// so callers can log edges instead of every dropped burst.
  pub fn set_overflowing(&mut self, overflowing: bool) -> Option<bool> {
    if overflowing {
      self.fifo.dropped_bursts.fetch_add(1, Ordering::AcqRel);
    }
    let previous = self.fifo.overflowing.swap(overflowing, Ordering::AcqRel);
    (previous != overflowing).then_some(overflowing)
  }
}

/// Consumer half. Not `Clone`: owning it means being the only reader,
/// which is what makes [`FifoOutput::reset_out`] sound.
pub struct FifoOutput {
  fifo: Arc<FifoShared>,
}

impl FifoOutput {
  pub fn capacity(&self) -> usize {
    self.fifo.capacity()
  }
  pub fn element_size(&self) -> usize {
    self.fifo.element_size
  }
  pub fn len(&self) -> usize {
    self.fifo.len()
  }
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
  pub fn avail(&self) -> usize {
    self.fifo.avail()
  }
  /// Number of bytes a read of unlimited length would return right now
  pub fn aligned_len(&self) -> usize {
    self.fifo.aligned(self.fifo.len())
  }

  /// Copies out up to `dst.len()` bytes, rounded down to a multiple of the element size.
  pub fn pop_aligned(&mut self, dst: &mut [u8]) -> Result<usize, FifoError> {
    let out_pos = self.fifo.out_pos.load(Ordering::Relaxed);
    let available = self.fifo.in_pos.load(Ordering::Acquire).wrapping_sub(out_pos) as usize;
    let aligned = self.fifo.aligned(dst.len().min(available));
    if aligned == 0 {
      return Err(FifoError::WouldBlock);
    }
    atomic::fence(Ordering::Acquire);
    let buffer = &self.fifo.buffer;
    for_in_ring(buffer.len(), out_pos, aligned, |ring_index, i| {
      dst[i] = buffer[ring_index].load(Ordering::Relaxed);
    });
    self.fifo.out_pos.store(out_pos.wrapping_add(aligned as u32), Ordering::Release);
    Ok(aligned)
  }

  /// Discards everything currently buffered (`out = in`).
  pub fn reset_out(&mut self) {
    let in_pos = self.fifo.in_pos.load(Ordering::Acquire);
    let discarded = in_pos.wrapping_sub(self.fifo.out_pos.load(Ordering::Relaxed));
    if discarded != 0 {
      debug!("discarding {discarded} stale bytes from fifo");
    }
    self.fifo.out_pos.store(in_pos, Ordering::Release);
  }

  /// Latched overflow state, cleared only by [`FifoOutput::reset_overflow`] or by the producer
  pub fn overflowing(&self) -> bool {
    self.fifo.overflowing.load(Ordering::Acquire)
  }
  pub fn dropped_bursts(&self) -> usize {
    self.fifo.dropped_bursts.load(Ordering::Acquire)
  }
  /// Only valid while the producer is known to be idle (session open with producer gated off)
  pub fn reset_overflow(&mut self) {
    self.fifo.overflowing.store(false, Ordering::Release);
    self.fifo.dropped_bursts.store(0, Ordering::Release);
  }
}

pub fn new_fifo(capacity: usize, element_size: usize) -> Result<(FifoInput, FifoOutput), FifoError> {
  new_fifo_at(capacity, element_size, 0)
}

/// Like [`new_fifo`] but with both cursors starting at `start`
pub(crate) fn new_fifo_at(capacity: usize, element_size: usize, start: u32) -> Result<(FifoInput, FifoOutput), FifoError> {
  if !capacity.is_power_of_two() || capacity > MAX_CAPACITY {
    return Err(FifoError::InvalidCapacity(capacity));
  }
  if element_size == 0 || capacity % element_size != 0 {
    return Err(FifoError::InvalidElementSize { capacity, element_size });
  }
  let shared = Arc::new(FifoShared {
    buffer: (0..capacity).map(|_| Atomic::new(0u8)).collect_vec(),
    element_size,
    in_pos: start.into(),
    out_pos: start.into(),
    overflowing: false.into(),
    dropped_bursts: 0.into(),
  });
  Ok((FifoInput { fifo: shared.clone() }, FifoOutput { fifo: shared }))
}
