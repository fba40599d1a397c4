//! Offline pass over a finished acquisition: decodes the packed samples,
//! zero-fills lost packets and builds the matching time axis.

use std::io::{self, Write};

use thiserror::Error;

use crate::common::*;
use crate::protocol::PAYLOAD_SIZE;
use crate::receiver::GapRecord;
use crate::samples_utils::{samples_in, PackedSamplesIterator, SAMPLES_PER_WORD, WORD_BYTES};

/// Samples carried by one data packet, inserted as zeros for every lost one
pub const SAMPLES_PER_PACKET: usize = samples_in(PAYLOAD_SIZE);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconstructError {
  #[error("{samples} samples but {times} timestamps")]
  TimeAxisMismatch { samples: usize, times: usize },
  #[error("gap at offset {offset} comes before previous gap at {previous}")]
  GapOutOfOrder { offset: usize, previous: usize },
  #[error("gap at offset {offset} is past the end of {len} received bytes")]
  GapOutOfBounds { offset: usize, len: usize },
  #[error("gap at offset {offset} splits a sample word")]
  GapMisaligned { offset: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleStream {
  pub samples: Vec<Sample>,
  /// seconds since the first sample, one entry per sample
  pub times: Vec<f64>,
  /// how many of `samples` are zero fill for lost packets
  pub filled: usize,
}

impl SampleStream {
  /// One `time sample` line per sample
  pub fn write_text<W: Write>(&self, mut w: W) -> io::Result<()> {
    for (time, sample) in self.times.iter().zip(&self.samples) {
      writeln!(w, "{time:.9} {sample}")?;
    }
    w.flush()
  }
}

/// Time axis built independently of the samples, so a decoding slip shows up as a length mismatch
struct TimeAxis {
  times: Vec<f64>,
  period: f64,
  index: u64,
}

impl TimeAxis {
  fn advance(&mut self, count: usize) {
    for _ in 0..count {
      self.times.push(self.index as f64 * self.period);
      self.index += 1;
    }
  }
}

pub fn reconstruct(data: &[u8], gaps: &[GapRecord], sample_rate_hz: u32) -> Result<SampleStream, ReconstructError> {
  let filled: usize = gaps.iter().map(|gap| gap.lost as usize * SAMPLES_PER_PACKET).sum();
  let capacity = samples_in(data.len()) + filled;
  let mut samples = Vec::with_capacity(capacity);
  let mut axis = TimeAxis { times: Vec::with_capacity(capacity), period: 1.0 / sample_rate_hz as f64, index: 0 };

  let mut start = 0;
  for gap in gaps {
    if gap.offset < start {
      return Err(ReconstructError::GapOutOfOrder { offset: gap.offset, previous: start });
    }
    if gap.offset > data.len() {
      return Err(ReconstructError::GapOutOfBounds { offset: gap.offset, len: data.len() });
    }
    if gap.offset % WORD_BYTES != 0 {
      return Err(ReconstructError::GapMisaligned { offset: gap.offset });
    }
    samples.extend(PackedSamplesIterator::new(&data[start..gap.offset]));
    axis.advance((gap.offset - start) / WORD_BYTES * SAMPLES_PER_WORD);
    let missing = gap.lost as usize * SAMPLES_PER_PACKET;
    samples.resize(samples.len() + missing, 0);
    axis.advance(missing);
    start = gap.offset;
  }
  samples.extend(PackedSamplesIterator::new(&data[start..]));
  axis.advance((data.len() - start) / WORD_BYTES * SAMPLES_PER_WORD);

  if samples.len() != axis.times.len() {
    return Err(ReconstructError::TimeAxisMismatch { samples: samples.len(), times: axis.times.len() });
  }
  debug!("reconstructed {} samples, {filled} of them zero fill", samples.len());
  Ok(SampleStream { samples, times: axis.times, filled })
}
