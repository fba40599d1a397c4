//! Packed ADC encoding: every 4-byte word carries two 12-bit samples.
//!
//! ```text
//! byte:    0          1                2          3
//!       s2[7:0]  s1[3:0] s2[11:8]   s1[11:4]   unused
//! ```

use crate::common::*;

pub const WORD_BYTES: usize = 4;
pub const SAMPLES_PER_WORD: usize = 2;

#[inline(always)]
pub fn decode_word(b: &[u8]) -> (Sample, Sample) {
  let first = ((b[2] as Sample) << 4) | ((b[1] as Sample & 0xf0) >> 4);
  let second = ((b[1] as Sample & 0x0f) << 8) | (b[0] as Sample);
  (first, second)
}

#[inline(always)]
pub fn encode_word(first: Sample, second: Sample, dst: &mut [u8]) {
  let first = first & SAMPLE_MAX;
  let second = second & SAMPLE_MAX;
  dst[0] = second as u8;
  dst[1] = (((first & 0x0f) << 4) as u8) | ((second >> 8) as u8);
  dst[2] = (first >> 4) as u8;
  dst[3] = 0;
}

/// Number of samples encoded in `bytes` bytes; trailing partial words carry none
pub const fn samples_in(bytes: usize) -> usize {
  (bytes / WORD_BYTES) * SAMPLES_PER_WORD
}

/// Iterates samples of a packed byte slice in stream order
pub struct PackedSamplesIterator<'a> {
  words: std::slice::ChunksExact<'a, u8>,
  pending: Option<Sample>,
}

impl<'a> PackedSamplesIterator<'a> {
  pub fn new(bytes: &'a [u8]) -> Self {
    Self { words: bytes.chunks_exact(WORD_BYTES), pending: None }
  }
}

impl<'a> Iterator for PackedSamplesIterator<'a> {
  type Item = Sample;
  #[inline(always)]
  fn next(&mut self) -> Option<Sample> {
    if let Some(second) = self.pending.take() {
      return Some(second);
    }
    self.words.next().map(|word| {
      let (first, second) = decode_word(word);
      self.pending = Some(second);
      first
    })
  }
  #[inline(always)]
  fn size_hint(&self) -> (usize, Option<usize>) {
    let size = self.words.len() * SAMPLES_PER_WORD + self.pending.is_some() as usize;
    (size, Some(size))
  }
}

impl<'a> ExactSizeIterator for PackedSamplesIterator<'a> {}

/// Packs samples pairwise into `dst`, returns number of bytes written.
/// A trailing odd sample is paired with zero.
pub fn write_packed_samples<'a, I>(src: I, dst: &mut [u8]) -> usize
where I: IntoIterator<Item=&'a Sample> {
  let mut pos = 0;
  let mut srci = src.into_iter();
  while pos + WORD_BYTES <= dst.len() {
    let Some(&first) = srci.next() else { break };
    let second = srci.next().copied().unwrap_or(0);
    encode_word(first, second, &mut dst[pos..pos + WORD_BYTES]);
    pos += WORD_BYTES;
  }
  pos
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_decode_known_word() {
    // s1 = 0xABC, s2 = 0x123
    let word = [0x23, 0xC1, 0xAB, 0xFF];
    assert_eq!(decode_word(&word), (0xABC, 0x123));
  }

  #[test]
  fn test_encode_matches_decode_layout() {
    let mut word = [0u8; 4];
    encode_word(0xABC, 0x123, &mut word);
    assert_eq!(word, [0x23, 0xC1, 0xAB, 0x00]);
  }

  #[test]
  fn test_iterator_yields_two_samples_per_word() {
    let samples: Vec<Sample> = vec![1, 2, 0x0fff, 0, 7, 8];
    let mut bytes = vec![0u8; 12];
    assert_eq!(write_packed_samples(&samples, &mut bytes), 12);
    let it = PackedSamplesIterator::new(&bytes);
    assert_eq!(it.len(), 6);
    assert_eq!(it.collect::<Vec<_>>(), samples);
  }

  #[test]
  fn test_partial_word_is_ignored() {
    assert_eq!(samples_in(10), 4);
    assert_eq!(PackedSamplesIterator::new(&[0u8; 10]).count(), 4);
  }
}
