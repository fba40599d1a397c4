//! Interfaces to the FPGA acquisition core and its clock generator,
//! plus a software model of both used when no hardware is present.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use atomic::Ordering;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::capture::InterruptHandler;
use crate::common::*;
use crate::os_utils::set_current_thread_realtime;
use crate::samples_utils::{samples_in, write_packed_samples, SAMPLES_PER_WORD, WORD_BYTES};

const IDLE_POLL: Duration = Duration::from_millis(1);
const IRQ_THREAD_PRIORITY: u8 = 90;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid sample rate selector {0}, expected 0..=3")]
pub struct InvalidSampleRate(pub u8);

/// The four rates the clock generator can be programmed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleRate {
  Ksps200 = 0,
  Ksps500 = 1,
  Msps1 = 2,
  Msps2 = 3,
}

impl SampleRate {
  /// Rate the clock runs at after power-up or after a failed reconfiguration
  pub const DEFAULT: SampleRate = SampleRate::Msps2;

  pub fn hz(self) -> u32 {
    match self {
      Self::Ksps200 => 200_000,
      Self::Ksps500 => 500_000,
      Self::Msps1 => 1_000_000,
      Self::Msps2 => 2_000_000,
    }
  }
  pub fn selector(self) -> u8 {
    self as u8
  }
}

impl TryFrom<u8> for SampleRate {
  type Error = InvalidSampleRate;
  fn try_from(selector: u8) -> Result<Self, Self::Error> {
    match selector {
      0 => Ok(Self::Ksps200),
      1 => Ok(Self::Ksps500),
      2 => Ok(Self::Msps1),
      3 => Ok(Self::Msps2),
      other => Err(InvalidSampleRate(other)),
    }
  }
}

/// Run/clear control and status of the acquisition core.
pub trait AcquisitionControl: Send + Sync {
  /// Set then clear the counter-clear bit
  fn pulse_clear(&self);
  /// Assert or deassert both ADC and DAC run bits
  fn set_running(&self, running: bool);
  fn set_interrupt_enabled(&self, enabled: bool);
  /// Whether the hardware buffer was reused before the last burst was collected
  fn buffer_overwritten(&self) -> bool;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("clock failed to lock, monitor status {status:#010x}")]
pub struct ClockLockError {
  pub status: u32,
}

pub trait ClockConfigurator: Send + Sync {
  fn program(&self, rate: SampleRate) -> Result<(), ClockLockError>;
  /// Revert to the configuration the clock generator boots with
  fn apply_default(&self);
}


struct SimulatedAdcState {
  running: AtomicBool,
  interrupt_enabled: AtomicBool,
  overwritten: AtomicBool,
  clear_pulses: AtomicUsize,
  rate: AtomicU8,
  fail_next_lock: AtomicBool,
  noise_lsb: u16,
}

/// Software model of the acquisition core: produces a 12-bit sawtooth
/// at the programmed sample rate, one burst per "interrupt".
#[derive(Clone)]
pub struct SimulatedAdc {
  state: Arc<SimulatedAdcState>,
}

impl SimulatedAdc {
  pub fn new() -> Self {
    Self::with_noise(0)
  }
  /// Adds uniform noise of up to `noise_lsb` LSB on top of the sawtooth
  pub fn with_noise(noise_lsb: u16) -> Self {
    Self {
      state: Arc::new(SimulatedAdcState {
        running: false.into(),
        interrupt_enabled: false.into(),
        overwritten: false.into(),
        clear_pulses: 0.into(),
        rate: SampleRate::DEFAULT.selector().into(),
        fail_next_lock: false.into(),
        noise_lsb,
      }),
    }
  }
  pub fn is_running(&self) -> bool {
    self.state.running.load(Ordering::Acquire)
  }
  pub fn interrupt_enabled(&self) -> bool {
    self.state.interrupt_enabled.load(Ordering::Acquire)
  }
  pub fn clear_pulses(&self) -> usize {
    self.state.clear_pulses.load(Ordering::Acquire)
  }
  pub fn sample_rate(&self) -> SampleRate {
    SampleRate::try_from(self.state.rate.load(Ordering::Acquire)).unwrap_or(SampleRate::DEFAULT)
  }
  /// Makes the next [`ClockConfigurator::program`] call report a lock failure
  pub fn fail_next_clock_lock(&self) {
    self.state.fail_next_lock.store(true, Ordering::Release);
  }

  /// Starts the thread standing in for the hardware interrupt.
  /// Bursts are only generated while both the interrupt and the run bits are enabled.
  pub fn spawn(&self, mut handler: InterruptHandler, burst_size: usize) -> std::io::Result<InterruptThread> {
    let state = self.state.clone();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let join = std::thread::Builder::new().name("adc irq".to_owned()).spawn(move || {
      set_current_thread_realtime(IRQ_THREAD_PRIORITY).log_and_forget();
      let mut burst = vec![0u8; burst_size];
      let mut generator = SawtoothGenerator::new(state.noise_lsb);
      let mut next_deadline: Option<Instant> = None;
      while !stop_flag.load(Ordering::Acquire) {
        if !(state.interrupt_enabled.load(Ordering::Acquire) && state.running.load(Ordering::Acquire)) {
          next_deadline = None;
          std::thread::sleep(IDLE_POLL);
          continue;
        }
        let rate = SampleRate::try_from(state.rate.load(Ordering::Acquire)).unwrap_or(SampleRate::DEFAULT);
        let period = Duration::from_secs_f64(samples_in(burst_size) as f64 / rate.hz() as f64);
        let now = Instant::now();
        let deadline = next_deadline.unwrap_or(now + period);
        if deadline > now {
          std::thread::sleep(deadline - now);
        }
        // a whole period late means the real core would already be refilling the buffer we read
        state.overwritten.store(Instant::now() > deadline + period, Ordering::Release);
        generator.fill(&mut burst);
        handler.on_interrupt(&burst);
        next_deadline = Some(deadline + period);
      }
      debug!("simulated interrupt thread exiting");
    })?;
    Ok(InterruptThread { stop, join: Some(join) })
  }
}

impl Default for SimulatedAdc {
  fn default() -> Self {
    Self::new()
  }
}

impl AcquisitionControl for SimulatedAdc {
  fn pulse_clear(&self) {
    self.state.clear_pulses.fetch_add(1, Ordering::AcqRel);
  }
  fn set_running(&self, running: bool) {
    self.state.running.store(running, Ordering::Release);
  }
  fn set_interrupt_enabled(&self, enabled: bool) {
    self.state.interrupt_enabled.store(enabled, Ordering::Release);
  }
  fn buffer_overwritten(&self) -> bool {
    self.state.overwritten.load(Ordering::Acquire)
  }
}

impl ClockConfigurator for SimulatedAdc {
  fn program(&self, rate: SampleRate) -> Result<(), ClockLockError> {
    if self.state.fail_next_lock.swap(false, Ordering::AcqRel) {
      return Err(ClockLockError { status: 0x1 });
    }
    self.state.rate.store(rate.selector(), Ordering::Release);
    Ok(())
  }
  fn apply_default(&self) {
    self.state.rate.store(SampleRate::DEFAULT.selector(), Ordering::Release);
  }
}

/// Handle to the simulated interrupt thread. Stops the thread when dropped.
pub struct InterruptThread {
  stop: Arc<AtomicBool>,
  join: Option<JoinHandle<()>>,
}

impl InterruptThread {
  pub fn stop(mut self) {
    self.shutdown();
  }
  fn shutdown(&mut self) {
    self.stop.store(true, Ordering::Release);
    if let Some(join) = self.join.take() {
      if join.join().is_err() {
        error!("simulated interrupt thread panicked");
      }
    }
  }
}

impl Drop for InterruptThread {
  fn drop(&mut self) {
    self.shutdown();
  }
}

struct SawtoothGenerator {
  next: u16,
  noise_lsb: u16,
  rng: SmallRng,
  scratch: Vec<Sample>,
}

impl SawtoothGenerator {
  fn new(noise_lsb: u16) -> Self {
    Self { next: 0, noise_lsb, rng: SmallRng::from_entropy(), scratch: vec![] }
  }
  fn fill(&mut self, burst: &mut [u8]) {
    let count = burst.len() / WORD_BYTES * SAMPLES_PER_WORD;
    self.scratch.resize(count, 0);
    for sample in self.scratch.iter_mut() {
      let noise = if self.noise_lsb > 0 { self.rng.gen_range(0..=self.noise_lsb) } else { 0 };
      *sample = self.next.wrapping_add(noise) & SAMPLE_MAX;
      self.next = self.next.wrapping_add(1) & SAMPLE_MAX;
    }
    write_packed_samples(&self.scratch, burst);
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::samples_utils::PackedSamplesIterator;

  #[test]
  fn test_sample_rate_selectors() {
    assert_eq!(SampleRate::try_from(0u8).map(SampleRate::hz), Ok(200_000));
    assert_eq!(SampleRate::try_from(1u8).map(SampleRate::hz), Ok(500_000));
    assert_eq!(SampleRate::try_from(2u8).map(SampleRate::hz), Ok(1_000_000));
    assert_eq!(SampleRate::try_from(3u8).map(SampleRate::hz), Ok(2_000_000));
    assert_eq!(SampleRate::try_from(4u8), Err(InvalidSampleRate(4)));
  }

  #[test]
  fn test_clock_lock_failure_is_one_shot() {
    let adc = SimulatedAdc::new();
    adc.fail_next_clock_lock();
    assert!(adc.program(SampleRate::Ksps200).is_err());
    assert_eq!(adc.sample_rate(), SampleRate::DEFAULT);
    assert!(adc.program(SampleRate::Ksps200).is_ok());
    assert_eq!(adc.sample_rate(), SampleRate::Ksps200);
  }

  #[test]
  fn test_sawtooth_is_continuous_across_bursts() {
    let mut generator = SawtoothGenerator::new(0);
    let mut a = vec![0u8; 16];
    let mut b = vec![0u8; 16];
    generator.fill(&mut a);
    generator.fill(&mut b);
    let samples: Vec<Sample> = PackedSamplesIterator::new(&a).chain(PackedSamplesIterator::new(&b)).collect();
    assert_eq!(samples, (0..16).collect::<Vec<Sample>>());
  }
}
