//! Capture device and the single capture session that may be open on it.
//!
//! The device owns the consumer side of the FIFO, the [`InterruptHandler`] owns
//! the producer side. Opening the device takes an exclusivity token through a
//! compare-and-swap on the device state; the session gives it back when dropped.

use std::sync::atomic::{AtomicBool, AtomicU8};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use atomic::Ordering;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::common::*;
use crate::hardware::{AcquisitionControl, ClockConfigurator, InvalidSampleRate, SampleRate};
use crate::ring_buffer::{new_fifo, FifoError, FifoInput, FifoOutput};

const STATE_CLOSED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_CONFIGURING: u8 = 2;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureError {
  #[error("capture device is busy")]
  Busy,
  #[error("no aligned data available")]
  WouldBlock,
  #[error(transparent)]
  InvalidSampleRate(#[from] InvalidSampleRate),
  #[error(transparent)]
  Fifo(FifoError),
}

impl From<FifoError> for CaptureError {
  fn from(e: FifoError) -> Self {
    match e {
      FifoError::WouldBlock => Self::WouldBlock,
      other => Self::Fifo(other),
    }
  }
}

/// State the interrupt producer and the consumer both look at
struct CaptureShared {
  state: AtomicU8,
  allowed_to_read: AtomicBool,
  readable: Notify,
}

/// What happened to a burst handed to [`InterruptHandler::on_interrupt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
  /// no session open, burst acknowledged and discarded
  Ignored,
  /// not enough room in the FIFO
  Dropped,
  Stored,
}

/// Producer side, runs in the interrupt context. Never blocks, never allocates.
pub struct InterruptHandler {
  input: FifoInput,
  shared: Arc<CaptureShared>,
  control: Arc<dyn AcquisitionControl>,
}

impl InterruptHandler {
  pub fn on_interrupt(&mut self, burst: &[u8]) -> InterruptOutcome {
    if !self.shared.allowed_to_read.load(Ordering::Acquire) {
      return InterruptOutcome::Ignored;
    }

    let overflowing = self.input.avail() < burst.len();
    match self.input.set_overflowing(overflowing) {
      Some(true) => warn!("started overflowing, dropping data: no space in fifo"),
      Some(false) => info!("stopped overflowing"),
      None => {}
    }

    let outcome = if overflowing {
      InterruptOutcome::Dropped
    } else {
      match self.input.push(burst) {
        Ok(()) => {
          if self.control.buffer_overwritten() {
            warn!("FPGA buffer might be overwritten, interrupt was too slow");
          }
          InterruptOutcome::Stored
        }
        Err(_) => InterruptOutcome::Dropped,
      }
    };

    self.shared.readable.notify_one();
    outcome
  }
}

pub struct CaptureDevice {
  shared: Arc<CaptureShared>,
  output: Mutex<FifoOutput>,
  control: Arc<dyn AcquisitionControl>,
  clock: Arc<dyn ClockConfigurator>,
  sample_rate: AtomicU8,
}

impl CaptureDevice {
  /// Allocates the FIFO and returns the device together with the handler
  /// that must be wired to the hardware interrupt.
  pub fn new(
    control: Arc<dyn AcquisitionControl>,
    clock: Arc<dyn ClockConfigurator>,
    fifo_capacity: usize,
    element_size: usize,
  ) -> Result<(Arc<Self>, InterruptHandler), FifoError> {
    let (input, output) = new_fifo(fifo_capacity, element_size)?;
    let shared = Arc::new(CaptureShared {
      state: STATE_CLOSED.into(),
      allowed_to_read: false.into(),
      readable: Notify::new(),
    });
    control.set_interrupt_enabled(false);
    let handler = InterruptHandler { input, shared: shared.clone(), control: control.clone() };
    let device = Arc::new(Self {
      shared,
      output: Mutex::new(output),
      control,
      clock,
      sample_rate: SampleRate::DEFAULT.selector().into(),
    });
    Ok((device, handler))
  }

  fn lock_output(&self) -> MutexGuard<'_, FifoOutput> {
    self.output.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn is_open(&self) -> bool {
    self.shared.state.load(Ordering::Acquire) == STATE_RUNNING
  }

  pub fn sample_rate(&self) -> SampleRate {
    SampleRate::try_from(self.sample_rate.load(Ordering::Acquire)).unwrap_or(SampleRate::DEFAULT)
  }

  /// Starts acquisition. Fails with [`CaptureError::Busy`] without side effects
  /// if a session is already open.
  pub fn open(self: &Arc<Self>) -> Result<CaptureSession, CaptureError> {
    if self.shared.state.compare_exchange(STATE_CLOSED, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire).is_err() {
      return Err(CaptureError::Busy);
    }

    self.control.pulse_clear();
    {
      let mut output = self.lock_output();
      output.reset_out();
      output.reset_overflow();
    }
    self.shared.allowed_to_read.store(true, Ordering::Release);
    self.control.set_interrupt_enabled(true);
    self.control.set_running(true);
    info!("capture session opened at {} Sa/s", self.sample_rate().hz());

    Ok(CaptureSession { device: self.clone() })
  }

  fn release(&self) {
    // gate the producer first so an interrupt racing with the disable is a no-op
    self.shared.allowed_to_read.store(false, Ordering::Release);
    self.control.set_interrupt_enabled(false);
    self.control.set_running(false);
    let dropped = self.lock_output().dropped_bursts();
    if dropped > 0 {
      warn!("capture session dropped {dropped} bursts due to fifo overflow");
    }
    self.shared.state.store(STATE_CLOSED, Ordering::Release);
    info!("capture session released");
  }

  /// Reprograms the sample clock. Only possible while no session is open.
  ///
  /// A clock that fails to lock is not an error for the caller: the default
  /// configuration is restored and returned instead.
  pub fn set_sample_rate(&self, selector: u8) -> Result<SampleRate, CaptureError> {
    let rate = SampleRate::try_from(selector)?;
    if self.shared.state.compare_exchange(STATE_CLOSED, STATE_CONFIGURING, Ordering::AcqRel, Ordering::Acquire).is_err() {
      return Err(CaptureError::Busy);
    }
    let applied = match self.clock.program(rate) {
      Ok(()) => {
        info!("sample rate set to {} Sa/s", rate.hz());
        rate
      }
      Err(e) => {
        error!("error configuring clock: {e}, falling back to default configuration");
        self.clock.apply_default();
        SampleRate::DEFAULT
      }
    };
    self.sample_rate.store(applied.selector(), Ordering::Release);
    self.shared.state.store(STATE_CLOSED, Ordering::Release);
    Ok(applied)
  }
}

/// An open acquisition. Dropping it stops the hardware and frees the device.
pub struct CaptureSession {
  device: Arc<CaptureDevice>,
}

impl CaptureSession {
  /// Non-blocking read of up to `dst.len()` bytes, always a multiple of the element size.
  pub fn read(&mut self, dst: &mut [u8]) -> Result<usize, CaptureError> {
    Ok(self.device.lock_output().pop_aligned(dst)?)
  }

  pub fn readable(&self) -> bool {
    self.device.lock_output().aligned_len() > 0
  }

  /// Resolves once aligned data is available
  pub async fn wait_readable(&self) {
    loop {
      if self.readable() {
        return;
      }
      // notify_one leaves a permit behind, so a wake-up between the check and here is not lost
      self.device.shared.readable.notified().await;
    }
  }

  /// Returns false if nothing became readable within `timeout`
  pub async fn wait_readable_timeout(&self, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, self.wait_readable()).await.is_ok()
  }

  /// Returns false if nothing became readable before `deadline`
  pub async fn wait_readable_until(&self, deadline: Instant) -> bool {
    tokio::time::timeout_at(deadline, self.wait_readable()).await.is_ok()
  }

  pub fn sample_rate(&self) -> SampleRate {
    self.device.sample_rate()
  }
  pub fn overflowing(&self) -> bool {
    self.device.lock_output().overflowing()
  }
  pub fn dropped_bursts(&self) -> usize {
    self.device.lock_output().dropped_bursts()
  }

  pub fn release(self) {
    drop(self);
  }
}

impl Drop for CaptureSession {
  fn drop(&mut self) {
    self.device.release();
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::hardware::SimulatedAdc;
  use std::thread;

  fn make_device(capacity: usize) -> (SimulatedAdc, Arc<CaptureDevice>, InterruptHandler) {
    let adc = SimulatedAdc::new();
    let (device, handler) = CaptureDevice::new(Arc::new(adc.clone()), Arc::new(adc.clone()), capacity, 4).unwrap();
    (adc, device, handler)
  }

  #[test]
  fn test_second_open_is_busy_until_release() {
    let (_adc, device, _handler) = make_device(64);
    let session = device.open().unwrap();
    assert_eq!(device.open().err(), Some(CaptureError::Busy));
    session.release();
    assert!(!device.is_open());
    let again = device.open();
    assert!(again.is_ok());
  }

  #[test]
  fn test_open_and_release_drive_hardware() {
    let (adc, device, _handler) = make_device(64);
    assert!(!adc.interrupt_enabled());
    let session = device.open().unwrap();
    assert_eq!(adc.clear_pulses(), 1);
    assert!(adc.is_running());
    assert!(adc.interrupt_enabled());
    drop(session);
    assert!(!adc.is_running());
    assert!(!adc.interrupt_enabled());
    // a refused open leaves the hardware alone
    let _session = device.open().unwrap();
    let _ = device.open();
    assert_eq!(adc.clear_pulses(), 2);
  }

  #[test]
  fn test_interrupt_ignored_while_closed() {
    let (_adc, device, mut handler) = make_device(64);
    assert_eq!(handler.on_interrupt(&[1; 16]), InterruptOutcome::Ignored);
    let mut session = device.open().unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(session.read(&mut buf), Err(CaptureError::WouldBlock));
  }

  #[test]
  fn test_read_is_aligned_and_nonblocking() {
    let (_adc, device, mut handler) = make_device(64);
    let mut session = device.open().unwrap();
    assert_eq!(handler.on_interrupt(&[7; 16]), InterruptOutcome::Stored);
    assert!(session.readable());
    let mut buf = [0u8; 10];
    assert_eq!(session.read(&mut buf), Ok(8));
    assert_eq!(session.read(&mut buf), Ok(8));
    assert_eq!(session.read(&mut buf), Err(CaptureError::WouldBlock));
    assert!(!session.readable());
  }

  #[test]
  fn test_stale_data_discarded_on_open() {
    let (_adc, device, mut handler) = make_device(64);
    let session = device.open().unwrap();
    handler.on_interrupt(&[1; 16]);
    session.release();
    let mut session = device.open().unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(session.read(&mut buf), Err(CaptureError::WouldBlock));
    handler.on_interrupt(&[2; 16]);
    assert_eq!(session.read(&mut buf), Ok(16));
    assert_eq!(&buf[..16], &[2; 16]);
  }

  #[test]
  fn test_overflow_drops_whole_burst() {
    let (_adc, device, mut handler) = make_device(64);
    let mut session = device.open().unwrap();
    assert_eq!(handler.on_interrupt(&[1; 32]), InterruptOutcome::Stored);
    assert_eq!(handler.on_interrupt(&[2; 24]), InterruptOutcome::Stored);
    assert_eq!(handler.on_interrupt(&[3; 16]), InterruptOutcome::Dropped);
    assert!(session.overflowing());
    assert_eq!(session.dropped_bursts(), 1);
    let mut buf = [0u8; 64];
    assert_eq!(session.read(&mut buf), Ok(56));
    assert_eq!(handler.on_interrupt(&[4; 16]), InterruptOutcome::Stored);
    assert!(!session.overflowing());
  }

  #[test]
  fn test_sample_rate_rejected_while_running() {
    let (adc, device, _handler) = make_device(64);
    let session = device.open().unwrap();
    assert_eq!(device.set_sample_rate(1), Err(CaptureError::Busy));
    drop(session);
    assert_eq!(device.set_sample_rate(1), Ok(SampleRate::Ksps500));
    assert_eq!(adc.sample_rate(), SampleRate::Ksps500);
    assert_eq!(device.sample_rate(), SampleRate::Ksps500);
  }

  #[test]
  fn test_sample_rate_validation_and_fallback() {
    let (adc, device, _handler) = make_device(64);
    assert_eq!(device.set_sample_rate(4), Err(CaptureError::InvalidSampleRate(InvalidSampleRate(4))));
    adc.fail_next_clock_lock();
    assert_eq!(device.set_sample_rate(0), Ok(SampleRate::DEFAULT));
    assert_eq!(adc.sample_rate(), SampleRate::DEFAULT);
    // device is usable afterwards
    assert!(device.open().is_ok());
  }

  #[tokio::test(flavor = "current_thread")]
  async fn test_wait_readable_wakes_on_interrupt() {
    let (_adc, device, mut handler) = make_device(64);
    let session = device.open().unwrap();
    assert!(!session.wait_readable_timeout(Duration::from_millis(20)).await);
    let producer = thread::spawn(move || {
      thread::sleep(Duration::from_millis(50));
      handler.on_interrupt(&[5; 8])
    });
    assert!(session.wait_readable_timeout(Duration::from_secs(5)).await);
    assert_eq!(producer.join().unwrap(), InterruptOutcome::Stored);
  }

  #[tokio::test(flavor = "current_thread")]
  async fn test_wait_readable_until_keeps_deadline() {
    let (_adc, device, mut handler) = make_device(64);
    let session = device.open().unwrap();
    let deadline = Instant::now() + Duration::from_millis(100);
    assert!(!session.wait_readable_until(deadline).await);
    assert!(Instant::now() >= deadline);
    // a passed deadline still reports data that is already there
    handler.on_interrupt(&[5; 8]);
    assert!(session.wait_readable_until(deadline).await);
  }
}
