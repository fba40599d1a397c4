pub use log::{debug, error, info, trace, warn};

/// Unsigned 12-bit ADC sample, widened for storage
pub type Sample = u16;

/// Maximum value a 12-bit ADC sample can take
pub const SAMPLE_MAX: Sample = 0x0fff;

pub trait LogAndForget {
  fn log_and_forget(&self);
}

impl<T, E: std::fmt::Debug> LogAndForget for Result<T, E> {
  fn log_and_forget(&self) {
    if let Err(e) = self {
      warn!("Encountered error {e:?} at {:?}", std::backtrace::Backtrace::capture());
    }
  }
}
