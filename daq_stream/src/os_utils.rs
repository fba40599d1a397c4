use thread_priority::Error;

/// Moves the calling thread to the real-time FIFO class. Usually needs CAP_SYS_NICE.
#[cfg(target_family = "unix")]
pub fn set_current_thread_realtime(priority_hint: u8) -> Result<(), Error> {
  use thread_priority::thread_native_id;
  use thread_priority::unix::set_thread_priority_and_policy;
  use thread_priority::{RealtimeThreadSchedulePolicy, ThreadPriority, ThreadPriorityValue, ThreadSchedulePolicy};

  let priority = ThreadPriorityValue::try_from(priority_hint.min(99)).map_err(Error::Priority)?;
  set_thread_priority_and_policy(thread_native_id(),
    ThreadPriority::Crossplatform(priority),
    ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo)
  )
}

#[cfg(not(target_family = "unix"))]
pub fn set_current_thread_realtime(_priority_hint: u8) -> Result<(), Error> {
  thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max)
}
