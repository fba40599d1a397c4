// daq_stream
// Copyright (C) 2026 the daq_stream authors
// 
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
// 
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
// 
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.


//! daq_stream - acquisition and network streaming of FPGA ADC samples
//!
//! The server side keeps a lock-free byte FIFO between the hardware interrupt
//! (producer) and a single capture session (consumer), and streams the captured
//! bytes to one client at a time as counted 259-byte UDP datagrams. The client
//! side records where datagrams went missing so the samples can be rebuilt with
//! zero-filled gaps and a continuous time axis.
//!
//! Serving a simulated ADC until Ctrl+C:
//! ```no_run
//! use std::sync::Arc;
//! use daq_stream::{DaqServer, ServerConfig, SimulatedAdc};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!   let config = ServerConfig::default();
//!   let adc = SimulatedAdc::new();
//!   let (server, handler) = DaqServer::start(&config, Arc::new(adc.clone()), Arc::new(adc.clone())).await.unwrap();
//!   let _irq = adc.spawn(handler, config.burst_size).unwrap();
//!   let _ = tokio::signal::ctrl_c().await;
//!   server.shutdown().await;
//! }
//! ```
//!


mod capture;
mod common;
mod config;
mod daq_server;
mod hardware;
mod net_utils;
mod os_utils;
mod protocol;
mod receiver;
mod reconstruct;
mod ring_buffer;
mod samples_utils;
mod sender;

pub use capture::{CaptureDevice, CaptureError, CaptureSession, InterruptHandler, InterruptOutcome};
pub use common::{Sample, SAMPLE_MAX};
pub use config::{ClientConfig, ConfigError, ServerConfig, Transport};
pub use daq_server::{DaqServer, ServerError};
pub use hardware::{
  AcquisitionControl, ClockConfigurator, ClockLockError, InterruptThread, InvalidSampleRate, SampleRate, SimulatedAdc,
};
pub use protocol::{ControlMessage, PacketType, ProtocolError, DATA_PACKET_SIZE, DEFAULT_PORT, PAYLOAD_SIZE};
pub use receiver::{receive_tcp, Acquisition, GapRecord, GapTracker, StreamReceiver};
pub use reconstruct::{reconstruct, ReconstructError, SampleStream, SAMPLES_PER_PACKET};
pub use ring_buffer::{new_fifo, FifoError, FifoInput, FifoOutput};
pub use sender::{PeerStream, SenderState, StreamSender, TcpStreamSender};

pub mod utils {
  pub use crate::common::LogAndForget;
  pub use crate::os_utils::set_current_thread_realtime;
  pub use crate::samples_utils::{decode_word, encode_word, PackedSamplesIterator};
}


#[cfg(test)]
mod tests {
  #[test]
  fn test_license_header_names_crate_authors() {
    let header: Vec<&str> = include_str!("lib.rs").lines().take(5).collect();
    assert_eq!(header[0], format!("// {}", env!("CARGO_PKG_NAME")));
    assert!(header[1].starts_with("// Copyright (C) "));
    assert!(header[1].ends_with(&format!("the {} authors", env!("CARGO_PKG_NAME"))));
    assert!(header[4].contains("GNU General Public License"));
    assert_eq!(env!("CARGO_PKG_LICENSE"), "GPL-3.0-or-later");
  }
}
