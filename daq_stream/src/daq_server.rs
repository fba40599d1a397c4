use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast as broadcast_queue;
use tokio::task::JoinHandle;

use crate::capture::{CaptureDevice, CaptureError, InterruptHandler};
use crate::common::*;
use crate::config::{ConfigError, ServerConfig, Transport};
use crate::hardware::{AcquisitionControl, ClockConfigurator};
use crate::ring_buffer::FifoError;
use crate::sender::{StreamSender, TcpStreamSender};

#[derive(Error, Debug)]
pub enum ServerError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("cannot allocate fifo: {0}")]
  Fifo(#[from] FifoError),
  #[error("cannot apply startup sample rate: {0}")]
  Capture(#[from] CaptureError),
  #[error("cannot bind: {0}")]
  Bind(#[from] io::Error),
}

/// Capture device plus the sender task serving it
pub struct DaqServer {
  device: Arc<CaptureDevice>,
  local_addr: SocketAddr,
  shutdown_send: broadcast_queue::Sender<()>,
  task: JoinHandle<()>,
}

impl DaqServer {
  /// Returns the server together with the interrupt handler, which the caller
  /// must hand to whatever delivers hardware bursts.
  pub async fn start(
    config: &ServerConfig,
    control: Arc<dyn AcquisitionControl>,
    clock: Arc<dyn ClockConfigurator>,
  ) -> Result<(Self, InterruptHandler), ServerError> {
    config.validate()?;
    let (device, handler) = CaptureDevice::new(control, clock, config.fifo_capacity, config.element_size)?;
    device.set_sample_rate(config.sample_rate)?;

    let (shutdown_send, shutdown_recv) = broadcast_queue::channel(16);
    let addr = SocketAddr::new(IpAddr::V4(config.bind_ip), config.port);
    let not_bound = || io::Error::new(io::ErrorKind::Interrupted, "shut down before binding");
    let (local_addr, task) = match config.transport {
      Transport::Udp => {
        let sender = StreamSender::bind(addr, device.clone(), config.poll_timeout(), shutdown_recv).await.ok_or_else(not_bound)?;
        (sender.local_addr()?, tokio::spawn(sender.run()))
      }
      Transport::Tcp => {
        let sender = TcpStreamSender::bind(addr, device.clone(), config.poll_timeout(), shutdown_recv).await.ok_or_else(not_bound)?;
        (sender.local_addr()?, tokio::spawn(sender.run()))
      }
    };
    info!("{:?} server spawned on {local_addr}", config.transport);

    Ok((Self { device, local_addr, shutdown_send, task }, handler))
  }

  pub fn device(&self) -> &Arc<CaptureDevice> {
    &self.device
  }
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub async fn shutdown(self) {
    info!("shutting down");
    self.shutdown_send.send(()).log_and_forget();
    if let Err(e) = self.task.await {
      error!("sender task failed: {e:?}");
    }
    info!("shutdown ok");
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::hardware::{SampleRate, SimulatedAdc};
  use std::net::Ipv4Addr;
  use std::time::Duration;
  use tokio::io::AsyncReadExt;
  use tokio::net::{TcpStream, UdpSocket};

  fn loopback_config(transport: Transport) -> ServerConfig {
    ServerConfig {
      bind_ip: Ipv4Addr::LOCALHOST,
      port: 0,
      transport,
      sample_rate: SampleRate::Ksps200.selector(),
      fifo_capacity: 16384,
      burst_size: 1024,
      ..Default::default()
    }
  }

  #[tokio::test(flavor = "current_thread")]
  async fn test_udp_server_streams_and_shuts_down() {
    let adc = SimulatedAdc::new();
    let (server, handler) = DaqServer::start(&loopback_config(Transport::Udp), Arc::new(adc.clone()), Arc::new(adc.clone())).await.unwrap();
    assert_eq!(adc.sample_rate(), SampleRate::Ksps200);
    let irq = adc.spawn(handler, 1024).unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&[0], server.local_addr()).await.unwrap();
    let mut buf = [0u8; 512];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(len, 259);
    assert_eq!(&buf[..3], &[2, 0, 0]);
    assert!(server.device().is_open());

    let device = server.device().clone();
    server.shutdown().await;
    assert!(!device.is_open());
    irq.stop();
  }

  #[tokio::test(flavor = "current_thread")]
  async fn test_tcp_server() {
    let adc = SimulatedAdc::new();
    let (server, handler) = DaqServer::start(&loopback_config(Transport::Tcp), Arc::new(adc.clone()), Arc::new(adc.clone())).await.unwrap();
    let irq = adc.spawn(handler, 1024).unwrap();
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut buf = [0u8; 1024];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf)).await.unwrap().unwrap();
    server.shutdown().await;
    irq.stop();
  }

  #[tokio::test(flavor = "current_thread")]
  async fn test_invalid_config_is_rejected() {
    let adc = SimulatedAdc::new();
    let config = ServerConfig { sample_rate: 7, ..loopback_config(Transport::Udp) };
    let r = DaqServer::start(&config, Arc::new(adc.clone()), Arc::new(adc)).await;
    assert!(matches!(r, Err(ServerError::Config(_))));
  }
}
