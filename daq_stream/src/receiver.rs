//! Client side: requests a stream, collects payload bytes and records where
//! packets went missing so the offline pass can zero-fill them.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::broadcast::Receiver as BroadcastReceiver;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::time::timeout;

use crate::common::*;
use crate::hardware::SampleRate;
use crate::net_utils::MTU;
use crate::protocol::{lost_packets, next_counter, parse_data_packet, ControlMessage, DATA_PACKET_SIZE};
use crate::reconstruct::{reconstruct, ReconstructError, SampleStream};

/// Missing packets detected while receiving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapRecord {
  /// offset into the accumulated payload bytes where the missing packets belong
  pub offset: usize,
  pub lost: u16,
}

/// Sequence-gap detection over the 16-bit packet counter
#[derive(Debug, Clone)]
pub struct GapTracker {
  expected: u16,
  gaps: Vec<GapRecord>,
  lost_total: u64,
}

impl GapTracker {
  pub fn new() -> Self {
    Self { expected: 0, gaps: vec![], lost_total: 0 }
  }

  /// Feeds the counter of a received packet whose payload will be appended at `offset`
  pub fn observe(&mut self, counter: u16, offset: usize) -> Option<GapRecord> {
    let gap = if counter != self.expected {
      let record = GapRecord { offset, lost: lost_packets(self.expected, counter) };
      self.gaps.push(record);
      self.lost_total += record.lost as u64;
      Some(record)
    } else {
      None
    };
    self.expected = next_counter(counter);
    gap
  }

  pub fn expected(&self) -> u16 {
    self.expected
  }
  pub fn gaps(&self) -> &[GapRecord] {
    &self.gaps
  }
  pub fn lost_total(&self) -> u64 {
    self.lost_total
  }
  pub fn into_gaps(self) -> Vec<GapRecord> {
    self.gaps
  }
}

impl Default for GapTracker {
  fn default() -> Self {
    Self::new()
  }
}

/// Everything collected during one streaming session
#[derive(Debug, Clone)]
pub struct Acquisition {
  pub data: Vec<u8>,
  pub gaps: Vec<GapRecord>,
  pub sample_rate: SampleRate,
  pub packets_received: u64,
}

impl Acquisition {
  pub fn lost_packets(&self) -> u64 {
    self.gaps.iter().map(|gap| gap.lost as u64).sum()
  }
  pub fn reconstruct(&self) -> Result<SampleStream, ReconstructError> {
    reconstruct(&self.data, &self.gaps, self.sample_rate.hz())
  }
}

fn unspecified_for(server: &SocketAddr) -> SocketAddr {
  match server {
    SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
    SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
  }
}

/// Unconnected UDP socket of the server's family with SO_RCVBUF raised as far as the OS allows
fn bind_client_socket(server: &SocketAddr, receive_buffer_size: usize) -> io::Result<UdpSocket> {
  let socket = Socket::new(Domain::for_address(*server), Type::DGRAM, Some(Protocol::UDP))?;
  if let Err(e) = socket.set_recv_buffer_size(receive_buffer_size) {
    warn!("cannot set receive buffer size to {receive_buffer_size}: {e:?}");
  }
  let actual = socket.recv_buffer_size()?;
  if actual < receive_buffer_size {
    warn!("receive buffer is {actual} bytes instead of {receive_buffer_size}, might experience packet loss");
  } else {
    debug!("receive buffer is {actual} bytes");
  }
  socket.set_nonblocking(true)?;
  socket.bind(&unspecified_for(server).into())?;
  UdpSocket::from_std(socket.into())
}

pub struct StreamReceiver {
  socket: UdpSocket,
  server: SocketAddr,
  sample_rate: SampleRate,
  receive_timeout: Duration,
  stop: BroadcastReceiver<()>,
  tracker: GapTracker,
  data: Vec<u8>,
  packets_received: u64,
}

impl StreamReceiver {
  /// Sends the Connect datagram. `sample_rate` of `None` keeps whatever the server runs at,
  /// which is assumed to be the power-up default for the time axis.
  pub async fn connect(
    server: SocketAddr,
    sample_rate: Option<SampleRate>,
    receive_timeout: Duration,
    receive_buffer_size: usize,
    stop: BroadcastReceiver<()>,
  ) -> io::Result<Self> {
    let socket = bind_client_socket(&server, receive_buffer_size)?;
    socket.connect(server).await?;
    let connect = ControlMessage::Connect { sample_rate }.encode();
    let sent = socket.send(&connect).await?;
    if sent != connect.len() {
      return Err(io::Error::new(io::ErrorKind::WriteZero, format!("didn't send full connect datagram: {sent}")));
    }
    info!("requested stream from {server}");
    Ok(Self {
      socket,
      server,
      sample_rate: sample_rate.unwrap_or(SampleRate::DEFAULT),
      receive_timeout,
      stop,
      tracker: GapTracker::new(),
      data: vec![],
      packets_received: 0,
    })
  }

  fn handle_packet(&mut self, packet: &[u8]) {
    let parsed = match parse_data_packet(packet) {
      Ok(p) => p,
      Err(e) => {
        warn!("ignoring packet: {e}");
        return;
      }
    };
    if let Some(gap) = self.tracker.observe(parsed.counter, self.data.len()) {
      debug!("at {} lost {}", gap.offset, gap.lost);
    }
    self.data.extend_from_slice(parsed.payload);
    self.packets_received += 1;
  }

  /// SO_RCVBUF as granted by the OS. Linux reports double the usable size.
  pub fn receive_buffer_size(&self) -> io::Result<usize> {
    SockRef::from(&self.socket).recv_buffer_size()
  }

  /// Receives until the per-packet timeout expires, the socket fails or `stop` fires,
  /// then sends Disconnect and hands back what was collected.
  pub async fn run(mut self) -> Acquisition {
    let mut buf = [0u8; MTU];
    loop {
      select! {
        r = timeout(self.receive_timeout, self.socket.recv(&mut buf)) => {
          match r {
            Ok(Ok(len)) => {
              if len != DATA_PACKET_SIZE {
                warn!("didn't receive full packet: {len}");
                continue;
              }
              self.handle_packet(&buf[..len]);
            },
            Ok(Err(e)) => {
              error!("error reading from socket: {e:?}");
              break;
            },
            Err(_) => {
              warn!("request timed out");
              break;
            }
          }
        },
        _ = self.stop.recv() => {
          info!("stop requested");
          break;
        }
      }
    }

    if let Err(e) = self.socket.send(&ControlMessage::Disconnect.encode()).await {
      error!("error occured when disconnecting from {}: {e:?}", self.server);
    }
    info!(
      "received {} packets ({} bytes), lost {} packets in {} gaps",
      self.packets_received, self.data.len(), self.tracker.lost_total(), self.tracker.gaps().len()
    );
    Acquisition {
      data: self.data,
      gaps: self.tracker.into_gaps(),
      sample_rate: self.sample_rate,
      packets_received: self.packets_received,
    }
  }
}

/// Stream transport variant: raw payload bytes, no counters, so no gaps can be detected.
pub async fn receive_tcp(
  server: SocketAddr,
  sample_rate: SampleRate,
  receive_timeout: Duration,
  mut stop: BroadcastReceiver<()>,
) -> io::Result<Acquisition> {
  let mut stream = TcpStream::connect(server).await?;
  info!("connected to {server}");
  let mut data = vec![];
  let mut buf = [0u8; MTU];
  let mut reads = 0u64;
  loop {
    select! {
      r = timeout(receive_timeout, stream.read(&mut buf)) => {
        match r {
          Ok(Ok(0)) => {
            info!("server closed the connection");
            break;
          },
          Ok(Ok(len)) => {
            data.extend_from_slice(&buf[..len]);
            reads += 1;
          },
          Ok(Err(e)) => {
            error!("error reading from socket: {e:?}");
            break;
          },
          Err(_) => {
            warn!("request timed out");
            break;
          }
        }
      },
      _ = stop.recv() => {
        info!("stop requested");
        break;
      }
    }
  }
  // a torn word at the end would shift every later sample
  data.truncate(data.len() - data.len() % crate::samples_utils::WORD_BYTES);
  Ok(Acquisition { data, gaps: vec![], sample_rate, packets_received: reads })
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::{make_data_packet, PAYLOAD_SIZE};
  use crate::config::DEFAULT_RECEIVE_BUFFER_SIZE;
  use tokio::sync::broadcast;

  #[test]
  fn test_no_gap_on_normal_increment() {
    let mut tracker = GapTracker::new();
    for (i, counter) in (0..5u16).enumerate() {
      assert_eq!(tracker.observe(counter, i * PAYLOAD_SIZE), None);
    }
    assert!(tracker.gaps().is_empty());
    assert_eq!(tracker.expected(), 5);
  }

  #[test]
  fn test_gap_across_wraparound() {
    let mut tracker = GapTracker { expected: 0xFFFE, gaps: vec![], lost_total: 0 };
    assert_eq!(tracker.observe(0xFFFE, 0), None);
    assert_eq!(tracker.observe(0x0001, 256), Some(GapRecord { offset: 256, lost: 2 }));
    assert_eq!(tracker.expected(), 2);
    assert_eq!(tracker.lost_total(), 2);
  }

  #[test]
  fn test_wrap_at_max_counter_is_not_a_gap() {
    let mut tracker = GapTracker { expected: 0xFFFF, gaps: vec![], lost_total: 0 };
    assert_eq!(tracker.observe(0xFFFF, 0), None);
    assert_eq!(tracker.observe(0x0000, 256), None);
    assert!(tracker.gaps().is_empty());
  }

  #[test]
  fn test_first_packet_not_zero_is_a_gap() {
    let mut tracker = GapTracker::new();
    assert_eq!(tracker.observe(3, 0), Some(GapRecord { offset: 0, lost: 3 }));
    assert_eq!(tracker.observe(4, 256), None);
  }

  async fn send_packet(socket: &UdpSocket, dst: SocketAddr, counter: u16, fill: u8) {
    let mut buf = [0u8; DATA_PACKET_SIZE];
    let packet = make_data_packet(&mut buf, counter, &[fill; PAYLOAD_SIZE]);
    socket.send_to(packet, dst).await.unwrap();
  }

  #[tokio::test(flavor = "current_thread")]
  async fn test_receive_records_gaps_and_disconnects() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let (_stop_tx, stop_rx) = broadcast::channel(1);
    let receiver = StreamReceiver::connect(server_addr, Some(SampleRate::Msps1), Duration::from_millis(200), DEFAULT_RECEIVE_BUFFER_SIZE, stop_rx).await.unwrap();

    let mut buf = [0u8; 16];
    let (len, client) = server.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], &[0, 2]);

    send_packet(&server, client, 0, 1).await;
    send_packet(&server, client, 1, 2).await;
    server.send_to(&[2, 2, 0], client).await.unwrap(); // truncated, ignored
    send_packet(&server, client, 3, 4).await;

    let acquisition = receiver.run().await;
    assert_eq!(acquisition.data.len(), 3 * PAYLOAD_SIZE);
    assert_eq!(acquisition.gaps, vec![GapRecord { offset: 2 * PAYLOAD_SIZE, lost: 1 }]);
    assert_eq!(acquisition.packets_received, 3);
    assert_eq!(acquisition.sample_rate, SampleRate::Msps1);
    assert_eq!(&acquisition.data[2 * PAYLOAD_SIZE..][..4], &[4, 4, 4, 4]);

    let (len, _) = server.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], &[1]);
  }

  #[tokio::test(flavor = "current_thread")]
  async fn test_stop_signal_ends_receive() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (stop_tx, stop_rx) = broadcast::channel(1);
    let receiver = StreamReceiver::connect(server.local_addr().unwrap(), None, Duration::from_secs(30), DEFAULT_RECEIVE_BUFFER_SIZE, stop_rx).await.unwrap();
    stop_tx.send(()).unwrap();
    let acquisition = timeout(Duration::from_secs(5), receiver.run()).await.unwrap();
    assert!(acquisition.data.is_empty());
    assert_eq!(acquisition.sample_rate, SampleRate::DEFAULT);

    let mut buf = [0u8; 16];
    let (len, _) = server.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], &[0]);
    let (len, _) = server.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], &[1]);
  }

  #[tokio::test(flavor = "current_thread")]
  async fn test_receive_buffer_size_is_requested() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (_stop_tx, stop_rx) = broadcast::channel(1);
    let receiver = StreamReceiver::connect(server.local_addr().unwrap(), None, Duration::from_secs(1), 64 * 1024, stop_rx).await.unwrap();
    assert!(receiver.receive_buffer_size().unwrap() >= 64 * 1024);
  }

  #[tokio::test(flavor = "current_thread")]
  async fn test_oversized_receive_buffer_falls_back() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (_stop_tx, stop_rx) = broadcast::channel(1);
    // usually above the OS limit, which only costs a warning
    let receiver = StreamReceiver::connect(server.local_addr().unwrap(), None, Duration::from_secs(1), DEFAULT_RECEIVE_BUFFER_SIZE, stop_rx).await.unwrap();
    assert!(receiver.receive_buffer_size().unwrap() > 0);

    let mut buf = [0u8; 16];
    let (len, _) = server.recv_from(&mut buf).await.unwrap();
    assert_eq!(ControlMessage::parse(&buf[..len]).unwrap(), ControlMessage::Connect { sample_rate: None });
  }
}
