//! Server side of the stream: waits for a client, opens the capture session
//! on its behalf and packetizes whatever the FIFO yields.
//!
//! ```text
//!            Connect                 Disconnect / poll timeout / socket error
//! Listening ─────────> Streaming ───────────────────────────────> Listening
//!     │                    │
//!     └──── shutdown ──────┴──────────────> Shutdown
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::broadcast::Receiver as BroadcastReceiver;
use tokio::time::{sleep, Instant};

use crate::capture::{CaptureDevice, CaptureError, CaptureSession};
use crate::common::*;
use crate::net_utils::{bind_tcp, bind_udp, MTU};
use crate::protocol::{make_data_packet, next_counter, ControlMessage, DATA_PACKET_SIZE, PAYLOAD_SIZE};

/// Packets sent per wake-up before control datagrams get another look
const MAX_PACKETS_PER_WAKEUP: usize = 64;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Per-client streaming state
pub struct PeerStream {
  peer: SocketAddr,
  session: CaptureSession,
  counter: u16,
  payload: [u8; PAYLOAD_SIZE],
  fill: usize,
  packet: [u8; DATA_PACKET_SIZE],
  packets_sent: u64,
}

impl PeerStream {
  fn new(peer: SocketAddr, session: CaptureSession) -> Self {
    Self {
      peer,
      session,
      counter: 0,
      payload: [0; PAYLOAD_SIZE],
      fill: 0,
      packet: [0; DATA_PACKET_SIZE],
      packets_sent: 0,
    }
  }
  pub fn peer(&self) -> SocketAddr {
    self.peer
  }
  pub fn packets_sent(&self) -> u64 {
    self.packets_sent
  }
}

pub enum SenderState {
  Listening,
  Streaming(PeerStream),
  Shutdown,
}

impl SenderState {
  pub fn peer(&self) -> Option<SocketAddr> {
    match self {
      Self::Streaming(stream) => Some(stream.peer),
      _ => None,
    }
  }
}

impl std::fmt::Debug for SenderState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Listening => write!(f, "Listening"),
      Self::Streaming(stream) => write!(f, "Streaming({})", stream.peer),
      Self::Shutdown => write!(f, "Shutdown"),
    }
  }
}

pub struct StreamSender {
  socket: UdpSocket,
  device: Arc<CaptureDevice>,
  poll_timeout: Duration,
  shutdown: BroadcastReceiver<()>,
  recv_buff: [u8; MTU],
}

impl StreamSender {
  /// `None` if shutdown was requested before the socket could be bound
  pub async fn bind(
    addr: SocketAddr,
    device: Arc<CaptureDevice>,
    poll_timeout: Duration,
    mut shutdown: BroadcastReceiver<()>,
  ) -> Option<Self> {
    let socket = bind_udp(addr, &mut shutdown).await?;
    Some(Self { socket, device, poll_timeout, shutdown, recv_buff: [0; MTU] })
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.socket.local_addr()
  }

  pub async fn run(mut self) {
    match self.local_addr() {
      Ok(addr) => info!("stream sender listening on {addr}"),
      Err(e) => warn!("stream sender listening on unknown address: {e:?}"),
    }
    let mut state = SenderState::Listening;
    loop {
      state = self.step(state).await;
      debug!("sender state: {state:?}");
      if let SenderState::Shutdown = state {
        break;
      }
    }
    info!("stream sender shut down");
  }

  pub async fn step(&mut self, state: SenderState) -> SenderState {
    match state {
      SenderState::Listening => self.listen().await,
      SenderState::Streaming(stream) => self.stream(stream).await,
      SenderState::Shutdown => SenderState::Shutdown,
    }
  }

  fn handle_connect(&self, src: SocketAddr, sample_rate: Option<crate::hardware::SampleRate>) -> Option<PeerStream> {
    info!("connect request from {src}");
    if let Some(rate) = sample_rate {
      match self.device.set_sample_rate(rate.selector()) {
        Ok(applied) if applied != rate => warn!("requested {} Sa/s, running at {} Sa/s", rate.hz(), applied.hz()),
        Ok(_) => {}
        Err(e) => warn!("cannot change sample rate: {e}"),
      }
    }
    match self.device.open() {
      Ok(session) => {
        info!("streaming to {src}");
        Some(PeerStream::new(src, session))
      }
      Err(e) => {
        error!("cannot open capture device for {src}: {e}");
        None
      }
    }
  }

  async fn listen(&mut self) -> SenderState {
    loop {
      let (len, src) = select! {
        r = self.socket.recv_from(&mut self.recv_buff) => {
          match r {
            Ok(v) => v,
            Err(e) => {
              error!("error receiving from socket: {e:?}");
              sleep(RECV_ERROR_BACKOFF).await;
              continue;
            }
          }
        },
        _ = self.shutdown.recv() => {
          return SenderState::Shutdown;
        }
      };
      match ControlMessage::parse(&self.recv_buff[..len]) {
        Ok(ControlMessage::Connect { sample_rate }) => {
          if let Some(stream) = self.handle_connect(src, sample_rate) {
            return SenderState::Streaming(stream);
          }
        }
        Ok(ControlMessage::Disconnect) => debug!("disconnect from {src} while not streaming, ignoring"),
        Err(e) => warn!("ignoring datagram from {src}: {e} ({})", hex::encode(&self.recv_buff[..len.min(16)])),
      }
    }
  }

  async fn stream(&mut self, mut stream: PeerStream) -> SenderState {
    // only capture data moves the deadline, control traffic does not
    let mut deadline = Instant::now() + self.poll_timeout;
    loop {
      select! {
        r = self.socket.recv_from(&mut self.recv_buff) => {
          match r {
            Ok((len, src)) if src == stream.peer => {
              match ControlMessage::parse(&self.recv_buff[..len]) {
                Ok(ControlMessage::Disconnect) => {
                  info!("{src} disconnected after {} packets", stream.packets_sent);
                  return SenderState::Listening;
                },
                Ok(ControlMessage::Connect { .. }) => debug!("{src} is already streaming"),
                Err(e) => warn!("ignoring datagram from {src}: {e}"),
              }
            },
            Ok((_, src)) => {
              warn!("ignoring datagram from {src}, busy streaming to {}", stream.peer);
            },
            Err(e) => {
              error!("error receiving from socket: {e:?}, closing session with {}", stream.peer);
              return SenderState::Listening;
            }
          }
        },
        ready = stream.session.wait_readable_until(deadline) => {
          if !ready {
            warn!("no data from capture device for {:?}, closing session with {}", self.poll_timeout, stream.peer);
            return SenderState::Listening;
          }
          if let Err(e) = self.send_available(&mut stream).await {
            error!("error sending to {}: {e:?}", stream.peer);
            return SenderState::Listening;
          }
          deadline = Instant::now() + self.poll_timeout;
        },
        _ = self.shutdown.recv() => {
          return SenderState::Shutdown;
        }
      }
    }
  }

  /// Fills the payload from the FIFO, emitting a packet every time it is complete
  async fn send_available(&mut self, stream: &mut PeerStream) -> io::Result<()> {
    for _ in 0..MAX_PACKETS_PER_WAKEUP {
      while stream.fill < PAYLOAD_SIZE {
        match stream.session.read(&mut stream.payload[stream.fill..]) {
          Ok(n) => stream.fill += n,
          Err(CaptureError::WouldBlock) => return Ok(()),
          Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e)),
        }
      }
      let packet = make_data_packet(&mut stream.packet, stream.counter, &stream.payload);
      let sent = self.socket.send_to(packet, stream.peer).await?;
      if sent != DATA_PACKET_SIZE {
        return Err(io::Error::new(io::ErrorKind::WriteZero, format!("didn't send full packet: {sent}")));
      }
      stream.counter = next_counter(stream.counter);
      stream.fill = 0;
      stream.packets_sent += 1;
    }
    Ok(())
  }
}

/// Stream transport variant: one client at a time, raw payload bytes, no counters
pub struct TcpStreamSender {
  listener: TcpListener,
  device: Arc<CaptureDevice>,
  poll_timeout: Duration,
  shutdown: BroadcastReceiver<()>,
}

impl TcpStreamSender {
  pub async fn bind(
    addr: SocketAddr,
    device: Arc<CaptureDevice>,
    poll_timeout: Duration,
    mut shutdown: BroadcastReceiver<()>,
  ) -> Option<Self> {
    let listener = bind_tcp(addr, &mut shutdown).await?;
    Some(Self { listener, device, poll_timeout, shutdown })
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  pub async fn run(mut self) {
    match self.local_addr() {
      Ok(addr) => info!("tcp stream sender listening on {addr}"),
      Err(e) => warn!("tcp stream sender listening on unknown address: {e:?}"),
    }
    loop {
      let (client, peer) = select! {
        r = self.listener.accept() => {
          match r {
            Ok(v) => v,
            Err(e) => {
              error!("error accepting connection: {e:?}");
              sleep(RECV_ERROR_BACKOFF).await;
              continue;
            }
          }
        },
        _ = self.shutdown.recv() => break,
      };
      let session = match self.device.open() {
        Ok(session) => session,
        Err(e) => {
          error!("cannot open capture device for {peer}: {e}");
          continue;
        }
      };
      info!("streaming to {peer}");
      if !self.stream(client, peer, session).await {
        break;
      }
    }
    info!("tcp stream sender shut down");
  }

  /// Returns false on shutdown
  async fn stream(&mut self, mut client: TcpStream, peer: SocketAddr, mut session: CaptureSession) -> bool {
    let mut chunk = [0u8; PAYLOAD_SIZE];
    let mut peek = [0u8; 1];
    let mut deadline = Instant::now() + self.poll_timeout;
    loop {
      select! {
        r = client.read(&mut peek) => {
          match r {
            Ok(0) | Err(_) => {
              info!("{peer} disconnected");
              return true;
            },
            Ok(_) => debug!("ignoring data sent by {peer}"),
          }
        },
        ready = session.wait_readable_until(deadline) => {
          if !ready {
            warn!("no data from capture device for {:?}, closing connection with {peer}", self.poll_timeout);
            return true;
          }
          let len = match session.read(&mut chunk) {
            Ok(len) => {
              deadline = Instant::now() + self.poll_timeout;
              len
            },
            Err(CaptureError::WouldBlock) => continue,
            Err(e) => {
              error!("capture read failed: {e}");
              return true;
            }
          };
          if let Err(e) = client.write_all(&chunk[..len]).await {
            info!("{peer} went away: {e:?}");
            return true;
          }
        },
        _ = self.shutdown.recv() => {
          return false;
        }
      }
    }
  }
}
