use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::select;
use tokio::sync::broadcast::Receiver;
use tokio::time::sleep;

use crate::common::*;

pub const MTU: usize = 1500;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Returns false if shutdown arrived during the delay
async fn wait_before_retry(shutdown: &mut Receiver<()>) -> bool {
  select! {
    _ = sleep(BIND_RETRY_DELAY) => true,
    _ = shutdown.recv() => false,
  }
}

/// Binds a UDP socket, retrying while the address is unavailable. Returns `None` on shutdown.
pub async fn bind_udp(addr: SocketAddr, shutdown: &mut Receiver<()>) -> Option<UdpSocket> {
  loop {
    select! {
      r = UdpSocket::bind(addr) => {
        match r {
          Ok(s) => return Some(s),
          Err(e) => {
            error!("error binding to {addr}: {e:?}");
            if !wait_before_retry(shutdown).await {
              return None;
            }
          }
        }
      },
      _ = shutdown.recv() => {
        return None;
      }
    };
  }
}

/// Same as [`bind_udp`] for the stream transport
pub async fn bind_tcp(addr: SocketAddr, shutdown: &mut Receiver<()>) -> Option<TcpListener> {
  loop {
    select! {
      r = TcpListener::bind(addr) => {
        match r {
          Ok(s) => return Some(s),
          Err(e) => {
            error!("error binding to {addr}: {e:?}");
            if !wait_before_retry(shutdown).await {
              return None;
            }
          }
        }
      },
      _ = shutdown.recv() => {
        return None;
      }
    };
  }
}
