//! Datagram formats shared by the sender and the receiver.
//!
//! ```text
//! Connect:     [0x00]  or  [0x00][rate selector 0..=3]
//! Disconnect:  [0x01]
//! Data:        [0x02][counter: u16 LE][payload: 256 bytes]
//! ```

use binary_layout::prelude::*;
use thiserror::Error;

use crate::hardware::{InvalidSampleRate, SampleRate};

pub const DEFAULT_PORT: u16 = 44444;
pub const PAYLOAD_SIZE: usize = 256;
pub const HEADER_LENGTH: usize = 3;
pub const DATA_PACKET_SIZE: usize = HEADER_LENGTH + PAYLOAD_SIZE;

define_layout!(data_packet, LittleEndian, {
  packet_type: u8,
  counter: u16,
  payload: [u8]
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
  Connect = 0,
  Disconnect = 1,
  Data = 2,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
  #[error("empty datagram")]
  Empty,
  #[error("unknown packet type {0:#04x}")]
  UnknownType(u8),
  #[error("{0:?} datagram has wrong length {1}")]
  WrongLength(PacketType, usize),
  #[error("unexpected {0:?} packet")]
  Unexpected(PacketType),
  #[error(transparent)]
  InvalidSampleRate(#[from] InvalidSampleRate),
}

impl TryFrom<u8> for PacketType {
  type Error = ProtocolError;
  fn try_from(tag: u8) -> Result<Self, Self::Error> {
    match tag {
      0 => Ok(Self::Connect),
      1 => Ok(Self::Disconnect),
      2 => Ok(Self::Data),
      other => Err(ProtocolError::UnknownType(other)),
    }
  }
}

/// Counter that follows `counter` in a stream, wrapping 0xFFFF -> 0
#[inline(always)]
pub fn next_counter(counter: u16) -> u16 {
  counter.wrapping_add(1)
}

/// Number of packets missing when `received` arrives while `expected` was due
#[inline(always)]
pub fn lost_packets(expected: u16, received: u16) -> u16 {
  received.wrapping_sub(expected)
}

pub fn make_data_packet<'a>(buf: &'a mut [u8; DATA_PACKET_SIZE], counter: u16, payload: &[u8; PAYLOAD_SIZE]) -> &'a [u8] {
  let mut view = data_packet::View::new(&mut buf[..]);
  view.packet_type_mut().write(PacketType::Data as u8);
  view.counter_mut().write(counter);
  view.payload_mut().copy_from_slice(payload);
  &buf[..]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPacket<'a> {
  pub counter: u16,
  pub payload: &'a [u8],
}

pub fn parse_data_packet(packet: &[u8]) -> Result<DataPacket<'_>, ProtocolError> {
  let tag = *packet.first().ok_or(ProtocolError::Empty)?;
  let packet_type = PacketType::try_from(tag)?;
  if packet_type != PacketType::Data {
    return Err(ProtocolError::Unexpected(packet_type));
  }
  if packet.len() != DATA_PACKET_SIZE {
    return Err(ProtocolError::WrongLength(packet_type, packet.len()));
  }
  let view = data_packet::View::new(packet);
  Ok(DataPacket { counter: view.counter().read(), payload: &packet[HEADER_LENGTH..] })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
  /// `sample_rate` is present in the two-byte variant
  Connect { sample_rate: Option<SampleRate> },
  Disconnect,
}

impl ControlMessage {
  pub fn parse(datagram: &[u8]) -> Result<Self, ProtocolError> {
    let tag = *datagram.first().ok_or(ProtocolError::Empty)?;
    match PacketType::try_from(tag)? {
      PacketType::Connect => match datagram.len() {
        1 => Ok(Self::Connect { sample_rate: None }),
        2 => Ok(Self::Connect { sample_rate: Some(SampleRate::try_from(datagram[1])?) }),
        len => Err(ProtocolError::WrongLength(PacketType::Connect, len)),
      },
      PacketType::Disconnect => match datagram.len() {
        1 => Ok(Self::Disconnect),
        len => Err(ProtocolError::WrongLength(PacketType::Disconnect, len)),
      },
      PacketType::Data => Err(ProtocolError::Unexpected(PacketType::Data)),
    }
  }

  pub fn encode(&self) -> Vec<u8> {
    match self {
      Self::Connect { sample_rate: None } => vec![PacketType::Connect as u8],
      Self::Connect { sample_rate: Some(rate) } => vec![PacketType::Connect as u8, rate.selector()],
      Self::Disconnect => vec![PacketType::Disconnect as u8],
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_data_packet_layout() {
    let mut buf = [0u8; DATA_PACKET_SIZE];
    let mut payload = [0u8; PAYLOAD_SIZE];
    payload[0] = 0xAA;
    payload[PAYLOAD_SIZE - 1] = 0x55;
    let packet = make_data_packet(&mut buf, 0x1234, &payload);
    assert_eq!(packet.len(), 259);
    assert_eq!(&packet[..4], &[0x02, 0x34, 0x12, 0xAA]);
    assert_eq!(packet[258], 0x55);
    let parsed = parse_data_packet(packet).unwrap();
    assert_eq!(parsed.counter, 0x1234);
    assert_eq!(parsed.payload, &payload[..]);
  }

  #[test]
  fn test_data_packet_rejects_wrong_size_or_type() {
    assert_eq!(parse_data_packet(&[]), Err(ProtocolError::Empty));
    assert_eq!(parse_data_packet(&[2, 0, 0, 1]), Err(ProtocolError::WrongLength(PacketType::Data, 4)));
    assert_eq!(parse_data_packet(&[1]), Err(ProtocolError::Unexpected(PacketType::Disconnect)));
    assert_eq!(parse_data_packet(&[9; 259]), Err(ProtocolError::UnknownType(9)));
  }

  #[test]
  fn test_control_messages() {
    assert_eq!(ControlMessage::parse(&[0]), Ok(ControlMessage::Connect { sample_rate: None }));
    assert_eq!(ControlMessage::parse(&[0, 1]), Ok(ControlMessage::Connect { sample_rate: Some(SampleRate::Ksps500) }));
    assert_eq!(ControlMessage::parse(&[1]), Ok(ControlMessage::Disconnect));
    assert_eq!(ControlMessage::parse(&[0, 4]), Err(ProtocolError::InvalidSampleRate(InvalidSampleRate(4))));
    assert_eq!(ControlMessage::parse(&[0, 1, 2]), Err(ProtocolError::WrongLength(PacketType::Connect, 3)));
    assert_eq!(ControlMessage::parse(&[1, 0]), Err(ProtocolError::WrongLength(PacketType::Disconnect, 2)));
    assert_eq!(ControlMessage::parse(&[7]), Err(ProtocolError::UnknownType(7)));
    assert_eq!(ControlMessage::Connect { sample_rate: Some(SampleRate::Msps2) }.encode(), vec![0, 3]);
    assert_eq!(ControlMessage::Disconnect.encode(), vec![1]);
  }

  #[test]
  fn test_counter_wraps() {
    assert_eq!(next_counter(0xFFFE), 0xFFFF);
    assert_eq!(next_counter(0xFFFF), 0);
  }

  #[test]
  fn test_lost_packets_across_wrap() {
    // last received 0xFFFE, then 0x0001: 0xFFFF and 0x0000 are missing
    assert_eq!(lost_packets(next_counter(0xFFFE), 0x0001), 2);
    assert_eq!(lost_packets(next_counter(0x000A), 0x000B), 0);
    assert_eq!(lost_packets(next_counter(0xFFFF), 0x0005), 5);
    assert_eq!(lost_packets(10, 20), 10);
  }
}
