use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::*;
use crate::hardware::SampleRate;
use crate::protocol::{DEFAULT_PORT, PAYLOAD_SIZE};

pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 2000;
/// 128 MiB, so bursts survive while the client is descheduled
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 0x800_0000;
/// Size of one hardware burst: 4096 words of 4 bytes
pub const DEFAULT_BURST_SIZE: usize = 4 * 4096;
pub const DEFAULT_FIFO_CAPACITY: usize = 8 * DEFAULT_BURST_SIZE;
pub const DEFAULT_ELEMENT_SIZE: usize = 4;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("cannot read config file: {0}")]
  Io(#[from] std::io::Error),
  #[error("cannot parse config file: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("invalid value {value:?} in env var {name}")]
  InvalidEnv { name: &'static str, value: String },
  #[error("invalid configuration: {0}")]
  Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
  /// counted 259-byte datagrams
  Udp,
  /// raw payload bytes over one TCP connection
  Tcp,
}

impl FromStr for Transport {
  type Err = ConfigError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "udp" => Ok(Self::Udp),
      "tcp" => Ok(Self::Tcp),
      other => Err(ConfigError::Invalid(format!("unknown transport {other:?}"))),
    }
  }
}

fn parse_env<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<T>, ConfigError> {
  match lookup(name) {
    None => Ok(None),
    Some(value) => value.trim().parse().map(Some).map_err(|_| ConfigError::InvalidEnv { name, value }),
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub bind_ip: Ipv4Addr,
  pub port: u16,
  pub transport: Transport,
  pub poll_timeout_ms: u64,
  /// applied at startup, before the first client asks for a specific rate
  pub sample_rate: u8,
  pub fifo_capacity: usize,
  pub element_size: usize,
  pub burst_size: usize,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind_ip: Ipv4Addr::UNSPECIFIED,
      port: DEFAULT_PORT,
      transport: Transport::Udp,
      poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
      sample_rate: SampleRate::DEFAULT.selector(),
      fifo_capacity: DEFAULT_FIFO_CAPACITY,
      element_size: DEFAULT_ELEMENT_SIZE,
      burst_size: DEFAULT_BURST_SIZE,
    }
  }
}

impl ServerConfig {
  /// Defaults, overridden by the TOML file (if given), overridden by `DAQ_*` env vars
  pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
    let mut config = match path {
      Some(path) => {
        info!("loading server config from {}", path.display());
        Self::from_toml_str(&fs::read_to_string(path)?)?
      }
      None => Self::default(),
    };
    config.apply_env(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
    Ok(toml::from_str(content)?)
  }

  pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    if let Some(ip) = parse_env(&lookup, "DAQ_BIND_IP")? {
      self.bind_ip = ip;
    }
    if let Some(port) = parse_env(&lookup, "DAQ_PORT")? {
      self.port = port;
    }
    if let Some(transport) = parse_env(&lookup, "DAQ_TRANSPORT")? {
      self.transport = transport;
    }
    if let Some(ms) = parse_env(&lookup, "DAQ_POLL_TIMEOUT_MS")? {
      self.poll_timeout_ms = ms;
    }
    if let Some(rate) = parse_env(&lookup, "DAQ_SAMPLE_RATE")? {
      self.sample_rate = rate;
    }
    Ok(())
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    SampleRate::try_from(self.sample_rate).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    if !self.fifo_capacity.is_power_of_two() {
      return Err(ConfigError::Invalid(format!("fifo_capacity {} is not a power of two", self.fifo_capacity)));
    }
    if self.element_size == 0 || PAYLOAD_SIZE % self.element_size != 0 {
      return Err(ConfigError::Invalid(format!("element_size {} must divide the {PAYLOAD_SIZE}-byte payload", self.element_size)));
    }
    if self.burst_size == 0 || self.burst_size % self.element_size != 0 || self.burst_size > self.fifo_capacity {
      return Err(ConfigError::Invalid(format!(
        "burst_size {} must be a nonzero multiple of element_size and fit the fifo", self.burst_size
      )));
    }
    if self.poll_timeout_ms == 0 {
      return Err(ConfigError::Invalid("poll_timeout_ms must be positive".to_owned()));
    }
    Ok(())
  }

  pub fn poll_timeout(&self) -> Duration {
    Duration::from_millis(self.poll_timeout_ms)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
  pub receive_timeout_ms: u64,
  pub sample_rate: Option<u8>,
  /// requested SO_RCVBUF, the OS may grant less
  pub receive_buffer_size: usize,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
      sample_rate: None,
      receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
    }
  }
}

impl ClientConfig {
  pub fn receive_timeout(&self) -> Duration {
    Duration::from_millis(self.receive_timeout_ms)
  }
  /// Rate requested from the server, or the server's power-up default
  pub fn requested_rate(&self) -> Result<Option<SampleRate>, ConfigError> {
    self.sample_rate
      .map(SampleRate::try_from)
      .transpose()
      .map_err(|e| ConfigError::Invalid(e.to_string()))
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  #[test]
  fn test_defaults_are_valid() {
    let config = ServerConfig::default();
    config.validate().unwrap();
    assert_eq!(config.port, 44444);
    assert_eq!(config.fifo_capacity, 131072);
    assert_eq!(config.poll_timeout(), Duration::from_millis(1000));
  }

  #[test]
  fn test_partial_toml_keeps_defaults() {
    let config = ServerConfig::from_toml_str("port = 5000\ntransport = \"tcp\"\n").unwrap();
    assert_eq!(config.port, 5000);
    assert_eq!(config.transport, Transport::Tcp);
    assert_eq!(config.burst_size, DEFAULT_BURST_SIZE);
  }

  #[test]
  fn test_env_overrides_file() {
    let vars: HashMap<&str, &str> = [("DAQ_PORT", "6000"), ("DAQ_SAMPLE_RATE", "1"), ("DAQ_BIND_IP", "127.0.0.1")].into();
    let mut config = ServerConfig::from_toml_str("port = 5000").unwrap();
    config.apply_env(|name| vars.get(name).map(|v| v.to_string())).unwrap();
    assert_eq!(config.port, 6000);
    assert_eq!(config.sample_rate, 1);
    assert_eq!(config.bind_ip, Ipv4Addr::LOCALHOST);
  }

  #[test]
  fn test_invalid_env_is_reported() {
    let mut config = ServerConfig::default();
    let err = config.apply_env(|name| (name == "DAQ_PORT").then(|| "lots".to_owned())).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidEnv { name: "DAQ_PORT", .. }));
  }

  #[test]
  fn test_validation() {
    let mut config = ServerConfig { fifo_capacity: 3000, ..Default::default() };
    assert!(config.validate().is_err());
    config.fifo_capacity = 1024;
    config.burst_size = 2048;
    assert!(config.validate().is_err());
    config.burst_size = 512;
    config.sample_rate = 9;
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_client_rate() {
    assert_eq!(ClientConfig::default().requested_rate().unwrap(), None);
    let config = ClientConfig { sample_rate: Some(2), ..Default::default() };
    assert_eq!(config.requested_rate().unwrap(), Some(SampleRate::Msps1));
    assert!(ClientConfig { sample_rate: Some(4), ..Default::default() }.requested_rate().is_err());
  }

  #[test]
  fn test_client_receive_buffer() {
    assert_eq!(ClientConfig::default().receive_buffer_size, 128 * 1024 * 1024);
    let config: ClientConfig = toml::from_str("receive_buffer_size = 65536").unwrap();
    assert_eq!(config.receive_buffer_size, 65536);
    assert_eq!(config.receive_timeout_ms, DEFAULT_RECEIVE_TIMEOUT_MS);
  }
}
