use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::select;

use daq_stream::{ConfigError, DaqServer, ServerConfig, SimulatedAdc, Transport};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// TOML config file; DAQ_* env vars override it, flags override both
  #[arg(long, short)]
  config: Option<PathBuf>,
  #[arg(long)]
  bind_ip: Option<Ipv4Addr>,
  #[arg(long, short)]
  port: Option<u16>,
  /// udp or tcp
  #[arg(long, short)]
  transport: Option<Transport>,
  /// sample rate selector at startup: 0=200k 1=500k 2=1M 3=2M
  #[arg(long, short = 'r')]
  sample_rate: Option<u8>,
  #[arg(long)]
  poll_timeout_ms: Option<u64>,
  /// noise added to the simulated sawtooth, in LSB
  #[arg(long, default_value_t = 0)]
  noise: u16,
}

fn load_config(args: &Args) -> Result<ServerConfig, ConfigError> {
  let mut config = ServerConfig::load(args.config.as_deref())?;
  if let Some(ip) = args.bind_ip {
    config.bind_ip = ip;
  }
  if let Some(port) = args.port {
    config.port = port;
  }
  if let Some(transport) = args.transport {
    config.transport = transport;
  }
  if let Some(rate) = args.sample_rate {
    config.sample_rate = rate;
  }
  if let Some(ms) = args.poll_timeout_ms {
    config.poll_timeout_ms = ms;
  }
  config.validate()?;
  Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
  let logenv = env_logger::Env::default().default_filter_or("info");
  env_logger::init_from_env(logenv);

  let args = Args::parse();
  let config = match load_config(&args) {
    Ok(config) => config,
    Err(e) => {
      error!("{e}");
      return ExitCode::FAILURE;
    }
  };
  info!("{config:?}");

  let adc = SimulatedAdc::with_noise(args.noise);
  let started = select! {
    r = DaqServer::start(&config, Arc::new(adc.clone()), Arc::new(adc.clone())) => r,
    _ = tokio::signal::ctrl_c() => return ExitCode::SUCCESS,
  };
  let (server, handler) = match started {
    Ok(v) => v,
    Err(e) => {
      error!("cannot start server: {e}");
      return ExitCode::FAILURE;
    }
  };
  let irq = match adc.spawn(handler, config.burst_size) {
    Ok(irq) => irq,
    Err(e) => {
      error!("cannot start interrupt thread: {e:?}");
      server.shutdown().await;
      return ExitCode::FAILURE;
    }
  };

  let _ = tokio::signal::ctrl_c().await;
  server.shutdown().await;
  irq.stop();
  ExitCode::SUCCESS
}
