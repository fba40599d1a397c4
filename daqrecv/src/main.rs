use std::fs::File;
use std::io::BufWriter;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};
use tokio::sync::broadcast;

use daq_stream::{receive_tcp, ClientConfig, SampleRate, StreamReceiver, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// sample rate selector: 0=200k 1=500k 2=1M 3=2M, server keeps its rate if omitted
  rate: Option<u8>,
  #[arg(long, short, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
  address: IpAddr,
  #[arg(long, short, default_value_t = DEFAULT_PORT)]
  port: u16,
  /// text file receiving one `time sample` line per sample
  #[arg(long, short, default_value = "samples.txt")]
  output: PathBuf,
  /// give up after this long without a packet
  #[arg(long)]
  timeout_ms: Option<u64>,
  /// requested UDP receive buffer in bytes
  #[arg(long)]
  receive_buffer_size: Option<usize>,
  /// receive raw bytes over TCP instead of counted UDP datagrams
  #[arg(long)]
  tcp: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
  let logenv = env_logger::Env::default().default_filter_or("info");
  env_logger::init_from_env(logenv);

  let args = Args::parse();
  let mut config = ClientConfig { sample_rate: args.rate, ..Default::default() };
  if let Some(ms) = args.timeout_ms {
    config.receive_timeout_ms = ms;
  }
  if let Some(size) = args.receive_buffer_size {
    config.receive_buffer_size = size;
  }
  let rate = match config.requested_rate() {
    Ok(rate) => rate,
    Err(e) => {
      error!("{e}");
      return ExitCode::FAILURE;
    }
  };
  let server = SocketAddr::new(args.address, args.port);

  let (stop_send, stop_recv) = broadcast::channel(1);
  tokio::spawn(async move {
    let _ = tokio::signal::ctrl_c().await;
    let _ = stop_send.send(());
  });

  let acquisition = if args.tcp {
    if rate.is_some() {
      warn!("the stream transport cannot select a sample rate, assuming the server runs at the requested one");
    }
    receive_tcp(server, rate.unwrap_or(SampleRate::DEFAULT), config.receive_timeout(), stop_recv).await
  } else {
    match StreamReceiver::connect(server, rate, config.receive_timeout(), config.receive_buffer_size, stop_recv).await {
      Ok(receiver) => Ok(receiver.run().await),
      Err(e) => Err(e),
    }
  };
  let acquisition = match acquisition {
    Ok(acquisition) => acquisition,
    Err(e) => {
      error!("cannot receive from {server}: {e:?}");
      return ExitCode::FAILURE;
    }
  };
  info!("lost {} packets", acquisition.lost_packets());

  let stream = match acquisition.reconstruct() {
    Ok(stream) => stream,
    Err(e) => {
      error!("cannot reconstruct samples: {e}");
      return ExitCode::FAILURE;
    }
  };
  let written = File::create(&args.output).and_then(|file| stream.write_text(BufWriter::new(file)));
  if let Err(e) = written {
    error!("error writing {}: {e:?}", args.output.display());
    return ExitCode::FAILURE;
  }
  info!("wrote {} samples ({} zero fill) to {}", stream.samples.len(), stream.filled, args.output.display());
  ExitCode::SUCCESS
}
