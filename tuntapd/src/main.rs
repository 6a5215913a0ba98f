use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
#[cfg(target_family = "unix")]
use tokio::signal::{self, unix::SignalKind};
use tracing::{debug, info, trace};
use tuntap::{EventLoop, PollConfig, ShutdownCoordinator, TunDevice};

use logging::LoggingFormat;
use metrics::CounterMetrics;
use settings::DeviceArguments;

mod logging;
mod metrics;
mod settings;

/// The default amount of bytes written by the probe command.
const DEFAULT_PROBE_BYTES: usize = 20;

#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Path to a TOML config file. Default [<config dir>/tuntapd/tuntapd.toml].
    #[arg(long = "config-file", global = true)]
    config_file: Option<PathBuf>,

    /// Enable debug logging. Does nothing if `--silent` is set.
    #[arg(short = 'd', long = "debug", default_value_t = false, global = true)]
    debug: bool,

    /// Disable all logs except error logs.
    #[arg(long = "silent", default_value_t = false, global = true)]
    silent: bool,

    /// The format of the logs. Default [compact].
    #[arg(long = "logging-format", value_enum, global = true)]
    logging_format: Option<LoggingFormat>,

    #[clap(flatten)]
    device_args: DeviceArguments,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Open the device, write a single packet and try to read one back.
    Probe {
        /// Size of the packet to write.
        #[arg(long = "bytes", default_value_t = DEFAULT_PROBE_BYTES)]
        bytes: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let file_config = settings::load_config_file(cli.config_file.as_deref())?;

    logging::init(
        cli.silent,
        cli.debug,
        cli.logging_format
            .or(file_config.logging_format)
            .unwrap_or_default(),
    );

    let device_settings = settings::merge_config(cli.device_args, file_config);
    debug!("Using device settings {device_settings:?}");

    let coordinator = ShutdownCoordinator::new();
    let metrics = CounterMetrics::new();
    let device = TunDevice::with_backend(
        device_settings.tun_name,
        coordinator.clone(),
        tuntap::tun::platform(),
        metrics.clone(),
    );

    let res = match cli.command {
        Some(Command::Probe { bytes }) => probe(&device, bytes),
        None => run(&device, &coordinator, device_settings.poll_config).await,
    };

    metrics.report();

    res
}

/// Poll the device and log received packets until the process is asked to stop.
async fn run(
    device: &TunDevice<CounterMetrics>,
    coordinator: &Arc<ShutdownCoordinator>,
    poll_config: PollConfig,
) -> Result<(), Box<dyn Error>> {
    device.open()?;
    device.set_poll_config(poll_config);

    let event_loop = EventLoop::new()?;
    let name = device.name();
    device.start_polling(&event_loop, move |packet| {
        info!(len = packet.len(), "Received packet on {name}");
        trace!("Packet data {}", faster_hex::hex_string(&packet));
    })?;

    info!("Listening for packets on {}", device.name());

    wait_for_shutdown().await?;

    info!("Shutting down");
    coordinator.request_shutdown();
    coordinator.close_all();
    drop(event_loop);

    Ok(())
}

/// Check that a device can be created and written to.
fn probe(device: &TunDevice<CounterMetrics>, bytes: usize) -> Result<(), Box<dyn Error>> {
    device.open()?;

    let written = device.write(&probe_packet(bytes))?;
    let read = device.read_default()?;

    println!(
        "Probed {}: wrote {written} bytes, read {} bytes",
        device.name(),
        read.len()
    );

    device.close();

    Ok(())
}

/// A zeroed packet with the IPv6 version nibble set, so the kernel accepts it as a layer 3
/// packet.
fn probe_packet(len: usize) -> Vec<u8> {
    let mut packet = vec![0; len];
    if let Some(first) = packet.first_mut() {
        *first = 0x60;
    }
    packet
}

async fn wait_for_shutdown() -> io::Result<()> {
    #[cfg(target_family = "unix")]
    {
        let mut sigint = signal::unix::signal(SignalKind::interrupt())?;
        let mut sigterm = signal::unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => { debug!("Received SIGINT") }
            _ = sigterm.recv() => { debug!("Received SIGTERM") }
        }
    }
    #[cfg(not(target_family = "unix"))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{probe_packet, Cli, Command, DEFAULT_PROBE_BYTES};
    use crate::logging::LoggingFormat;

    #[test]
    fn parse_probe_with_global_flags() {
        let cli = Cli::try_parse_from([
            "tuntapd",
            "probe",
            "--tun-name",
            "probe0",
            "--logging-format",
            "logfmt",
            "-d",
        ])
        .unwrap();

        assert!(matches!(
            cli.command,
            Some(Command::Probe {
                bytes: DEFAULT_PROBE_BYTES
            })
        ));
        assert_eq!(cli.device_args.tun_name.as_deref(), Some("probe0"));
        assert_eq!(cli.logging_format, Some(LoggingFormat::Logfmt));
        assert!(cli.debug);
    }

    #[test]
    fn parse_daemon_flags() {
        let cli = Cli::try_parse_from([
            "tuntapd",
            "--channel-capacity",
            "4",
            "--read-buffer-size",
            "1504",
        ])
        .unwrap();

        assert!(cli.command.is_none());
        assert_eq!(cli.device_args.channel_capacity, Some(4));
        assert_eq!(cli.device_args.read_buffer_size, Some(1504));
        assert_eq!(cli.logging_format, None);
    }

    #[test]
    fn probe_packet_has_version_nibble() {
        let packet = probe_packet(20);
        assert_eq!(packet.len(), 20);
        assert_eq!(packet[0] >> 4, 6);
        assert!(probe_packet(0).is_empty());
    }
}
