//! usb-target-inspect
//!
//! Opens one USB device through the rusb backend, builds its interface
//! topology and runs a single operation against it.

mod config;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::setup_logging;
use config::{InspectConfig, expand_path, parse_device_filter};
use protocol::{RequestId, UsbError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use usb_target::{
    CompletionReceiver, Rejected, Request, RusbBackend, Target, TransferCompletion,
    oneshot_completion,
};

#[derive(Parser, Debug)]
#[command(name = "usb-target-inspect")]
#[command(
    author,
    version,
    about = "Inspect a USB device's interfaces and exercise its endpoints"
)]
#[command(long_about = "
Opens a USB device, claims its interfaces and exposes the endpoint topology
of each interface's active alternate setting.

EXAMPLES:
    # Show the interface/endpoint topology
    usb-target-inspect --device 0x046d:0xc52b topology

    # Read 64 bytes from endpoint 0x81
    usb-target-inspect --device 0x046d:0xc52b read 0x81 --length 64

    # Write bytes to endpoint 0x02
    usb-target-inspect --device 0x1234:0x5678 write 0x02 deadbeef

    # Switch interface 1 to alternate setting 2
    usb-target-inspect alt-setting 1 2

CONFIGURATION:
    Settings are read from, in order:
    1. Path specified with --config
    2. ~/.config/usb-target/inspect.toml
    3. /etc/usb-target/inspect.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Device to open as VID:PID (overrides the config file)
    #[arg(short, long, value_name = "VID:PID")]
    device: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Print the device descriptor
    Descriptor {
        #[arg(long)]
        json: bool,
    },
    /// Print every interface and the endpoints of its active setting
    Topology {
        #[arg(long)]
        json: bool,
    },
    /// Read from an IN endpoint
    Read {
        /// Endpoint address, e.g. 0x81
        #[arg(value_parser = parse_endpoint)]
        endpoint: u8,
        #[arg(short = 'n', long, default_value_t = 64)]
        length: usize,
        /// Abort the read if nothing arrives within this many milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Write hex-encoded bytes to an OUT endpoint
    Write {
        #[arg(value_parser = parse_endpoint)]
        endpoint: u8,
        /// Payload, e.g. deadbeef or de:ad:be:ef
        data: String,
    },
    /// Switch an interface to another alternate setting
    AltSetting {
        /// Interface index within the active configuration
        interface: usize,
        alt_setting: u8,
    },
    /// Reset the device, one interface, or one endpoint
    Reset {
        #[arg(long, conflicts_with = "endpoint")]
        interface: Option<usize>,
        #[arg(long, value_parser = parse_endpoint)]
        endpoint: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = InspectConfig::default();
        let path = InspectConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        InspectConfig::load(Some(expand_path(path))).context("Failed to load configuration")?
    } else {
        InspectConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    let filter = args
        .device
        .clone()
        .or_else(|| config.device.filter.clone())
        .ok_or_else(|| anyhow!("No device given; use --device VID:PID or set [device] filter"))?;
    let (vendor_id, product_id) = parse_device_filter(&filter)?;

    info!("Opening device {:04x}:{:04x}", vendor_id, product_id);
    let settings = config.transfers.to_rusb_settings();
    let backend = tokio::task::spawn_blocking(move || {
        RusbBackend::open(vendor_id, product_id, settings)
    })
    .await
    .context("Device open task failed")?
    .with_context(|| format!("Failed to open device {}", filter))?;

    let target = Target::create(Arc::new(backend)).context("Failed to build topology")?;

    run(&target, args.command.unwrap_or(Command::Topology { json: false })).await
}

async fn run(target: &Target, command: Command) -> Result<()> {
    match command {
        Command::Descriptor { json } => {
            let desc = target.device_descriptor();
            if json {
                println!("{}", serde_json::to_string_pretty(&desc)?);
            } else {
                println!("Device {:04x}:{:04x}", desc.vendor_id, desc.product_id);
                println!(
                    "  USB {:x}.{:02x}  class {:#04x}/{:#04x}/{:#04x}",
                    desc.usb_version >> 8,
                    desc.usb_version & 0xff,
                    desc.class,
                    desc.subclass,
                    desc.protocol
                );
                println!("  bMaxPacketSize0: {}", desc.max_packet_size_0);
                println!("  bcdDevice:       {:#06x}", desc.device_version);
                println!("  configurations:  {}", desc.num_configurations);
            }
        }

        Command::Topology { json } => {
            let topology = target.topology();
            if json {
                println!("{}", serde_json::to_string_pretty(&topology)?);
            } else {
                for iface in topology {
                    println!(
                        "Interface {} (alt setting {})",
                        iface.number, iface.alt_setting
                    );
                    for ep in iface.endpoints {
                        println!("  {}", ep);
                    }
                }
            }
        }

        Command::Read {
            endpoint,
            length,
            timeout_ms,
        } => {
            let (completion, rx) = oneshot_completion();
            target
                .read_pipe_async(endpoint, Request::with_len(next_request_id(), length), completion)
                .map_err(rejected)?;

            let timeout = Duration::from_millis(timeout_ms);
            let done = wait_or_abort(target, endpoint, rx, timeout).await?;
            if let Err(e) = &done.status {
                return Err(anyhow!("Read from {:#04x} failed: {}", endpoint, e));
            }
            println!("{}", hex(done.data()));
        }

        Command::Write { endpoint, data } => {
            let data = parse_hex_bytes(&data).map_err(|e| anyhow!(e))?;
            let len = data.len();
            let (completion, rx) = oneshot_completion();
            target
                .write_pipe_async(endpoint, Request::new(next_request_id(), data), completion)
                .map_err(rejected)?;

            let done = rx.wait().await?;
            if let Err(e) = &done.status {
                return Err(anyhow!("Write to {:#04x} failed: {}", endpoint, e));
            }
            println!("Wrote {}/{} bytes", done.bytes_transferred, len);
        }

        Command::AltSetting {
            interface,
            alt_setting,
        } => {
            target
                .set_interface_alt_setting(interface, alt_setting)
                .with_context(|| {
                    format!(
                        "Failed to switch interface {} to alt setting {}",
                        interface, alt_setting
                    )
                })?;
            println!("Interface {} now on alt setting {}", interface, alt_setting);
        }

        Command::Reset {
            interface,
            endpoint,
        } => match (interface, endpoint) {
            (Some(index), _) => {
                target.reset_interface(index)?;
                println!("Interface {} reset", index);
            }
            (None, Some(ep)) => {
                target.reset_pipe(ep)?;
                println!("Endpoint {:#04x} reset", ep);
            }
            (None, None) => {
                target.reset_device()?;
                println!("Device reset");
            }
        },
    }

    Ok(())
}

/// Wait for a completion, aborting the endpoint if it takes too long
///
/// The abort still has to be acknowledged through the completion, so this
/// keeps waiting after requesting it.
async fn wait_or_abort(
    target: &Target,
    endpoint: u8,
    rx: CompletionReceiver,
    timeout: Duration,
) -> Result<TransferCompletion> {
    let wait = rx.wait();
    tokio::pin!(wait);

    match tokio::time::timeout(timeout, &mut wait).await {
        Ok(done) => Ok(done?),
        Err(_) => {
            warn!("No data on {:#04x} after {:?}, aborting", endpoint, timeout);
            target.abort_pipe(endpoint)?;
            Ok(wait.await?)
        }
    }
}

fn rejected(rejected: Rejected) -> anyhow::Error {
    match rejected.error {
        UsbError::NotFound => anyhow!(
            "Endpoint {:#04x} is not part of any interface's active setting",
            rejected.endpoint
        ),
        _ => anyhow::Error::new(rejected),
    }
}

fn next_request_id() -> RequestId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    RequestId(NEXT.fetch_add(1, Ordering::Relaxed))
}

fn parse_endpoint(s: &str) -> Result<u8, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u8::from_str_radix(digits, 16).map_err(|_| format!("invalid endpoint address '{}'", s))
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    let mut digits = Vec::with_capacity(s.len());
    for c in s.chars().filter(|c| !c.is_whitespace() && *c != ':') {
        let digit = c
            .to_digit(16)
            .ok_or_else(|| format!("invalid hex digit '{}' in '{}'", c, s))?;
        digits.push(digit as u8);
    }
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{}'", s));
    }

    Ok(digits.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect())
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(parse_endpoint("0x81"), Ok(0x81));
        assert_eq!(parse_endpoint("02"), Ok(0x02));
        assert!(parse_endpoint("0x181").is_err());
        assert!(parse_endpoint("in").is_err());
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("deadBEEF"), Ok(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(parse_hex_bytes("01:02 03"), Ok(vec![1, 2, 3]));
        assert_eq!(parse_hex_bytes(""), Ok(vec![]));
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
    }

    #[test]
    fn test_parse_hex_bytes_rejects_non_ascii() {
        assert!(parse_hex_bytes("aéb").is_err());
        assert!(parse_hex_bytes("éé").is_err());
        assert!(parse_hex_bytes("0１").is_err());
    }

    #[test]
    fn test_hex_output() {
        assert_eq!(hex(&[0x00, 0x7f, 0xff]), "007fff");
    }

    #[test]
    fn test_args_parse_subcommands() {
        let args = Args::try_parse_from([
            "usb-target-inspect",
            "--device",
            "0x1234:0x5678",
            "read",
            "0x81",
            "-n",
            "8",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Some(Command::Read {
                endpoint: 0x81,
                length: 8,
                timeout_ms: 5000
            })
        );

        let args =
            Args::try_parse_from(["usb-target-inspect", "reset", "--interface", "1"]).unwrap();
        assert_eq!(
            args.command,
            Some(Command::Reset {
                interface: Some(1),
                endpoint: None
            })
        );
    }

    #[test]
    fn test_args_reject_conflicting_reset() {
        assert!(
            Args::try_parse_from([
                "usb-target-inspect",
                "reset",
                "--interface",
                "0",
                "--endpoint",
                "0x81"
            ])
            .is_err()
        );
    }

    #[test]
    fn test_request_ids_increase() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b.0 > a.0);
    }
}
