// src/main.rs
//! USB GPS bridge - feeds fixes from a USB serial GPS receiver to the log or stdout

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use usb_gps_bridge::{
    config::BridgeConfig,
    monitor,
    serial::{BaudRate, DataBits, Parity, StopBits},
};

#[derive(Debug, Parser)]
#[command(name = "usb-gps-bridge", version, about)]
struct Args {
    /// Serial port to use instead of scanning for supported receivers
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate, or "auto" to detect it
    #[arg(short, long)]
    baud: Option<BaudRate>,

    /// Data bits (5-8)
    #[arg(long, value_parser = clap::value_parser!(u8).range(5..=8))]
    data_bits: Option<u8>,

    /// Parity: none, odd or even
    #[arg(long)]
    parity: Option<Parity>,

    /// Stop bits: 1 or 2
    #[arg(long)]
    stop_bits: Option<StopBits>,

    /// Accept serial ports of any chipset
    #[arg(long)]
    any_port: bool,

    /// Print each fix as a JSON line on stdout
    #[arg(long)]
    json: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Save the effective configuration before starting
    #[arg(long)]
    save_config: bool,
}

impl Args {
    fn apply(&self, config: &mut BridgeConfig) -> anyhow::Result<()> {
        if let Some(port) = &self.port {
            config.port = Some(port.clone());
        }
        if let Some(baud) = self.baud {
            config.serial = config.serial.with_baud_rate(baud);
        }
        if let Some(bits) = self.data_bits {
            let bits = DataBits::new(bits)
                .with_context(|| format!("invalid data bits {}", bits))?;
            config.serial = config.serial.with_data_bits(bits);
        }
        if let Some(parity) = self.parity {
            config.serial = config.serial.with_parity(parity);
        }
        if let Some(stop_bits) = self.stop_bits {
            config.serial = config.serial.with_stop_bits(stop_bits);
        }
        if self.any_port {
            config.allow_any_port = true;
        }
        Ok(())
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "usb_gps_bridge=debug"
    } else {
        "usb_gps_bridge=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = BridgeConfig::load().context("failed to load configuration")?;
    args.apply(&mut config)?;

    if args.list_ports {
        monitor::list_serial_ports(&config)?;
        return Ok(());
    }

    if args.save_config {
        config.save().context("failed to save configuration")?;
        tracing::info!("Configuration saved to {}", BridgeConfig::config_path()?.display());
    }

    monitor::run_bridge(config, args.json).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_bits_range_checked() {
        let args = Args::try_parse_from(["usb-gps-bridge", "--data-bits", "7"]).unwrap();
        assert_eq!(args.data_bits, Some(7));

        for bits in ["4", "9"] {
            assert!(Args::try_parse_from(["usb-gps-bridge", "--data-bits", bits]).is_err());
        }
    }

    #[test]
    fn test_args_override_config() {
        let args = Args::try_parse_from([
            "usb-gps-bridge",
            "--port",
            "/dev/ttyACM0",
            "--baud",
            "auto",
            "--parity",
            "even",
            "--any-port",
        ])
        .unwrap();
        let mut config = BridgeConfig::default();
        args.apply(&mut config).unwrap();

        assert_eq!(config.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.serial.baud_rate, BaudRate::Auto);
        assert_eq!(config.serial.parity, Parity::Even);
        assert!(config.allow_any_port);
    }
}
