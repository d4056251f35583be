use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::Settings;

pub fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs(seconds))
}

/// Kasa device bridge: every command prints exactly one JSON object.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (stderr)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Broadcast for devices on the local network
    Discover {
        /// Collection window in seconds
        #[arg(value_parser = parse_duration, default_value = "10")]
        timeout: Duration,
    },

    /// Query one device
    GetDevice {
        /// Device IP address, optionally with :port
        ip: Option<String>,
    },

    /// Query a comma-separated list of devices
    GetDevices {
        /// Comma-separated IP addresses
        ips: Option<String>,
    },

    /// Read the energy meter of one device
    GetEnergy {
        /// Device IP address, optionally with :port
        ip: Option<String>,
    },

    /// Read the energy meters of a comma-separated list of devices
    GetAllEnergy {
        /// Comma-separated IP addresses
        ips: Option<String>,
    },

    /// Check connectivity, either to the given IPs or by discovery
    Test {
        /// Comma-separated IP addresses; empty to discover instead
        ips: Option<String>,

        /// Discovery window in seconds
        #[arg(value_parser = parse_duration, default_value = "10")]
        timeout: Duration,
    },
}
