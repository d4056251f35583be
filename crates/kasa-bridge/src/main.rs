mod cli;
mod config;
mod handlers;
mod utils;

use clap::{
    Parser,
    error::{ContextKind, ContextValue, ErrorKind},
};
use kasa_bridge_core::{DeviceClient, Discoverer, DiscoveryConfig};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use handlers::{
    handle_discover, handle_get_all_energy, handle_get_device, handle_get_devices,
    handle_get_energy, handle_test,
};

/// Prints `{"error": message}` on stdout and exits 1.
fn fail(message: impl Into<String>) -> ! {
    println!("{}", json!({ "error": message.into() }));
    std::process::exit(1);
}

fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp
            | ErrorKind::DisplayVersion
            | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => e.exit(),
            ErrorKind::InvalidSubcommand => {
                let token = match e.get(ContextKind::InvalidSubcommand) {
                    Some(ContextValue::String(token)) => token.clone(),
                    _ => String::new(),
                };
                fail(format!("Unknown command: {token}"))
            }
            _ => {
                let rendered = e.to_string();
                let message = rendered.lines().next().unwrap_or_default();
                fail(message.trim_start_matches("error: "))
            }
        },
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = parse_cli();
    init_tracing(cli.verbose);

    let Some(command) = cli.command else {
        fail("No command specified");
    };

    let client = DeviceClient::new(cli.settings.client_config());
    let discoverer = Discoverer::new(client, DiscoveryConfig::default());
    debug!(
        credentials = cli.settings.credentials().is_some(),
        "kasa-bridge {} (core {})",
        env!("CARGO_PKG_VERSION"),
        kasa_bridge_core::VERSION
    );

    let outcome = match &command {
        Command::Discover { timeout } => handle_discover(&discoverer, *timeout).await,
        Command::GetDevice { ip } => handle_get_device(&discoverer, ip).await,
        Command::GetDevices { ips } => handle_get_devices(&discoverer, ips).await,
        Command::GetEnergy { ip } => handle_get_energy(&discoverer, ip).await,
        Command::GetAllEnergy { ips } => handle_get_all_energy(&discoverer, ips).await,
        Command::Test { ips, timeout } => handle_test(&discoverer, ips, *timeout).await,
    };

    match outcome {
        Ok(value) => println!("{value}"),
        Err(message) => fail(message),
    }
}
