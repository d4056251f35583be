use std::time::Duration;

use clap::Args;
use kasa_bridge_core::{ClientConfig, Credentials};

use crate::cli::parse_duration;

/// Connection settings shared by every command.
#[derive(Args)]
pub struct Settings {
    /// TP-Link account email, needed by KLAP firmware
    #[arg(long, global = true, env = "KASA_EMAIL")]
    pub email: Option<String>,

    /// TP-Link account password
    #[arg(long, global = true, env = "KASA_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Per round-trip timeout in seconds
    #[arg(
        long,
        global = true,
        env = "KASA_TIMEOUT",
        value_parser = parse_duration,
        default_value = "10"
    )]
    pub device_timeout: Duration,
}

impl Settings {
    /// Account credentials, when both email and password are non-empty.
    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::from_parts(self.email.as_deref()?, self.password.as_deref()?)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_credentials(self.credentials())
            .with_timeout(self.device_timeout)
    }
}
