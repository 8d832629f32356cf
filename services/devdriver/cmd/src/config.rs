//! Configuration handling for the devdriver binary.
//!
//! Values come from the YAML config file, then environment variables, then
//! command line flags, each layer overriding the previous one.

use anyhow::{bail, Context, Result};
use dd_session::SessionConfig;
use dd_wire::{ClientId, Version, BROADCAST_CLIENT_ID};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// devdriver service configuration
#[derive(Debug, Clone)]
pub struct DevDriverConfig {
    /// Client id of this endpoint
    pub client_id: ClientId,
    /// Client id of the peer sessions are opened to
    pub remote_client_id: ClientId,
    /// Address to accept peers on
    pub listen: Option<SocketAddr>,
    /// Address of the peer to connect to
    pub connect: Option<SocketAddr>,
    /// Lowest echo protocol version spoken
    pub min_version: Version,
    /// Highest echo protocol version spoken
    pub max_version: Version,
    /// Session tuning
    pub session: SessionConfig,
}

impl Default for DevDriverConfig {
    fn default() -> Self {
        Self {
            client_id: 1,
            remote_client_id: 2,
            listen: None,
            connect: None,
            min_version: 1,
            max_version: 3,
            session: SessionConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    devdriver: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    client_id: Option<ClientId>,
    remote_client_id: Option<ClientId>,
    listen: Option<String>,
    connect: Option<String>,
    echo: Option<EchoConfig>,
    session: Option<SessionSection>,
}

#[derive(Debug, Deserialize)]
struct EchoConfig {
    min_version: Option<Version>,
    max_version: Option<Version>,
}

#[derive(Debug, Deserialize)]
struct SessionSection {
    window_size: Option<u16>,
    max_retransmits: Option<u32>,
    min_retransmit_delay: Option<String>,
    max_retransmit_delay: Option<String>,
    fast_retransmit_threshold: Option<u32>,
    max_unacknowledged: Option<u64>,
    update_interval: Option<String>,
    destroy_timeout: Option<String>,
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration for {}: {:?}", key, value))
}

fn parse_addr(key: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("invalid address for {}: {:?}", key, value))
}

impl DevDriverConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config)?;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?}, using defaults: {}",
                        config_path.as_ref(),
                        e
                    );
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
            }
        }

        config.apply_environment_overrides(|key| std::env::var(key).ok())?;

        info!(
            "Final devdriver configuration: client_id={}, remote_client_id={}, listen={:?}, connect={:?}",
            config.client_id, config.remote_client_id, config.listen, config.connect
        );

        Ok(config)
    }

    /// Apply configuration from the root config structure
    fn apply_root_config(&mut self, root_config: RootConfig) -> Result<()> {
        let Some(service) = root_config.devdriver else {
            return Ok(());
        };

        if let Some(client_id) = service.client_id {
            self.client_id = client_id;
        }
        if let Some(remote_client_id) = service.remote_client_id {
            self.remote_client_id = remote_client_id;
        }
        if let Some(listen) = service.listen {
            self.listen = Some(parse_addr("listen", &listen)?);
        }
        if let Some(connect) = service.connect {
            self.connect = Some(parse_addr("connect", &connect)?);
        }

        if let Some(echo) = service.echo {
            if let Some(min_version) = echo.min_version {
                self.min_version = min_version;
            }
            if let Some(max_version) = echo.max_version {
                self.max_version = max_version;
            }
        }

        if let Some(session) = service.session {
            self.apply_session_config(session)?;
        }

        Ok(())
    }

    fn apply_session_config(&mut self, section: SessionSection) -> Result<()> {
        let session = &mut self.session;
        if let Some(window_size) = section.window_size {
            session.window_size = window_size;
        }
        if let Some(max_retransmits) = section.max_retransmits {
            session.max_retransmits = max_retransmits;
        }
        if let Some(value) = section.min_retransmit_delay {
            session.min_retransmit_delay = parse_duration("session.min_retransmit_delay", &value)?;
        }
        if let Some(value) = section.max_retransmit_delay {
            session.max_retransmit_delay = parse_duration("session.max_retransmit_delay", &value)?;
        }
        if let Some(threshold) = section.fast_retransmit_threshold {
            session.fast_retransmit_threshold = threshold;
        }
        if let Some(max_unacknowledged) = section.max_unacknowledged {
            session.max_unacknowledged = max_unacknowledged;
        }
        if let Some(value) = section.update_interval {
            session.update_interval = parse_duration("session.update_interval", &value)?;
        }
        if let Some(value) = section.destroy_timeout {
            session.destroy_timeout = parse_duration("session.destroy_timeout", &value)?;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(client_id) = var("DD_CLIENT_ID") {
            self.client_id = client_id
                .parse()
                .with_context(|| format!("invalid DD_CLIENT_ID: {:?}", client_id))?;
            info!("Client ID overridden by environment: {}", self.client_id);
        }

        if let Some(remote_client_id) = var("DD_REMOTE_CLIENT_ID") {
            self.remote_client_id = remote_client_id
                .parse()
                .with_context(|| format!("invalid DD_REMOTE_CLIENT_ID: {:?}", remote_client_id))?;
            info!("Remote client ID overridden by environment: {}", self.remote_client_id);
        }

        if let Some(listen) = var("DD_LISTEN") {
            self.listen = Some(parse_addr("DD_LISTEN", &listen)?);
            info!("Listen address overridden by environment: {}", listen);
        }

        if let Some(connect) = var("DD_CONNECT") {
            self.connect = Some(parse_addr("DD_CONNECT", &connect)?);
            info!("Connect address overridden by environment: {}", connect);
        }

        Ok(())
    }

    /// Reject combinations the session layer cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.client_id == BROADCAST_CLIENT_ID {
            bail!("client id {} is reserved", BROADCAST_CLIENT_ID);
        }
        if self.connect.is_some() && self.remote_client_id == BROADCAST_CLIENT_ID {
            bail!("remote client id {} is reserved", BROADCAST_CLIENT_ID);
        }
        if self.min_version > self.max_version {
            bail!(
                "echo version range [{}, {}] is empty",
                self.min_version,
                self.max_version
            );
        }
        if self.session.window_size == 0 {
            bail!("session window size must be positive");
        }
        if self.session.min_retransmit_delay > self.session.max_retransmit_delay {
            bail!("minimum retransmit delay exceeds the maximum");
        }
        Ok(())
    }
}
