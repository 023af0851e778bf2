//! Configuration module

use crate::connection::{Connection, Transport};
use crate::manager::{HttpProbe, ManagerSettings, DEFAULT_PROBE_URL};
use crate::server::socks5::TRANSPORT_NAME as BUNDLED_SOCKS5;
use crate::service::{key_is_valid, ServiceOptions, DEFAULT_NAMESPACE};
use crate::telemetry::TRAFFIC_PATH;
use crate::{Error, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

const GENERATED_KEY_LENGTH: usize = 32;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Listen address of the telemetry receiver
    pub controller_bind_addr: String,

    /// Bearer secret handed to transports; generated when absent
    pub client_auth_key: Option<String>,

    /// Private environment prefix for transport variables
    pub env_namespace: String,

    pub log_level: Option<String>,

    pub manager: ManagerConfig,

    /// Transport registry, keyed by name
    pub transports: HashMap<String, Transport>,

    pub connections: Vec<Connection>,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.prepare();
        config.validate()?;
        Ok(config)
    }

    /// Fill in derived values: connection ids, transport names and the
    /// auth key.
    pub fn prepare(&mut self) {
        for connection in &mut self.connections {
            connection.ensure_id();
        }
        for (name, transport) in &mut self.transports {
            if transport.name.is_empty() {
                transport.name = name.clone();
            }
        }
        if self.client_auth_key.as_deref().map_or(true, str::is_empty) {
            self.client_auth_key = Some(generate_key());
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.controller_addr()?;

        if !key_is_valid(&self.env_namespace) {
            return Err(Error::config(format!(
                "invalid env-namespace: {:?}",
                self.env_namespace
            )));
        }

        self.manager.validate()?;

        for (name, transport) in &self.transports {
            if !transport.bundled && transport.command.is_none() {
                return Err(Error::config(format!(
                    "transport {} needs a command or bundled: true",
                    name
                )));
            }
        }

        let mut seen = HashSet::new();
        for connection in &self.connections {
            if connection.transport.is_empty() {
                return Err(Error::config("connection without transport"));
            }
            if !seen.insert(connection.id.as_str()) {
                return Err(Error::config(format!(
                    "duplicate connection {}",
                    connection.display_name()
                )));
            }
            if !self.transports.contains_key(&connection.transport) {
                warn!(
                    "connection {} uses unknown transport {}",
                    connection.display_name(),
                    connection.transport
                );
            }
        }

        if self.connections.iter().all(|c| !c.is_enabled()) {
            warn!("No connections enabled");
        }
        Ok(())
    }

    /// Save configuration to file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn controller_addr(&self) -> Result<SocketAddr> {
        self.controller_bind_addr.parse().map_err(|e| {
            Error::config(format!(
                "invalid controller-bind-addr {:?}: {}",
                self.controller_bind_addr, e
            ))
        })
    }

    pub fn auth_key(&self) -> &str {
        self.client_auth_key.as_deref().unwrap_or_default()
    }

    /// URL transports post their telemetry to
    pub fn callback_url(&self) -> String {
        format!("http://{}{}", self.controller_bind_addr, TRAFFIC_PATH)
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            namespace: self.env_namespace.clone(),
            auth_secret: self.auth_key().to_string(),
            callback_url: self.callback_url(),
            stop_grace: Duration::from_millis(self.manager.stop_grace_ms),
            args: Vec::new(),
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        let m = &self.manager;
        ManagerSettings {
            reconnect_delay: Duration::from_millis(m.reconnect_delay_ms),
            reverify_interval: Duration::from_millis(m.reverify_interval_ms),
            history_limit: m.history_limit,
            proxy_bind_addr: m.proxy_bind_addr.clone(),
            expected_protocol: m.expected_protocol.clone(),
            verbose: m.verbose,
            service: self.service_options(),
        }
    }

    pub fn probe(&self) -> HttpProbe {
        HttpProbe::new(
            self.manager.probe_url.clone(),
            Duration::from_millis(self.manager.probe_timeout_ms),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut transports = HashMap::new();
        transports.insert(
            BUNDLED_SOCKS5.to_string(),
            Transport::bundled(BUNDLED_SOCKS5),
        );
        Config {
            controller_bind_addr: "127.0.0.1:8899".to_string(),
            client_auth_key: None,
            env_namespace: DEFAULT_NAMESPACE.to_string(),
            log_level: Some("info".to_string()),
            manager: ManagerConfig::default(),
            transports,
            connections: Vec::new(),
        }
    }
}

/// Connection manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ManagerConfig {
    pub reconnect_delay_ms: u64,
    pub reverify_interval_ms: u64,
    pub probe_url: String,
    pub probe_timeout_ms: u64,
    /// Events kept per connection
    pub history_limit: usize,
    pub proxy_bind_addr: String,
    pub expected_protocol: String,
    pub stop_grace_ms: u64,
    pub verbose: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            reconnect_delay_ms: 4000,
            reverify_interval_ms: 10_000,
            probe_url: DEFAULT_PROBE_URL.to_string(),
            probe_timeout_ms: 10_000,
            history_limit: 20,
            proxy_bind_addr: "127.0.0.1:0".to_string(),
            expected_protocol: "socks5".to_string(),
            stop_grace_ms: 5000,
            verbose: false,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_limit == 0 {
            return Err(Error::config("history-limit must be at least 1"));
        }
        if self.reconnect_delay_ms == 0 || self.reverify_interval_ms == 0 {
            return Err(Error::config(
                "reconnect-delay-ms and reverify-interval-ms must be positive",
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(Error::config("probe-timeout-ms must be positive"));
        }
        if !self.probe_url.starts_with("http://") && !self.probe_url.starts_with("https://") {
            return Err(Error::config(format!("invalid probe-url: {}", self.probe_url)));
        }
        if self.proxy_bind_addr.is_empty() {
            return Err(Error::config("proxy-bind-addr is empty"));
        }
        Ok(())
    }
}

fn generate_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_KEY_LENGTH)
        .map(char::from)
        .collect()
}
