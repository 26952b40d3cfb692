//! Server configuration.
//!
//! Configuration is layered, lowest precedence first:
//! - Built-in defaults
//! - A TOML configuration file
//! - Environment variables (`SURGE_<SECTION>__<KEY>`)

use anyhow::{bail, ensure, Context, Result};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use surge_core::{HubConfig, IngestConfig};
use surge_protocol::WireFormat;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "SURGE";

/// Route of the health endpoint, served on every listener.
pub const HEALTH_PATH: &str = "/health";

/// Files searched when no path is given, in order.
pub const CONFIG_PATHS: [&str; 3] = [
    "surge.toml",
    "/etc/surge/surge.toml",
    "~/.config/surge/surge.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Broadcast endpoint.
    #[serde(default)]
    pub output: OutputConfig,

    /// Ingestion endpoint.
    #[serde(default)]
    pub input: InputConfig,

    /// Hub tuning.
    #[serde(default)]
    pub hub: HubSection,

    /// Ingestion queue.
    #[serde(default)]
    pub ingest: IngestSection,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Broadcast endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Address to bind to.
    #[serde(default = "default_output_address")]
    pub address: String,

    /// WebSocket path.
    #[serde(default = "default_output_path")]
    pub path: String,

    /// Wire format for clients that do not pick one.
    #[serde(default)]
    pub format: WireFormat,
}

/// Ingestion endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Serve the ingestion endpoint.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind to.
    #[serde(default = "default_input_address")]
    pub address: String,

    /// WebSocket path.
    #[serde(default = "default_input_path")]
    pub path: String,
}

/// Hub configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubSection {
    /// Per-connection mailbox capacity.
    #[serde(default = "default_capacity")]
    pub mailbox_capacity: usize,

    /// Capacity of the broadcast queue in front of the hub.
    #[serde(default = "default_capacity")]
    pub broadcast_capacity: usize,

    /// Per-write deadline in milliseconds; 0 disables it.
    #[serde(default)]
    pub write_timeout_ms: u64,
}

/// Ingestion configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestSection {
    /// Capacity of the ingest queue.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Stage that receives ingested payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

/// Resource limits configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_output_address() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_output_path() -> String {
    "/out".to_string()
}

fn default_input_address() -> String {
    "127.0.0.1:4000".to_string()
}

fn default_input_path() -> String {
    "/in".to_string()
}

fn default_capacity() -> usize {
    256
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            address: default_output_address(),
            path: default_output_path(),
            format: WireFormat::default(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_input_address(),
            path: default_input_path(),
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_capacity(),
            broadcast_capacity: default_capacity(),
            write_timeout_ms: 0,
        }
    }
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            stage: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// With `path`, that file must exist. Without one, the first file of
    /// [`CONFIG_PATHS`] that exists is used, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or parsed, or the result
    /// does not validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                ensure!(
                    path.exists(),
                    "Config file not found: {}",
                    path.display()
                );
                Some(path.to_path_buf())
            }
            None => discover(),
        };
        Self::build(file.as_deref(), None)
    }

    /// Load configuration from a specific file, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Some(path.as_ref()), None)
    }

    fn build(file: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&Config::default())
                .context("Failed to encode default config")?,
        );

        if let Some(path) = file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| match file {
                Some(path) => format!("Failed to load config file: {}", path.display()),
                None => "Failed to load config".to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        self.output_addr()?;
        ensure!(self.hub.mailbox_capacity > 0, "hub.mailbox_capacity must be > 0");
        ensure!(
            self.hub.broadcast_capacity > 0,
            "hub.broadcast_capacity must be > 0"
        );
        ensure!(self.ingest.capacity > 0, "ingest.capacity must be > 0");
        ensure!(
            self.limits.max_message_size > 0,
            "limits.max_message_size must be > 0"
        );
        ensure!(
            self.output.path.starts_with('/'),
            "output.path must start with '/': {}",
            self.output.path
        );
        ensure!(
            self.output.path != HEALTH_PATH,
            "output.path must not be {}",
            HEALTH_PATH
        );

        if self.input.enabled {
            let input = self.input_addr()?;
            ensure!(
                self.input.path.starts_with('/'),
                "input.path must start with '/': {}",
                self.input.path
            );
            ensure!(
                self.input.path != HEALTH_PATH,
                "input.path must not be {}",
                HEALTH_PATH
            );
            if input == self.output_addr()? && self.input.path == self.output.path {
                bail!(
                    "input and output share {} and path {}",
                    input,
                    self.input.path
                );
            }
        }

        if self.metrics.enabled {
            ensure!(self.metrics.port > 0, "metrics.port must be > 0");
        }
        Ok(())
    }

    /// Address of the broadcast endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not parse.
    pub fn output_addr(&self) -> Result<SocketAddr> {
        parse_addr("output.address", &self.output.address)
    }

    /// Address of the ingestion endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not parse.
    pub fn input_addr(&self) -> Result<SocketAddr> {
        parse_addr("input.address", &self.input.address)
    }

    /// Hub settings.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            mailbox_capacity: self.hub.mailbox_capacity,
            broadcast_capacity: self.hub.broadcast_capacity,
            write_timeout: (self.hub.write_timeout_ms > 0)
                .then(|| Duration::from_millis(self.hub.write_timeout_ms)),
        }
    }

    /// Ingestion settings.
    #[must_use]
    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            capacity: self.ingest.capacity,
            stage: self.ingest.stage.clone(),
        }
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render config")
    }
}

fn discover() -> Option<PathBuf> {
    CONFIG_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}

fn parse_addr(key: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("{} is not a socket address: {}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn temp_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("surge-{}-{}.toml", name, std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.output.address, "127.0.0.1:5000");
        assert_eq!(config.output.path, "/out");
        assert_eq!(config.output.format, WireFormat::Json);
        assert!(config.input.enabled);
        assert_eq!(config.input.address, "127.0.0.1:4000");
        assert_eq!(config.hub.mailbox_capacity, 256);
        assert_eq!(config.ingest.stage, None);
        assert_eq!(config.metrics.port, 9090);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = Config::build(None, env(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.hub_config().write_timeout, None);
    }

    #[test]
    fn test_config_from_toml() {
        let path = temp_config(
            "from-toml",
            r#"
            [output]
            address = "0.0.0.0:7000"
            format = "msgpack"

            [hub]
            mailbox_capacity = 8
            write_timeout_ms = 250

            [ingest]
            stage = "json"
            "#,
        );

        let config = Config::build(Some(&path), env(&[])).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.output_addr().unwrap().port(), 7000);
        assert_eq!(config.output.path, "/out");
        assert_eq!(config.output.format, WireFormat::MsgPack);
        assert_eq!(config.hub.mailbox_capacity, 8);
        assert_eq!(
            config.hub_config().write_timeout,
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.ingest_config().stage.as_deref(), Some("json"));
    }

    #[test]
    fn test_env_overrides_file() {
        let path = temp_config("env", "[hub]\nmailbox_capacity = 8\n");

        let config = Config::build(
            Some(&path),
            env(&[
                ("SURGE_HUB__MAILBOX_CAPACITY", "32"),
                ("SURGE_INPUT__ENABLED", "false"),
            ]),
        )
        .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.hub.mailbox_capacity, 32);
        assert!(!config.input.enabled);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.hub.mailbox_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_address() {
        let mut config = Config::default();
        config.input.address = "localhost".to_string();
        assert!(config.validate().is_err());

        config.input.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_path_clash() {
        let mut config = Config::default();
        config.input.address = config.output.address.clone();
        assert!(config.validate().is_ok());

        config.input.path = config.output.path.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_health_path() {
        let mut config = Config::default();
        config.output.path = HEALTH_PATH.to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.input.path = HEALTH_PATH.to_string();
        assert!(config.validate().is_err());

        config.input.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_explicit_file() {
        assert!(Config::load(Some(Path::new("/nonexistent/surge.toml"))).is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.ingest.stage = Some("json".to_string());

        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[output]"));
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
