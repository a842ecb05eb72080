//! Node configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via K2MM_CONFIG)
//! 3. Environment variables

use k2mm_core::{BridgeMode, EngineConfig, DEFAULT_DATAGRAM_QUEUE_DEPTH, DEFAULT_FIFO_DEPTH};
use k2mm_protocol::{header_length, Endianness, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Link (engine) configuration.
    pub link: LinkConfig,
    /// Local memory backing the record bridge.
    pub memory: MemoryConfig,
    /// Periodic latency tests.
    pub tester: TesterConfig,
    /// Periodic probes.
    pub probe: ProbeConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("K2MM_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.link.apply_env_overrides();
        self.memory.apply_env_overrides();
        self.tester.apply_env_overrides();
        self.probe.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks the settings the engine would reject at construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine_config()
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        let beat_bytes = self.link.beat_width_bits / 8;
        let max = self.network.max_datagram_size;
        if max < beat_bytes {
            return Err(ConfigError::ValidationError(format!(
                "max_datagram_size {} is smaller than one beat",
                max
            )));
        }
        if self.tester.enabled {
            let size = header_length(beat_bytes) + (self.tester.length as usize + 1) * beat_bytes;
            if size > max {
                return Err(ConfigError::ValidationError(format!(
                    "tester length {} needs {}-byte datagrams, max_datagram_size is {}",
                    self.tester.length, size, max
                )));
            }
        }
        if self.probe.enabled {
            let size = header_length(beat_bytes) + self.probe.payload_bytes;
            if size > max {
                return Err(ConfigError::ValidationError(format!(
                    "probe payload of {} bytes needs {}-byte datagrams, max_datagram_size is {}",
                    self.probe.payload_bytes, size, max
                )));
            }
        }
        if self.tester.enabled && self.tester.peer.is_none() {
            return Err(ConfigError::ValidationError(
                "tester enabled but peer not set".to_string(),
            ));
        }
        if self.probe.enabled && self.probe.peer.is_none() {
            return Err(ConfigError::ValidationError(
                "probe enabled but peer not set".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the engine configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            beat_width_bits: self.link.beat_width_bits,
            address_width_bits: self.link.address_width_bits,
            endianness: self.link.endianness,
            bridge_mode: self.link.bridge_mode,
            fifo_depth: self.link.fifo_depth,
            datagram_queue_depth: self.link.datagram_queue_depth,
            default_peer: self
                .tester
                .peer
                .or(self.probe.peer)
                .unwrap_or_else(k2mm_core::stream::unspecified_peer),
        }
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

fn env_flag(value: &str) -> bool {
    value == "1" || value.to_lowercase() == "true"
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Largest datagram accepted or sent, in bytes.
    pub max_datagram_size: usize,
    /// Interval between engine ticks while idle, in microseconds.
    pub tick_interval_us: u64,
    /// Engine steps run per tick.
    pub steps_per_tick: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_datagram_size: 9000,
            tick_interval_us: 1000,
            steps_per_tick: 4096,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("K2MM_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(size) = std::env::var("K2MM_MAX_DATAGRAM") {
            if let Ok(n) = size.parse() {
                self.max_datagram_size = n;
            }
        }

        if let Ok(interval) = std::env::var("K2MM_TICK_INTERVAL_US") {
            if let Ok(us) = interval.parse() {
                self.tick_interval_us = us;
            }
        }
    }

    /// Returns the tick interval as Duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(self.tick_interval_us.max(1))
    }
}

/// Link configuration, fixed for the life of the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Beat width in bits.
    pub beat_width_bits: usize,
    /// Record address width in bits.
    pub address_width_bits: usize,
    /// Byte order of record words.
    pub endianness: Endianness,
    /// Channel depth between stages.
    pub fifo_depth: usize,
    /// Datagrams queued in and out of the engine.
    pub datagram_queue_depth: usize,
    /// Record bridge role.
    pub bridge_mode: BridgeMode,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            beat_width_bits: 32,
            address_width_bits: 32,
            endianness: Endianness::Big,
            fifo_depth: DEFAULT_FIFO_DEPTH,
            datagram_queue_depth: DEFAULT_DATAGRAM_QUEUE_DEPTH,
            bridge_mode: BridgeMode::Master,
        }
    }
}

impl LinkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(width) = std::env::var("K2MM_BEAT_WIDTH") {
            if let Ok(bits) = width.parse() {
                self.beat_width_bits = bits;
            }
        }

        if let Ok(width) = std::env::var("K2MM_ADDRESS_WIDTH") {
            if let Ok(bits) = width.parse() {
                self.address_width_bits = bits;
            }
        }

        if let Ok(endianness) = std::env::var("K2MM_ENDIANNESS") {
            self.endianness = match endianness.to_lowercase().as_str() {
                "little" | "le" => Endianness::Little,
                _ => Endianness::Big,
            };
        }

        if let Ok(depth) = std::env::var("K2MM_FIFO_DEPTH") {
            if let Ok(n) = depth.parse() {
                self.fifo_depth = n;
            }
        }

        if let Ok(depth) = std::env::var("K2MM_QUEUE_DEPTH") {
            if let Ok(n) = depth.parse() {
                self.datagram_queue_depth = n;
            }
        }

        if let Ok(mode) = std::env::var("K2MM_BRIDGE_MODE") {
            self.bridge_mode = match mode.to_lowercase().as_str() {
                "slave" => BridgeMode::Slave,
                _ => BridgeMode::Master,
            };
        }
    }
}

/// In-memory bus settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Extra polls before each bus access is acknowledged.
    pub wait_states: u32,
}

impl MemoryConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(wait) = std::env::var("K2MM_WAIT_STATES") {
            if let Ok(n) = wait.parse() {
                self.wait_states = n;
            }
        }
    }
}

/// Periodic latency test configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TesterConfig {
    pub enabled: bool,
    /// Peer receiving test frames.
    #[serde(with = "opt_socket_addr_serde")]
    pub peer: Option<SocketAddr>,
    /// Test frame length; the frame carries `length + 1` beats.
    pub length: u16,
    /// Interval between tests in milliseconds.
    pub interval_ms: u64,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            peer: None,
            length: 64,
            interval_ms: 1000,
        }
    }
}

impl TesterConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("K2MM_TESTER_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
        if let Ok(peer) = std::env::var("K2MM_TESTER_PEER") {
            if let Ok(parsed) = peer.parse() {
                self.peer = Some(parsed);
            }
        }
        if let Ok(length) = std::env::var("K2MM_TESTER_LENGTH") {
            if let Ok(n) = length.parse() {
                self.length = n;
            }
        }
        if let Ok(interval) = std::env::var("K2MM_TESTER_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.interval_ms = ms;
            }
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Periodic probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub enabled: bool,
    /// Peer receiving probe requests.
    #[serde(with = "opt_socket_addr_serde")]
    pub peer: Option<SocketAddr>,
    /// Probe payload size in bytes.
    pub payload_bytes: usize,
    /// Interval between probes in milliseconds.
    pub interval_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            peer: None,
            payload_bytes: 64,
            interval_ms: 1000,
        }
    }
}

impl ProbeConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("K2MM_PROBE_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
        if let Ok(peer) = std::env::var("K2MM_PROBE_PEER") {
            if let Ok(parsed) = peer.parse() {
                self.peer = Some(parsed);
            }
        }
        if let Ok(size) = std::env::var("K2MM_PROBE_PAYLOAD_BYTES") {
            if let Ok(n) = size.parse() {
                self.payload_bytes = n;
            }
        }
        if let Ok(interval) = std::env::var("K2MM_PROBE_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.interval_ms = ms;
            }
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("K2MM_METRICS_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
        if let Ok(addr) = std::env::var("K2MM_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod opt_socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &Option<SocketAddr>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match addr {
            Some(addr) => serializer.serialize_some(&addr.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SocketAddr>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| s.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 50000);
        assert_eq!(config.link.beat_width_bits, 32);
        assert_eq!(config.link.endianness, Endianness::Big);
        assert_eq!(config.link.bridge_mode, BridgeMode::Master);
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.tester.peer = Some("10.0.0.2:50000".parse().unwrap());
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.tester.peer, config.tester.peer);
        assert_eq!(parsed.probe.peer, None);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
link:
  beat_width_bits: 64
  endianness: little
  bridge_mode: slave
tester:
  enabled: true
  peer: "192.168.0.9:50000"
  length: 10
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.link.beat_width_bits, 64);
        assert_eq!(config.link.endianness, Endianness::Little);
        assert_eq!(config.link.bridge_mode, BridgeMode::Slave);
        assert_eq!(config.tester.length, 10);
        // Unset sections keep their defaults
        assert_eq!(config.network.bind_addr.port(), 50000);
        assert!(config.validate().is_ok());

        let engine = config.engine_config();
        assert_eq!(engine.default_peer, "192.168.0.9:50000".parse().unwrap());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/k2mm.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.link.beat_width_bits = 48;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.tester.enabled = true;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.max_datagram_size = 2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.link.datagram_queue_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_oversize_test_frames() {
        let mut config = Config::default();
        config.tester.enabled = true;
        config.tester.peer = Some("10.0.0.2:50000".parse().unwrap());
        config.network.max_datagram_size = 1000;

        // 8-byte header plus 248 four-byte beats fits exactly
        config.tester.length = 247;
        assert!(config.validate().is_ok());
        config.tester.length = 248;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        // Ignored while the tester is off
        config.tester.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_oversize_probe() {
        let mut config = Config::default();
        config.probe.enabled = true;
        config.probe.peer = Some("10.0.0.2:50000".parse().unwrap());
        config.network.max_datagram_size = 1000;

        config.probe.payload_bytes = 992;
        assert!(config.validate().is_ok());
        config.probe.payload_bytes = 993;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k2mm.yaml");

        let mut config = Config::default();
        config.memory.wait_states = 3;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.memory.wait_states, 3);
    }
}
