//! Configuration module
//!
//! Handles loading and saving AcSync configuration.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{
    AircraftDetail, SettingsFlags, SettingsRecord, WireRecord, DEFAULT_BUFFER_SIZE,
    DEFAULT_MULTICAST_GROUP, DEFAULT_PORT, DEFAULT_TTL, HEADER_SIZE, MAX_DATAGRAM_SIZE,
};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Protocol timing
    #[serde(default)]
    pub timing: TimingConfig,

    /// Values broadcast to receivers in the settings message
    #[serde(default)]
    pub settings: SettingsConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Display name sent to receivers
    #[serde(default = "default_name")]
    pub name: String,
    /// Sender id in message headers (random if not set)
    pub sender_id: Option<u16>,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "acsync".to_string())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            sender_id: None,
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Multicast group all instances join
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    /// UDP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Multicast time-to-live
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    /// Maximum datagram size
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Position update frequency [Hz]
    #[serde(default = "default_transmit_hz")]
    pub transmit_hz: u32,
    /// Interface to send and join on (default: any)
    pub bind_address: Option<Ipv4Addr>,
}

fn default_multicast_group() -> Ipv4Addr {
    DEFAULT_MULTICAST_GROUP
        .parse()
        .unwrap_or(Ipv4Addr::new(239, 255, 1, 1))
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_ttl() -> u32 {
    DEFAULT_TTL
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_transmit_hz() -> u32 {
    5
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            multicast_group: default_multicast_group(),
            port: default_port(),
            ttl: default_ttl(),
            buffer_size: default_buffer_size(),
            transmit_hz: default_transmit_hz(),
            bind_address: None,
        }
    }
}

/// Protocol timing, all values in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Receiver sends an interest beacon after this much silence
    #[serde(default = "default_beacon_interval")]
    pub beacon_interval_secs: u64,
    /// Sender re-broadcasts its settings this often
    #[serde(default = "default_settings_interval")]
    pub settings_interval_secs: u64,
    /// Every aircraft sends a full detail record this often
    #[serde(default = "default_full_detail_interval")]
    pub full_detail_interval_secs: u32,
    /// Sender stops sending after this long without a beacon
    #[serde(default = "default_interest_timeout")]
    pub interest_timeout_secs: u64,
    /// Receiver drops a sender after this long without any message
    #[serde(default = "default_sender_timeout")]
    pub sender_timeout_secs: u64,
    /// How often the receiver looks for silent senders
    #[serde(default = "default_sender_cleanup")]
    pub sender_cleanup_secs: u64,
}

fn default_beacon_interval() -> u64 {
    15
}

fn default_settings_interval() -> u64 {
    20
}

fn default_full_detail_interval() -> u32 {
    10
}

fn default_interest_timeout() -> u64 {
    45
}

fn default_sender_timeout() -> u64 {
    2 * default_settings_interval()
}

fn default_sender_cleanup() -> u64 {
    10
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            beacon_interval_secs: default_beacon_interval(),
            settings_interval_secs: default_settings_interval(),
            full_detail_interval_secs: default_full_detail_interval(),
            interest_timeout_secs: default_interest_timeout(),
            sender_timeout_secs: default_sender_timeout(),
            sender_cleanup_secs: default_sender_cleanup(),
        }
    }
}

impl TimingConfig {
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_secs(self.beacon_interval_secs)
    }

    pub fn settings_interval(&self) -> Duration {
        Duration::from_secs(self.settings_interval_secs)
    }

    pub fn interest_timeout(&self) -> Duration {
        Duration::from_secs(self.interest_timeout_secs)
    }

    pub fn sender_timeout(&self) -> Duration {
        Duration::from_secs(self.sender_timeout_secs)
    }

    pub fn sender_cleanup(&self) -> Duration {
        Duration::from_secs(self.sender_cleanup_secs)
    }
}

/// Sender settings broadcast to receivers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Maximum label draw distance [m]
    #[serde(default = "default_max_label_dist")]
    pub max_label_dist: f32,
    /// ICAO type used when no model matches
    #[serde(default = "default_icao")]
    pub default_icao: String,
    /// ICAO type of ground vehicles
    #[serde(default = "default_car_icao")]
    pub car_icao: String,
    /// Remote logging level, 0 (debug) to 7
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    #[serde(default)]
    pub log_model_match: bool,
    #[serde(default)]
    pub replace_obj_datarefs: bool,
    #[serde(default)]
    pub replace_obj_textures: bool,
    #[serde(default = "default_true")]
    pub label_cutoff_at_visibility: bool,
    #[serde(default = "default_true")]
    pub map_enabled: bool,
    #[serde(default = "default_true")]
    pub map_labels: bool,
    #[serde(default)]
    pub have_tcas_control: bool,
}

fn default_max_label_dist() -> f32 {
    // 3 nm
    5556.0
}

fn default_icao() -> String {
    "A320".to_string()
}

fn default_car_icao() -> String {
    "ZZZC".to_string()
}

fn default_log_level() -> u8 {
    2
}

fn default_true() -> bool {
    true
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            max_label_dist: default_max_label_dist(),
            default_icao: default_icao(),
            car_icao: default_car_icao(),
            log_level: default_log_level(),
            log_model_match: false,
            replace_obj_datarefs: false,
            replace_obj_textures: false,
            label_cutoff_at_visibility: default_true(),
            map_enabled: default_true(),
            map_labels: default_true(),
            have_tcas_control: false,
        }
    }
}

impl SettingsConfig {
    pub fn flags(&self) -> SettingsFlags {
        SettingsFlags {
            log_level: self.log_level.min(7),
            log_model_match: self.log_model_match,
            replace_obj_datarefs: self.replace_obj_datarefs,
            replace_obj_textures: self.replace_obj_textures,
            label_cutoff_at_visibility: self.label_cutoff_at_visibility,
            map_enabled: self.map_enabled,
            map_labels: self.map_labels,
            have_tcas_control: self.have_tcas_control,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;
        config.sender_id();
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("acsync/config.toml")),
            Some(PathBuf::from("./acsync.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        let mut config = Self::default();
        config.sender_id();
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values the protocol cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.network.multicast_group.is_multicast() {
            return Err(ConfigError::Invalid(format!(
                "{} is not a multicast address",
                self.network.multicast_group
            )));
        }
        let min_buffer = HEADER_SIZE + AircraftDetail::SIZE;
        if self.network.buffer_size < min_buffer {
            return Err(ConfigError::Invalid(format!(
                "buffer_size must be at least {} bytes",
                min_buffer
            )));
        }
        if self.network.buffer_size > MAX_DATAGRAM_SIZE {
            return Err(ConfigError::Invalid(format!(
                "buffer_size must be at most {} bytes",
                MAX_DATAGRAM_SIZE
            )));
        }
        if self.network.transmit_hz == 0 {
            return Err(ConfigError::Invalid("transmit_hz must be positive".to_string()));
        }
        if self.settings.log_level > 7 {
            return Err(ConfigError::Invalid("log_level must be 0..=7".to_string()));
        }
        Ok(())
    }

    /// Get the sender id. An unset id is drawn at random once and kept.
    pub fn sender_id(&mut self) -> u16 {
        *self
            .general
            .sender_id
            .get_or_insert_with(|| (uuid::Uuid::new_v4().as_u128() & 0xFFFF) as u16)
    }

    /// Settings message content
    pub fn settings_record(&self) -> SettingsRecord {
        SettingsRecord {
            name: self.general.name.as_str().into(),
            max_label_dist: self.settings.max_label_dist,
            default_icao: self.settings.default_icao.as_str().into(),
            car_icao: self.settings.car_icao.as_str().into(),
            flags: self.settings.flags(),
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "Tower PC".to_string(),
            sender_id: Some(0x0A51),
            verbose: false,
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
