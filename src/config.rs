//! Configuration layer: one sub-struct per component, `#[serde(default = ...)]`
//! on every field, loaded through `config::Config::builder()` with explicit
//! defaults, an optional TOML file, then `USTREAMER_`-prefixed env vars.

use crate::error::{Result, UstreamerError};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
    pub stream: StreamConfig,
    pub sinks: SinksConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CaptureConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_desired_fps")]
    pub desired_fps: u32,
    #[serde(default = "default_device")]
    pub device: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EncoderConfig {
    #[serde(default = "default_encoder_type")]
    pub r#type: String,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default = "default_n_workers")]
    pub n_workers: usize,
    #[serde(default)]
    pub desired_interval_secs: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_drop_same_frames")]
    pub drop_same_frames: u32,
    #[serde(default)]
    pub tcp_nodelay: bool,
    #[serde(default)]
    pub exit_on_no_clients_secs: u64,
    #[serde(default)]
    pub cors: bool,
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SinksConfig {
    pub jpeg: Option<SinkConfig>,
    pub h264: Option<SinkConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SinkConfig {
    pub path: String,
    pub object_suffix: String,
    #[serde(default = "default_sink_mode")]
    pub mode: u32,
    #[serde(default)]
    pub rm: bool,
    #[serde(default = "default_client_ttl_secs")]
    pub client_ttl_secs: f64,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default)]
    pub slowdown: bool,
    #[serde(default = "default_error_delay_secs")]
    pub error_delay_secs: f64,
    /// Path to a TTF/OTF font used to render the `< NO SIGNAL >` label on
    /// the blank placeholder frame. Left unset, the blank frame is rendered
    /// without text rather than bundling a font into the binary.
    #[serde(default)]
    pub blank_font_path: Option<String>,
}

fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_fps() -> u32 {
    30
}
fn default_desired_fps() -> u32 {
    30
}
fn default_device() -> String {
    "synthetic".to_string()
}
fn default_encoder_type() -> String {
    "cpu".to_string()
}
fn default_quality() -> u8 {
    80
}
fn default_n_workers() -> usize {
    2
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_drop_same_frames() -> u32 {
    10
}
fn default_sink_mode() -> u32 {
    0o660
}
fn default_client_ttl_secs() -> f64 {
    5.0
}
fn default_lock_timeout_secs() -> f64 {
    1.0
}
fn default_ring_capacity() -> usize {
    4
}
fn default_error_delay_secs() -> f64 {
    1.0
}

impl ServerConfig {
    pub fn load_from_file<P: AsRef<Path>>(
        path: P,
    ) -> std::result::Result<Self, config::ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("capture.width", default_width())?
            .set_default("capture.height", default_height())?
            .set_default("capture.fps", default_fps())?
            .set_default("capture.desired_fps", default_desired_fps())?
            .set_default("capture.device", default_device())?
            .set_default("encoder.type", default_encoder_type())?
            .set_default("encoder.quality", default_quality() as i64)?
            .set_default("encoder.n_workers", default_n_workers() as i64)?
            .set_default("encoder.desired_interval_secs", 0.0)?
            .set_default("stream.host", default_host())?
            .set_default("stream.port", default_port() as i64)?
            .set_default("stream.drop_same_frames", default_drop_same_frames())?
            .set_default("stream.tcp_nodelay", false)?
            .set_default("stream.exit_on_no_clients_secs", 0)?
            .set_default("stream.cors", false)?
            .set_default("system.ring_capacity", default_ring_capacity() as i64)?
            .set_default("system.slowdown", false)?
            .set_default("system.error_delay_secs", default_error_delay_secs())?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("USTREAMER").separator("_"))
            .build()?;

        let config: ServerConfig = settings.try_deserialize()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub fn load() -> std::result::Result<Self, config::ConfigError> {
        Self::load_from_file("ustreamer.toml")
    }

    /// Zero-checks that map to `InvalidConfig`.
    pub fn validate(&self) -> Result<()> {
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(UstreamerError::InvalidConfig(
                "capture resolution must be greater than 0".into(),
            ));
        }
        if self.capture.fps == 0 {
            return Err(UstreamerError::InvalidConfig(
                "capture fps must be greater than 0".into(),
            ));
        }
        if self.encoder.n_workers == 0 {
            return Err(UstreamerError::InvalidConfig(
                "encoder.n_workers must be greater than 0".into(),
            ));
        }
        if self.system.ring_capacity == 0 {
            return Err(UstreamerError::InvalidConfig(
                "system.ring_capacity must be greater than 0".into(),
            ));
        }
        if self.stream.port == 0 {
            return Err(UstreamerError::InvalidConfig(
                "stream.port must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                width: default_width(),
                height: default_height(),
                fps: default_fps(),
                desired_fps: default_desired_fps(),
                device: default_device(),
            },
            encoder: EncoderConfig {
                r#type: default_encoder_type(),
                quality: default_quality(),
                n_workers: default_n_workers(),
                desired_interval_secs: 0.0,
            },
            stream: StreamConfig {
                host: default_host(),
                port: default_port(),
                drop_same_frames: default_drop_same_frames(),
                tcp_nodelay: false,
                exit_on_no_clients_secs: 0,
                cors: false,
                auth: None,
            },
            sinks: SinksConfig::default(),
            system: SystemConfig {
                ring_capacity: default_ring_capacity(),
                slowdown: false,
                error_delay_secs: default_error_delay_secs(),
                blank_font_path: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        let cfg = ServerConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_fps_is_invalid() {
        let mut cfg = ServerConfig::default();
        cfg.capture.fps = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_ring_capacity_is_invalid() {
        let mut cfg = ServerConfig::default();
        cfg.system.ring_capacity = 0;
        assert!(cfg.validate().is_err());
    }
}
