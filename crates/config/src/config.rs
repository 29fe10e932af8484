//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Storage layout root
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory holding `jobs/`, `tmp/`, `outputs/` and `uploads/`
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("storage")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

/// Scheduler loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Seconds to sleep between scans when no job is queued
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Output height used when a job does not request one
    #[serde(default = "default_target_height")]
    pub default_target_height: u32,
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_target_height() -> u32 {
    1080
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            default_target_height: default_target_height(),
        }
    }
}

/// External tool program names
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
        }
    }
}

/// Which compute the upscaler may use
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    /// Use the neural model when a GPU execution provider is available
    #[default]
    Auto,
    /// Always use the resampling filter
    Cpu,
}

impl std::str::FromStr for Accelerator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Accelerator::Auto),
            "cpu" => Ok(Accelerator::Cpu),
            other => Err(format!("unknown accelerator '{}'", other)),
        }
    }
}

/// Upscaling strategy settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpscaleConfig {
    /// ONNX weights for the neural super-resolution model
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    #[serde(default)]
    pub accelerator: Accelerator,
}

fn default_model_path() -> PathBuf {
    PathBuf::from("weights/RealESRGAN_x4plus.onnx")
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            accelerator: Accelerator::default(),
        }
    }
}

/// Final encode quality settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    /// libx264 constant rate factor
    #[serde(default = "default_crf")]
    pub crf: u8,
    /// libx264 preset
    #[serde(default = "default_preset")]
    pub preset: String,
    /// AAC bitrate for the remuxed audio track
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
}

fn default_crf() -> u8 {
    18
}

fn default_preset() -> String {
    "slow".to_string()
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            crf: default_crf(),
            preset: default_preset(),
            audio_bitrate: default_audio_bitrate(),
        }
    }
}

/// Read-only status endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    #[serde(default = "default_server_bind")]
    pub bind: String,
}

fn default_server_enabled() -> bool {
    true
}

fn default_server_bind() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            bind: default_server_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub upscale: UpscaleConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - STORAGE_ROOT -> storage.root
    /// - WORKER_POLL_INTERVAL_SECS -> worker.poll_interval_secs
    /// - WORKER_DEFAULT_TARGET_HEIGHT -> worker.default_target_height
    /// - UPSCALE_MODEL_PATH -> upscale.model_path
    /// - UPSCALE_ACCELERATOR -> upscale.accelerator
    /// - STATUS_SERVER_ENABLED -> server.enabled
    /// - STATUS_SERVER_BIND -> server.bind
    ///
    /// Unparsable values are ignored and the existing value is kept.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("STORAGE_ROOT") {
            if !val.trim().is_empty() {
                self.storage.root = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("WORKER_POLL_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.worker.poll_interval_secs = secs;
            }
        }

        if let Ok(val) = env::var("WORKER_DEFAULT_TARGET_HEIGHT") {
            if let Ok(height) = val.parse::<u32>() {
                self.worker.default_target_height = height;
            }
        }

        if let Ok(val) = env::var("UPSCALE_MODEL_PATH") {
            if !val.trim().is_empty() {
                self.upscale.model_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("UPSCALE_ACCELERATOR") {
            if let Ok(accelerator) = val.parse::<Accelerator>() {
                self.upscale.accelerator = accelerator;
            }
        }

        if let Ok(val) = env::var("STATUS_SERVER_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.server.enabled = true,
                "false" | "0" | "no" => self.server.enabled = false,
                _ => {}
            }
        }

        if let Ok(val) = env::var("STATUS_SERVER_BIND") {
            if !val.trim().is_empty() {
                self.server.bind = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    ///
    /// Environment overrides are applied in both cases.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.worker.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("STORAGE_ROOT");
        env::remove_var("WORKER_POLL_INTERVAL_SECS");
        env::remove_var("WORKER_DEFAULT_TARGET_HEIGHT");
        env::remove_var("UPSCALE_MODEL_PATH");
        env::remove_var("UPSCALE_ACCELERATOR");
        env::remove_var("STATUS_SERVER_ENABLED");
        env::remove_var("STATUS_SERVER_BIND");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            root in "[a-z0-9_/]{1,30}",
            poll in 1u64..600,
            height in 144u32..4320,
            crf in 0u8..51,
            cpu_only in proptest::bool::ANY,
            enabled in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[storage]
root = "{}"

[worker]
poll_interval_secs = {}
default_target_height = {}

[upscale]
accelerator = "{}"

[encode]
crf = {}

[server]
enabled = {}
"#,
                root,
                poll,
                height,
                if cpu_only { "cpu" } else { "auto" },
                crf,
                enabled,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.storage.root, PathBuf::from(&root));
            prop_assert_eq!(config.worker.poll_interval_secs, poll);
            prop_assert_eq!(config.worker.default_target_height, height);
            prop_assert_eq!(
                config.upscale.accelerator,
                if cpu_only { Accelerator::Cpu } else { Accelerator::Auto }
            );
            prop_assert_eq!(config.encode.crf, crf);
            prop_assert_eq!(config.server.enabled, enabled);
        }

        #[test]
        fn prop_env_overrides_poll_interval(
            initial in 1u64..60,
            override_secs in 1u64..600,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[worker]\npoll_interval_secs = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("WORKER_POLL_INTERVAL_SECS", override_secs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.worker.poll_interval_secs, override_secs);
        }

        #[test]
        fn prop_env_overrides_default_target_height(
            initial in 144u32..2160,
            override_height in 144u32..4320,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[worker]\ndefault_target_height = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("WORKER_DEFAULT_TARGET_HEIGHT", override_height.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.worker.default_target_height, override_height);
        }

        #[test]
        fn prop_env_overrides_server_enabled(
            initial in proptest::bool::ANY,
            override_enabled in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[server]\nenabled = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("STATUS_SERVER_ENABLED", override_enabled.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.server.enabled, override_enabled);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.storage.root, PathBuf::from("storage"));
        assert_eq!(config.worker.poll_interval_secs, 3);
        assert_eq!(config.worker.default_target_height, 1080);
        assert_eq!(config.tools.ffmpeg, "ffmpeg");
        assert_eq!(config.tools.ffprobe, "ffprobe");
        assert_eq!(
            config.upscale.model_path,
            PathBuf::from("weights/RealESRGAN_x4plus.onnx")
        );
        assert_eq!(config.upscale.accelerator, Accelerator::Auto);
        assert_eq!(config.encode.crf, 18);
        assert_eq!(config.encode.preset, "slow");
        assert_eq!(config.encode.audio_bitrate, "192k");
        assert!(config.server.enabled);
        assert_eq!(config.server.bind, "127.0.0.1:7879");
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[upscale]
accelerator = "cpu"
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.upscale.accelerator, Accelerator::Cpu);
        assert_eq!(
            config.upscale.model_path,
            PathBuf::from("weights/RealESRGAN_x4plus.onnx")
        );
        assert_eq!(config.worker.poll_interval_secs, 3);
    }

    #[test]
    fn test_unknown_accelerator_is_a_parse_error() {
        let result = Config::parse_toml("[upscale]\naccelerator = \"tpu\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_invalid_env_values_keep_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("WORKER_POLL_INTERVAL_SECS", "soon");
        env::set_var("UPSCALE_ACCELERATOR", "tpu");
        env::set_var("STATUS_SERVER_ENABLED", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.worker.poll_interval_secs, 3);
        assert_eq!(config.upscale.accelerator, Accelerator::Auto);
        assert!(config.server.enabled);
    }

    #[test]
    fn test_env_overrides_paths_and_accelerator() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("STORAGE_ROOT", "/srv/upscale");
        env::set_var("UPSCALE_MODEL_PATH", "/models/x4.onnx");
        env::set_var("UPSCALE_ACCELERATOR", "CPU");
        env::set_var("STATUS_SERVER_BIND", "0.0.0.0:9000");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.storage.root, PathBuf::from("/srv/upscale"));
        assert_eq!(config.upscale.model_path, PathBuf::from("/models/x4.onnx"));
        assert_eq!(config.upscale.accelerator, Accelerator::Cpu);
        assert_eq!(config.server.bind, "0.0.0.0:9000");
    }

    #[test]
    fn test_load_or_default_with_missing_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let config = Config::load_or_default("/nonexistent/dir/config.toml")
            .expect("Missing file should fall back to defaults");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = Config::load("/nonexistent/dir/config.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_poll_interval_duration() {
        let config = Config::default();
        assert_eq!(config.poll_interval(), std::time::Duration::from_secs(3));
    }
}
