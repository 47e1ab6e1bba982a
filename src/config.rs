use crate::errors::{HlsError, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

pub struct ConfigManager {
    settings: Settings,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        let settings = Self::load_config()?;
        Ok(Self { settings })
    }

    fn find_config_file() -> Result<PathBuf> {
        let possible_paths = [
            std::env::var("XHLS_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("conf.yaml")),
            Some(PathBuf::from("config/conf.yaml")),
            Some(PathBuf::from("/etc/xhls/conf.yaml")),
        ];

        for path in possible_paths.iter().flatten() {
            if path.exists() {
                log::info!("Using config file: {}", path.display());
                return Ok(path.clone());
            }
        }

        Err(HlsError::ConfigError {
            message: "No configuration file found. Tried: conf.yaml, config/conf.yaml, /etc/xhls/conf.yaml".to_string(),
        })
    }

    fn load_config() -> Result<Settings> {
        let mut config = Config::builder();

        if let Ok(config_path) = Self::find_config_file() {
            config = config.add_source(File::from(config_path.as_ref()));
        } else {
            log::warn!("No config file found, using defaults and environment variables only");
        }

        config = config.add_source(Environment::with_prefix("XHLS").separator("_"));

        config = config
            .set_default("log_level", "info")?
            .set_default("hls.port", 8888)?
            .set_default("hls.segment_count", 3)?
            .set_default("hls.segment_duration", 10)?
            .set_default("hls.read_buffer_count", 512)?
            .set_default("hls.close_after_inactivity", 60)?
            .set_default("auth.read_user", "")?
            .set_default("auth.read_pass", "")?
            .set_default("auth.read_ips", Vec::<String>::new())?;

        let config = config.build().map_err(|e| HlsError::ConfigError {
            message: format!("Failed to build config: {}", e),
        })?;

        config.try_deserialize().map_err(|e| HlsError::ConfigError {
            message: format!("Failed to deserialize config: {}", e),
        })
    }

    pub fn get_settings(&self) -> &Settings {
        &self.settings
    }
}

pub fn get_setting() -> Settings {
    match ConfigManager::new() {
        Ok(manager) => manager.settings,
        Err(e) => {
            log::error!("Failed to load config: {}", e);
            Settings::default()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub log_level: String,
    pub hls: Hls,
    pub auth: Auth,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            hls: Hls::default(),
            auth: Auth::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Hls {
    pub port: i32,
    /// Number of live segments kept in the sliding window.
    pub segment_count: usize,
    /// Target segment duration in seconds; also the EXTINF value.
    pub segment_duration: u64,
    /// Capacity of the ingestion ring, in RTP payload records.
    pub read_buffer_count: usize,
    /// Seconds without an HTTP request before a client is closed.
    pub close_after_inactivity: u64,
}

impl Default for Hls {
    fn default() -> Self {
        Self {
            port: 8888,
            segment_count: 3,
            segment_duration: 10,
            read_buffer_count: 512,
            close_after_inactivity: 60,
        }
    }
}

/// Read-side access control. Empty user disables Basic auth, empty IP list
/// allows every address.
#[derive(Debug, Deserialize, Clone)]
pub struct Auth {
    pub read_user: String,
    pub read_pass: String,
    pub read_ips: Vec<String>,
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            read_user: String::new(),
            read_pass: String::new(),
            read_ips: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.hls.port, 8888);
        assert_eq!(settings.hls.segment_count, 3);
        assert_eq!(settings.hls.segment_duration, 10);
        assert!(settings.auth.read_user.is_empty());
        assert!(settings.auth.read_ips.is_empty());
    }
}
