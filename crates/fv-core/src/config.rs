//! Configuration system for flipper-video

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub general: GeneralConfig,
    pub gfx: GfxConfig,
    pub paths: PathConfig,
    pub debug: DebugConfig,
}

/// Settings shared with the host emulator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Run CPU emulation and GPU command processing on separate threads
    pub dual_core: bool,
    /// Present from the emulated external framebuffer instead of the EFB
    pub use_xfb: bool,
    /// Presented frames per second, 0 for unlimited
    pub frame_limit: u32,
}

/// Graphics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GfxConfig {
    pub backend: GfxBackend,
    pub multisample: MultisampleMode,
    /// Internal EFB resolution multiplier (1 = native 640x528)
    pub efb_scale: u32,
    /// Persist compiled programs between sessions
    pub shader_cache: bool,
    /// Short-circuit program lookup when the previous signature repeats
    pub hot_program_path: bool,
    /// Name of the post-processing effect, empty for none
    pub post_processing_effect: String,
    /// Allow the CPU thread to peek and poke the EFB
    pub efb_access_enabled: bool,
}

/// Graphics backend type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum GfxBackend {
    #[default]
    Null,
}

/// Multisample anti-aliasing mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
pub enum MultisampleMode {
    #[default]
    Off,
    X2,
    X4,
    X8,
}

impl MultisampleMode {
    /// Number of samples per pixel
    pub fn samples(self) -> u32 {
        match self {
            Self::Off => 1,
            Self::X2 => 2,
            Self::X4 => 4,
            Self::X8 => 8,
        }
    }

    pub fn is_enabled(self) -> bool {
        self != Self::Off
    }
}

/// Path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub shader_cache: PathBuf,
    /// Where relative screenshot names are saved
    pub screenshots: PathBuf,
}

/// Debug settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub log_to_file: bool,
    pub log_path: PathBuf,
    /// Write generated program source next to the program store
    pub dump_shaders: bool,
}

/// Logging level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

// Default implementations

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            dual_core: true,
            use_xfb: false,
            frame_limit: 60,
        }
    }
}

impl Default for GfxConfig {
    fn default() -> Self {
        Self {
            backend: GfxBackend::default(),
            multisample: MultisampleMode::default(),
            efb_scale: 1,
            shader_cache: true,
            hot_program_path: true,
            post_processing_effect: String::new(),
            efb_access_enabled: true,
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("flipper-video");

        Self {
            shader_cache: base.join("cache/programs"),
            screenshots: base.join("screenshots"),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_to_file: false,
            log_path: PathBuf::from("flipper-video.log"),
            dump_shaders: false,
        }
    }
}

impl Config {
    /// Load configuration from the default location, or create it if missing
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, writing defaults there if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("flipper-video")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.general.dual_core);
        assert!(!config.general.use_xfb);
        assert_eq!(config.gfx.multisample, MultisampleMode::Off);
        assert_eq!(config.gfx.efb_scale, 1);
        assert!(config.gfx.hot_program_path);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.gfx.multisample = MultisampleMode::X4;
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.gfx.multisample, MultisampleMode::X4);
        assert_eq!(parsed.general.dual_core, config.general.dual_core);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("[general]\ndual_core = false\n").unwrap();
        assert!(!parsed.general.dual_core);
        assert_eq!(parsed.general.frame_limit, 60);
        assert!(parsed.gfx.shader_cache);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = std::env::temp_dir().join("fv_config_test");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.gfx.efb_scale, 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_multisample_samples() {
        assert_eq!(MultisampleMode::Off.samples(), 1);
        assert_eq!(MultisampleMode::X4.samples(), 4);
        assert!(!MultisampleMode::Off.is_enabled());
        assert!(MultisampleMode::X2.is_enabled());
    }
}
