// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every table and field has a default, so a missing file (or a missing
// field) never stops the walkthrough. Command line flags are applied on top
// of whatever was loaded.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub application: ApplicationConfig,
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub device: DeviceConfig,
    pub debug: DebugConfig,
}

/// Names and versions reported to the driver through `VkApplicationInfo`
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    pub engine_name: String,
    pub version: [u32; 3],
    pub engine_version: [u32; 3],
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "myVulkan Application".to_string(),
            engine_name: "My Game Engine".to_string(),
            version: [1, 0, 0],
            engine_version: [0, 1, 0],
        }
    }
}

impl ApplicationConfig {
    pub fn api_version(&self) -> u32 {
        let [major, minor, patch] = self.version;
        vk::make_api_version(0, major, minor, patch)
    }

    pub fn engine_api_version(&self) -> u32 {
        let [major, minor, patch] = self.engine_version;
        vk::make_api_version(0, major, minor, patch)
    }
}

/// Window settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan".to_string(),
            width: 800,
            height: 600,
            resizable: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub min_image_count: u32,
    pub fence_timeout_ms: u64,
    /// Stop after this many presented frames. `None` runs until the window closes.
    pub frame_limit: Option<u64>,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [1.0, 0.0, 0.0, 1.0],
            min_image_count: 2,
            fence_timeout_ms: 10_000,
            frame_limit: None,
        }
    }
}

/// Physical device selection
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    /// "first", "discrete" or "integrated"
    pub preference: String,
    /// Explicit enumeration index, wins over `preference`
    pub index: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            preference: "first".to_string(),
            index: None,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "vulkan_debug.log".to_string(),
            show_fps: true,
        }
    }
}

/// How the physical device gets picked out of the enumeration list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSelection {
    Index(usize),
    Prefer(vk::PhysicalDeviceType),
}

/// Where a loaded configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// No file at the path
    Defaults,
}

impl ConfigSource {
    /// Startup log line for a configuration loaded from `path`
    pub fn describe(self, path: &Path) -> String {
        match self {
            ConfigSource::File => format!("Loaded configuration from {:?}", path),
            ConfigSource::Defaults => {
                format!("Config file not found at {:?}, using defaults", path)
            }
        }
    }
}

impl Config {
    /// Load configuration from a specific path.
    ///
    /// Runs before logging is set up, so the caller logs the outcome.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<(Self, ConfigSource)> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok((Config::default(), ConfigSource::Defaults));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok((config, ConfigSource::File))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    pub fn device_selection(&self) -> DeviceSelection {
        if let Some(index) = self.device.index {
            return DeviceSelection::Index(index);
        }
        match self.device.preference.to_lowercase().as_str() {
            "first" => DeviceSelection::Index(0),
            "discrete" => DeviceSelection::Prefer(vk::PhysicalDeviceType::DISCRETE_GPU),
            "integrated" => DeviceSelection::Prefer(vk::PhysicalDeviceType::INTEGRATED_GPU),
            other => {
                log::warn!("Unknown device preference '{}', using the first device", other);
                DeviceSelection::Index(0)
            }
        }
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.graphics.fence_timeout_ms)
    }

    pub fn clear_color(&self) -> vk::ClearColorValue {
        vk::ClearColorValue {
            float32: self.graphics.clear_color.map(|c| c.clamp(0.0, 1.0)),
        }
    }

    /// Validation only ever runs in debug builds
    pub fn enable_validation(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or_else(|_| {
            eprintln!("Unknown log level '{}', using info", self.debug.log_level);
            log::LevelFilter::Info
        })
    }
}
