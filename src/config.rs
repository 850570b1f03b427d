//! Engine configuration file support.
//!
//! Settings are stored as versioned JSON. Every field has a serde default,
//! so a partial file loads with the remaining values at their defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BRUSH_SIZE, DEFAULT_HANDLE_HIT_RADIUS, DEFAULT_KEYPOINT_HIT_RADIUS,
    DEFAULT_MIN_BOX_SIZE, DEFAULT_MIN_DRAG_DISTANCE, DEFAULT_POLYGON_CLOSE_DISTANCE,
    DEFAULT_UNDO_HISTORY, zoom,
};
use crate::error::ConfigError;

/// Log level setting for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Show only errors
    Error,
    /// Show errors and warnings
    Warn,
    /// Show errors, warnings, and info messages
    #[default]
    Info,
    /// Show debug-level logging
    Debug,
    /// Show all log messages including trace
    Trace,
}

impl LogLevel {
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Convert to log crate's LevelFilter.
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Current configuration file format version.
/// Increment this when making breaking changes to the config format.
pub const CONFIG_VERSION: u32 = 1;

/// Editing thresholds and view limits.
///
/// Distances named `*_radius` / `*_distance` are canvas pixels, so they
/// feel the same at every zoom. `min_box_size` and `brush_size` are image
/// pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EditorSettings {
    /// Boxes must be strictly larger than this in both dimensions
    pub min_box_size: f32,
    pub handle_hit_radius: f32,
    /// Pointer travel before a press on an annotation becomes a drag
    pub min_drag_distance: f32,
    pub polygon_close_distance: f32,
    pub keypoint_hit_radius: f32,
    pub undo_history: usize,
    pub brush_size: f32,
    pub min_zoom: f32,
    pub max_zoom: f32,
    pub zoom_step: f32,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            min_box_size: DEFAULT_MIN_BOX_SIZE,
            handle_hit_radius: DEFAULT_HANDLE_HIT_RADIUS,
            min_drag_distance: DEFAULT_MIN_DRAG_DISTANCE,
            polygon_close_distance: DEFAULT_POLYGON_CLOSE_DISTANCE,
            keypoint_hit_radius: DEFAULT_KEYPOINT_HIT_RADIUS,
            undo_history: DEFAULT_UNDO_HISTORY,
            brush_size: DEFAULT_BRUSH_SIZE,
            min_zoom: zoom::MIN,
            max_zoom: zoom::MAX,
            zoom_step: zoom::STEP,
        }
    }
}

/// Autosave timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoSaveSettings {
    pub enabled: bool,
    /// Quiet period after the last change before saving
    pub debounce_ms: u64,
    /// Unconditional save period while changes are pending
    pub interval_ms: u64,
}

impl Default for AutoSaveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 2_000,
            interval_ms: 30_000,
        }
    }
}

/// Engine configuration that can be exported and imported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Version of the configuration file format
    pub version: u32,
    pub log_level: LogLevel,
    pub editor: EditorSettings,
    pub autosave: AutoSaveSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            log_level: LogLevel::default(),
            editor: EditorSettings::default(),
            autosave: AutoSaveSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize configuration from JSON, refusing newer file versions
    /// and out-of-range values.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;

        if config.version > CONFIG_VERSION {
            return Err(ConfigError::VersionTooNew {
                file_version: config.version,
                supported_version: CONFIG_VERSION,
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let e = &self.editor;
        if !(e.min_zoom > 0.0 && e.max_zoom >= e.min_zoom) {
            return Err(ConfigError::Invalid(format!(
                "zoom range {}..{} is empty or not positive",
                e.min_zoom, e.max_zoom
            )));
        }
        if e.zoom_step <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "zoom step {} must be greater than 1",
                e.zoom_step
            )));
        }
        if e.brush_size <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "brush size {} must be positive",
                e.brush_size
            )));
        }
        if e.min_box_size < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "minimum box size {} is negative",
                e.min_box_size
            )));
        }
        if e.undo_history == 0 {
            return Err(ConfigError::Invalid("undo history must hold at least one step".into()));
        }
        Ok(())
    }

    pub fn default_filename() -> &'static str {
        "config.json"
    }

    /// Default config file path, under the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(config_dir) = dirs::config_dir() {
            Some(config_dir.join("annocanvas").join(Self::default_filename()))
        } else {
            dirs::home_dir().map(|home_dir| {
                home_dir
                    .join(".config")
                    .join("annocanvas")
                    .join(Self::default_filename())
            })
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Load from `path` (or the default path), falling back to defaults
    /// when the file is missing or unreadable.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => {
                    log::debug!("No config directory; using defaults");
                    return Self::default();
                }
            },
        };
        if !path.exists() {
            log::debug!("No config file found at {:?}", path);
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => {
                log::info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) => {
                log::warn!("Failed to load config file {:?}: {}; using defaults", path, e);
                Self::default()
            }
        }
    }

    /// Write the configuration, creating parent directories if needed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::new();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.editor.undo_history, 100);
        assert_eq!(config.editor.min_box_size, 1.0);
        assert!(config.autosave.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip() {
        let mut config = EngineConfig::new();
        config.log_level = LogLevel::Debug;
        config.editor.brush_size = 25.0;
        config.autosave.debounce_ms = 500;

        let json = config.to_json().unwrap();
        let parsed = EngineConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{"version": 1, "editor": {"brushSize": 4.0}}"#;
        let config = EngineConfig::from_json(json).unwrap();
        assert_eq!(config.editor.brush_size, 4.0);
        assert_eq!(config.editor.handle_hit_radius, DEFAULT_HANDLE_HIT_RADIUS);
        assert_eq!(config.autosave, AutoSaveSettings::default());
    }

    #[test]
    fn test_version_too_new() {
        let json = r#"{"version": 999}"#;
        assert!(matches!(
            EngineConfig::from_json(json),
            Err(ConfigError::VersionTooNew {
                file_version: 999,
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_values_refused() {
        let json = r#"{"editor": {"minZoom": 2.0, "maxZoom": 1.0}}"#;
        assert!(matches!(EngineConfig::from_json(json), Err(ConfigError::Invalid(_))));
        let json = r#"{"editor": {"undoHistory": 0}}"#;
        assert!(matches!(EngineConfig::from_json(json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_level_filter(), log::LevelFilter::Error);
        assert_eq!(LogLevel::Trace.to_level_filter(), log::LevelFilter::Trace);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = EngineConfig::new();
        config.editor.zoom_step = 1.5;
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_or_default_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert_eq!(EngineConfig::load_or_default(Some(&missing)), EngineConfig::default());

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        assert_eq!(EngineConfig::load_or_default(Some(&broken)), EngineConfig::default());
    }
}
