//! Configuration management for warpcue

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::editor::DEFAULT_HIT_RADIUS;
use crate::history::DEFAULT_HISTORY_LIMIT;
use crate::session::SessionSettings;
use crate::warp::WarpSettings;

/// Projector output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// File or FIFO receiving raw RGB24 frames
    #[serde(default)]
    pub sink: Option<PathBuf>,
    /// Warp the test pattern while armed, for lining up the mesh
    #[serde(default)]
    pub calibration_pattern: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            sink: None,
            calibration_pattern: false,
        }
    }
}

impl OutputConfig {
    /// Raise zero width, height or fps to 1
    fn sanitize(&mut self) {
        if self.width == 0 || self.height == 0 || self.fps == 0 {
            tracing::warn!(
                "Output {}x{} @ {} fps is invalid, using at least 1 for each",
                self.width,
                self.height,
                self.fps
            );
        }
        self.width = self.width.max(1);
        self.height = self.height.max(1);
        self.fps = self.fps.max(1);
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

/// Mesh defaults used when nothing is stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub default_rows: usize,
    pub default_cols: usize,
    /// Maximum number of history snapshots
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            default_rows: 4,
            default_cols: 4,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Pointer editing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorConfig {
    /// Handle radius plus hit slop, in viewport pixels
    pub hit_radius: f64,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            hit_radius: DEFAULT_HIT_RADIUS,
        }
    }
}

/// Where the mesh and playlist blobs live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub dir: PathBuf,
    /// Write after every committed edit
    #[serde(default = "default_autosave")]
    pub autosave: bool,
}

fn default_autosave() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            autosave: true,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub mesh: MeshConfig,

    #[serde(default)]
    pub editor: EditorConfig,

    #[serde(default)]
    pub warp: WarpSettings,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let mut config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            config.output.sanitize();
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            default_rows: self.mesh.default_rows,
            default_cols: self.mesh.default_cols,
            history_limit: self.mesh.history_limit,
            hit_radius: self.editor.hit_radius,
            autosave: self.storage.autosave,
        }
    }
}
