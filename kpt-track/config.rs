use kpt_core::{CameraModel, TrackerParams};
use thiserror::Error;

use crate::builder::SessionBuilder;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use std::path::Path;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid frame size: {width}x{height}")]
    InvalidFrameSize { width: u32, height: u32 },
    #[error("Invalid clustering radius: {0} (must be positive)")]
    InvalidEps(f32),
    #[error("Invalid cluster density: min_points must be at least 1")]
    InvalidMinPoints,
    #[error("Invalid solver budget: ransac_iterations must be at least 1")]
    InvalidRansacIterations,
    #[error("Invalid active set floor: {0} (a pose needs at least 4 correspondences)")]
    TooFewActivePoints(usize),
    #[error("Invalid focal length: fx={fx}, fy={fy}")]
    InvalidFocalLength { fx: f64, fy: f64 },
    #[error("Invalid thread count: 0")]
    InvalidThreadCount,
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serde")]
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "serde")]
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[cfg(feature = "serde")]
    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete session configuration: tuning, camera and frame geometry
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrackerConfig {
    /// Metadata
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub name: Option<String>,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub description: Option<String>,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub version: Option<String>,
    /// Frame dimensions
    pub width: u32,
    pub height: u32,
    pub params: TrackerParams,
    pub camera: CameraModel,
}

impl TrackerConfig {
    /// Default tuning for the given camera and frame size
    pub fn new(camera: CameraModel, width: u32, height: u32) -> Self {
        Self {
            params: TrackerParams::default(),
            camera,
            width,
            height,
            name: None,
            description: None,
            version: None,
        }
    }

    /// Slow, smooth motion: votes fixed at first sight, tight clusters
    pub fn steady_preset(camera: CameraModel, width: u32, height: u32) -> Self {
        Self {
            params: TrackerParams {
                filter_border: 10,
                update_votes: false,
                eps: 6.0,
                min_points: 5,
                ransac_iterations: 50,
                min_active_points: 8,
                max_solver_failures: 8,
                n_threads: num_cpus::get(),
            },
            camera,
            width,
            height,
            name: Some("Steady".to_string()),
            description: Some("Slow camera motion with a well textured object".to_string()),
            version: Some("1.0".to_string()),
        }
    }

    /// Fast motion: wide border, loose clusters, quick loss detection
    pub fn fast_motion_preset(camera: CameraModel, width: u32, height: u32) -> Self {
        Self {
            params: TrackerParams {
                filter_border: 16,
                update_votes: true,
                eps: 14.0,
                min_points: 3,
                ransac_iterations: 200,
                min_active_points: 6,
                max_solver_failures: 3,
                n_threads: num_cpus::get(),
            },
            camera,
            width,
            height,
            name: Some("Fast Motion".to_string()),
            description: Some("Large inter-frame displacement and motion blur".to_string()),
            version: Some("1.0".to_string()),
        }
    }

    /// Cluttered background: many outlier matches, dense consensus required
    pub fn cluttered_preset(camera: CameraModel, width: u32, height: u32) -> Self {
        Self {
            params: TrackerParams {
                filter_border: 10,
                update_votes: true,
                eps: 5.0,
                min_points: 8,
                ransac_iterations: 300,
                min_active_points: 12,
                max_solver_failures: 5,
                n_threads: num_cpus::get(),
            },
            camera,
            width,
            height,
            name: Some("Cluttered".to_string()),
            description: Some("Textured background producing frequent false matches".to_string()),
            version: Some("1.0".to_string()),
        }
    }

    /// Add metadata to configuration
    pub fn with_metadata(mut self, name: &str, description: &str) -> Self {
        self.name = Some(name.to_string());
        self.description = Some(description.to_string());
        self.version = Some("1.0".to_string());
        self
    }

    /// Convert to SessionBuilder for further customization
    pub fn to_builder(self) -> SessionBuilder {
        SessionBuilder::from_config(self)
    }

    /// Generate human-readable summary
    pub fn summary(&self) -> String {
        let p = &self.params;
        format!(
            "TrackerConfig: {}x{}, f=({:.1}, {:.1}), border={}, eps={:.1}, min_points={}, ransac={}, min_active={}, max_failures={}, update_votes={}, threads={}",
            self.width, self.height, self.camera.fx, self.camera.fy,
            p.filter_border, p.eps, p.min_points, p.ransac_iterations,
            p.min_active_points, p.max_solver_failures, p.update_votes, p.n_threads
        )
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> ConfigResult<()> {
        let p = &self.params;
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidFrameSize { width: self.width, height: self.height });
        }
        if !(p.eps > 0.0) {
            return Err(ConfigError::InvalidEps(p.eps));
        }
        if p.min_points == 0 {
            return Err(ConfigError::InvalidMinPoints);
        }
        if p.ransac_iterations == 0 {
            return Err(ConfigError::InvalidRansacIterations);
        }
        if p.min_active_points < 4 {
            return Err(ConfigError::TooFewActivePoints(p.min_active_points));
        }
        if !(self.camera.fx > 0.0 && self.camera.fy > 0.0) {
            return Err(ConfigError::InvalidFocalLength { fx: self.camera.fx, fy: self.camera.fy });
        }
        if p.n_threads == 0 {
            return Err(ConfigError::InvalidThreadCount);
        }
        Ok(())
    }

    /// Save configuration to JSON file
    #[cfg(feature = "serde")]
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Load configuration from JSON file
    #[cfg(feature = "serde")]
    pub fn load_json<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Save configuration to TOML file
    #[cfg(feature = "serde")]
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Load configuration from TOML file
    #[cfg(feature = "serde")]
    pub fn load_toml<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load from a `.json` or `.toml` file, picked by extension
    #[cfg(feature = "serde")]
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        match ConfigFormat::of(path.as_ref())? {
            ConfigFormat::Json => Self::load_json(path),
            ConfigFormat::Toml => Self::load_toml(path),
        }
    }

    /// Save to a `.json` or `.toml` file, picked by extension
    #[cfg(feature = "serde")]
    pub fn save<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        match ConfigFormat::of(path.as_ref())? {
            ConfigFormat::Json => self.save_json(path),
            ConfigFormat::Toml => self.save_toml(path),
        }
    }

    /// Serialize to JSON string
    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> ConfigResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON string
    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML string
    #[cfg(feature = "serde")]
    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Deserialize from TOML string
    #[cfg(feature = "serde")]
    pub fn from_toml(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(feature = "serde")]
enum ConfigFormat {
    Json,
    Toml,
}

#[cfg(feature = "serde")]
impl ConfigFormat {
    fn of(path: &Path) -> ConfigResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Ok(Self::Json),
            "toml" => Ok(Self::Toml),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }
}
