use kpt_core::{CameraModel, Distortion, TrackerParams};

use crate::collaborators::{FrameMatcher, ModelBootstrap, PoseSolver};
use crate::config::TrackerConfig;
use crate::session::TrackerSession;
use crate::TrackResult;

/// Builder for creating a `TrackerSession`
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    params: TrackerParams,
    camera: CameraModel,
    width: u32,
    height: u32,
}

impl SessionBuilder {
    /// Create a new builder with default settings
    pub fn new(camera: CameraModel, width: u32, height: u32) -> Self {
        Self {
            params: TrackerParams::default(),
            camera,
            width,
            height,
        }
    }

    /// Set the pixel margin where observations are discarded
    pub fn filter_border(mut self, border: u32) -> Self {
        self.params.filter_border = border;
        self
    }

    /// Enable or disable per-frame vote refresh
    pub fn update_votes(mut self, enable: bool) -> Self {
        self.params.update_votes = enable;
        self
    }

    /// Set the vote clustering radius in pixels
    pub fn eps(mut self, eps: f32) -> Self {
        self.params.eps = eps;
        self
    }

    /// Set the neighbour count that makes a vote a cluster core
    pub fn min_points(mut self, min_points: usize) -> Self {
        self.params.min_points = min_points;
        self
    }

    /// Set the pose solver iteration budget
    pub fn ransac_iterations(mut self, iterations: usize) -> Self {
        self.params.ransac_iterations = iterations;
        self
    }

    /// Set the active set size below which tracking is lost
    pub fn min_active_points(mut self, n: usize) -> Self {
        self.params.min_active_points = n;
        self
    }

    /// Set the tolerated streak of pose solver failures
    pub fn max_solver_failures(mut self, n: usize) -> Self {
        self.params.max_solver_failures = n;
        self
    }

    /// Set the number of threads for parallel processing
    pub fn threads(mut self, n_threads: usize) -> Self {
        self.params.n_threads = n_threads;
        self
    }

    pub fn camera(mut self, camera: CameraModel) -> Self {
        self.camera = camera;
        self
    }

    pub fn distortion(mut self, distortion: Distortion) -> Self {
        self.camera.distortion = Some(distortion);
        self
    }

    /// Apply the steady preset
    pub fn preset_steady(mut self) -> Self {
        self.params = TrackerConfig::steady_preset(self.camera, self.width, self.height).params;
        self
    }

    /// Apply the fast motion preset
    pub fn preset_fast_motion(mut self) -> Self {
        self.params = TrackerConfig::fast_motion_preset(self.camera, self.width, self.height).params;
        self
    }

    /// Apply the cluttered preset
    pub fn preset_cluttered(mut self) -> Self {
        self.params = TrackerConfig::cluttered_preset(self.camera, self.width, self.height).params;
        self
    }

    /// Validate the configuration and build the session
    pub fn build<M, S, B>(self, matcher: M, solver: S, bootstrap: B) -> TrackResult<TrackerSession<M, S, B>>
    where
        M: FrameMatcher,
        S: PoseSolver,
        B: ModelBootstrap,
    {
        let config = self.to_config();
        config.validate()?;
        Ok(TrackerSession::new(config.params, config.camera, matcher, solver, bootstrap))
    }

    /// Generate a summary of the builder's configuration
    pub fn summary(&self) -> String {
        self.clone().to_config().summary()
    }

    /// Create a builder from an existing `TrackerConfig`
    pub fn from_config(config: TrackerConfig) -> Self {
        Self {
            params: config.params,
            camera: config.camera,
            width: config.width,
            height: config.height,
        }
    }

    /// Convert the builder into a `TrackerConfig`
    pub fn to_config(self) -> TrackerConfig {
        TrackerConfig {
            params: self.params,
            camera: self.camera,
            width: self.width,
            height: self.height,
            name: None,
            description: None,
            version: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}
