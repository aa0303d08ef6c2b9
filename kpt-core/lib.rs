use nalgebra::{Matrix3, Point2, Point3, Rotation3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Row-major 8-bit grayscale image
pub type Image = Vec<u8>;

/// Image-space observation (pixels)
pub type Point2f = Point2<f32>;

/// Object-space model point
pub type Point3f = Point3<f32>;

/// 256-bit binary descriptor = 32 bytes
pub type Descriptor = [u8; 32];

/// Tracking status of a single model point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum KpStatus {
    /// Not part of the active set
    #[default]
    Lost,
    /// Matched by descriptor this frame
    Match,
    /// Carried over from the previous frame by the tracker
    Track,
}

impl KpStatus {
    /// `Match` and `Track` points are the only ones allowed in the active set
    pub fn is_active(self) -> bool {
        matches!(self, KpStatus::Match | KpStatus::Track)
    }
}

/// Row-major descriptor matrix, one row per model point
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Descriptors {
    data: Vec<u8>,
    cols: usize,
}

impl Descriptors {
    /// Wrap raw bytes. Returns `None` unless `data` splits evenly into rows of `cols` bytes.
    pub fn from_raw(data: Vec<u8>, cols: usize) -> Option<Self> {
        if cols == 0 || data.len() % cols != 0 {
            return None;
        }
        Some(Self { data, cols })
    }

    /// Stack fixed-size binary descriptors into a matrix
    pub fn from_rows(rows: &[Descriptor]) -> Self {
        let mut data = Vec::with_capacity(rows.len() * 32);
        for row in rows {
            data.extend_from_slice(row);
        }
        Self { data, cols: 32 }
    }

    pub fn rows(&self) -> usize {
        if self.cols == 0 {
            0
        } else {
            self.data.len() / self.cols
        }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(self.cols)?;
        self.data.get(start..start + self.cols)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Rigid transform from model space into camera space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::zeros()
    }
}

impl Pose {
    /// All-zero pose, the state of a freshly initialized model
    pub fn zeros() -> Self {
        Self {
            rotation: Matrix3::zeros(),
            translation: Vector3::zeros(),
        }
    }

    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build a pose from an axis-angle (Rodrigues) vector
    pub fn from_rotation_vector(rvec: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: Rotation3::from_scaled_axis(rvec).into_inner(),
            translation,
        }
    }

    /// Axis-angle (Rodrigues) form of the rotation
    pub fn rotation_vector(&self) -> Vector3<f64> {
        if self.rotation == Matrix3::zeros() {
            return Vector3::zeros();
        }
        Rotation3::from_matrix_unchecked(self.rotation).scaled_axis()
    }

    pub fn is_zero(&self) -> bool {
        self.rotation == Matrix3::zeros() && self.translation == Vector3::zeros()
    }

    /// Map a model point into camera coordinates
    pub fn transform(&self, p: &Point3f) -> Vector3<f64> {
        self.rotation * Vector3::new(p.x as f64, p.y as f64, p.z as f64) + self.translation
    }
}

/// Brown-Conrady lens distortion coefficients
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub fn is_zero(&self) -> bool {
        self.k1 == 0.0 && self.k2 == 0.0 && self.p1 == 0.0 && self.p2 == 0.0 && self.k3 == 0.0
    }
}

/// Pinhole intrinsics with optional distortion, constant for a session
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub distortion: Option<Distortion>,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            distortion: None,
        }
    }

    pub fn with_distortion(mut self, distortion: Distortion) -> Self {
        self.distortion = Some(distortion);
        self
    }

    /// Read fx, fy, cx, cy out of a 3x3 intrinsic matrix
    pub fn from_matrix(k: &Matrix3<f64>) -> Self {
        Self::new(k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)])
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx,
            0.0, self.fy, self.cy,
            0.0, 0.0, 1.0,
        )
    }
}

/// Axis-aligned image region used to seed a tracking session
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Region {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Region spanned by two opposite corners given in any order
    pub fn from_corners(a: Point2f, b: Point2f) -> Self {
        let (x0, x1) = if a.x <= b.x { (a.x, b.x) } else { (b.x, a.x) };
        let (y0, y1) = if a.y <= b.y { (a.y, b.y) } else { (b.y, a.y) };
        Self::new(x0, y0, x1 - x0, y1 - y0)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    pub fn center(&self) -> Point2f {
        Point2f::new(self.x + self.width * 0.5, self.y + self.height * 0.5)
    }

    /// Top-left, top-right, bottom-right, bottom-left
    pub fn corners(&self) -> [Point2f; 4] {
        let (x1, y1) = (self.x + self.width, self.y + self.height);
        [
            Point2f::new(self.x, self.y),
            Point2f::new(x1, self.y),
            Point2f::new(x1, y1),
            Point2f::new(self.x, y1),
        ]
    }

    pub fn contains(&self, p: &Point2f) -> bool {
        p.x >= self.x && p.y >= self.y && p.x <= self.x + self.width && p.y <= self.y + self.height
    }
}

/// Tuning knobs for a tracking session
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrackerParams {
    /// Pixel margin along the frame edges where observations are discarded
    pub filter_border: u32,
    /// Refresh centroid votes from the current pose on every solved frame
    pub update_votes: bool,
    /// Neighbourhood radius (pixels) of the vote clustering
    pub eps: f32,
    /// Neighbours required for a vote to seed a cluster
    pub min_points: usize,
    /// Iteration budget handed to the pose solver
    pub ransac_iterations: usize,
    /// Active set size below which tracking is declared lost
    pub min_active_points: usize,
    /// Consecutive solver failures tolerated before tracking is declared lost
    pub max_solver_failures: usize,
    pub n_threads: usize,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            filter_border: 10,
            update_votes: true,
            eps: 8.0,
            min_points: 4,
            ransac_iterations: 100,
            min_active_points: 6,
            max_solver_failures: 5,
            n_threads: num_cpus::get().max(1),
        }
    }
}

/// Initialize Rayon thread pool with the specified number of threads
pub fn init_thread_pool(n_threads: usize) -> Result<(), rayon::ThreadPoolBuildError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .build_global()
}
