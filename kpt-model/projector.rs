use kpt_core::{CameraModel, Distortion, Point2f, Point3f, Pose};
use rayon::prelude::*;

/// Depth clamp that keeps points on the camera plane finite
pub const PROJECTION_EPS: f64 = 1.0e-9;

/// Batches at least this large are projected on the rayon pool
const PARALLEL_THRESHOLD: usize = 512;

/// Maps model points into image coordinates through a pose and camera model.
///
/// Implementations return exactly one image point per input, in input order.
pub trait PoseProjector {
    fn project(&self, points: &[Point3f], pose: &Pose, camera: &CameraModel) -> Vec<Point2f>;
}

impl<P: PoseProjector + ?Sized> PoseProjector for &P {
    fn project(&self, points: &[Point3f], pose: &Pose, camera: &CameraModel) -> Vec<Point2f> {
        (**self).project(points, pose, camera)
    }
}

/// Pinhole projection with optional Brown-Conrady distortion
#[derive(Debug, Clone, Copy, Default)]
pub struct PinholeProjector;

impl PinholeProjector {
    pub fn project_point(p: &Point3f, pose: &Pose, camera: &CameraModel) -> Point2f {
        let pc = pose.transform(p);
        let z = if pc.z.abs() < PROJECTION_EPS {
            PROJECTION_EPS.copysign(pc.z)
        } else {
            pc.z
        };
        let (x, y) = (pc.x / z, pc.y / z);
        let (x, y) = match &camera.distortion {
            Some(d) if !d.is_zero() => distort(x, y, d),
            _ => (x, y),
        };
        Point2f::new(
            (camera.fx * x + camera.cx) as f32,
            (camera.fy * y + camera.cy) as f32,
        )
    }
}

impl PoseProjector for PinholeProjector {
    fn project(&self, points: &[Point3f], pose: &Pose, camera: &CameraModel) -> Vec<Point2f> {
        if points.len() >= PARALLEL_THRESHOLD {
            points
                .par_iter()
                .map(|p| Self::project_point(p, pose, camera))
                .collect()
        } else {
            points
                .iter()
                .map(|p| Self::project_point(p, pose, camera))
                .collect()
        }
    }
}

/// Apply radial (k1, k2, k3) and tangential (p1, p2) distortion to normalized coordinates
fn distort(x: f64, y: f64, d: &Distortion) -> (f64, f64) {
    let r2 = x * x + y * y;
    let radial = 1.0 + d.k1 * r2 + d.k2 * r2 * r2 + d.k3 * r2 * r2 * r2;
    let xd = x * radial + 2.0 * d.p1 * x * y + d.p2 * (r2 + 2.0 * x * x);
    let yd = y * radial + d.p1 * (r2 + 2.0 * y * y) + 2.0 * d.p2 * x * y;
    (xd, yd)
}
