//! Deterministic collaborators driven by a known scene.
//!
//! A textured cube spins in front of a pinhole camera. [`SceneBootstrap`] and
//! [`SceneMatcher`] report ground-truth projections (with configurable noise,
//! dropout, outliers and blackouts) and [`DltPoseSolver`] recovers the pose
//! with a linear PnP inside a RANSAC loop.

use std::ops::Range;
use std::sync::Arc;

use image::{GrayImage, Luma};
use imageproc::drawing::draw_filled_circle_mut;
use kpt_core::{CameraModel, Descriptor, Descriptors, KpStatus, Point2f, Point3f, Pose, Region};
use kpt_model::{KeypointModel, PinholeProjector, PoseProjector};
use kpt_vote::enclosing_box;
use nalgebra::{DMatrix, Matrix3, Rotation3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::collaborators::{
    Frame, FrameMatcher, MatchReport, ModelBootstrap, ModelSeed, NewMatch, PoseSolution, PoseSolver,
    SlotOutcome,
};

/// Correspondences needed by the linear solver
const DLT_MIN_POINTS: usize = 6;

/// Textured cube moving in front of a fixed camera
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    points: Vec<Point3f>,
    normals: Vec<Vector3<f64>>,
    descriptors: Descriptors,
    camera: CameraModel,
    width: u32,
    height: u32,
    distance: f64,
    spin: f64,
    base: Rotation3<f64>,
}

impl SyntheticScene {
    /// Cube of side 2 with `grid x grid` points per face, seen by a 640x480 camera.
    ///
    /// One corner faces the camera so three faces stay visible while the cube
    /// spins about the optical axis.
    pub fn cube(grid: usize) -> Self {
        let grid = grid.max(2);
        let mut points = Vec::with_capacity(6 * grid * grid);
        let mut normals = Vec::with_capacity(6 * grid * grid);
        let step = 1.6 / (grid - 1) as f32;

        for axis in 0..3 {
            for sign in [1.0f32, -1.0] {
                let mut normal = Vector3::zeros();
                normal[axis] = sign as f64;
                for i in 0..grid {
                    for j in 0..grid {
                        let mut p = [0.0f32; 3];
                        p[axis] = sign;
                        p[(axis + 1) % 3] = -0.8 + step * i as f32;
                        p[(axis + 2) % 3] = -0.8 + step * j as f32;
                        points.push(Point3f::new(p[0], p[1], p[2]));
                        normals.push(normal);
                    }
                }
            }
        }

        let mut rng = StdRng::seed_from_u64(0x6b70_7473);
        let rows: Vec<Descriptor> = points.iter().map(|_| rng.gen()).collect();

        let diagonal = Vector3::new(1.0, 1.0, 1.0).normalize();
        let base = Rotation3::rotation_between(&diagonal, &-Vector3::z()).unwrap_or_else(Rotation3::identity);

        Self {
            points,
            normals,
            descriptors: Descriptors::from_rows(&rows),
            camera: CameraModel::new(500.0, 500.0, 320.0, 240.0),
            width: 640,
            height: 480,
            distance: 8.0,
            spin: 0.03,
            base,
        }
    }

    /// Rotation about the optical axis per frame, in radians
    pub fn with_spin(mut self, spin: f64) -> Self {
        self.spin = spin;
        self
    }

    pub fn with_distance(mut self, distance: f64) -> Self {
        self.distance = distance;
        self
    }

    pub fn points(&self) -> &[Point3f] {
        &self.points
    }

    pub fn descriptors(&self) -> &Descriptors {
        &self.descriptors
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Ground-truth pose of frame `index`
    pub fn pose_at(&self, index: u64) -> Pose {
        let t = index as f64;
        let spin = Rotation3::from_axis_angle(&Vector3::z_axis(), self.spin * t);
        let wobble = Rotation3::from_axis_angle(&Vector3::x_axis(), 0.15 * (0.05 * t).sin());
        Pose {
            rotation: (spin * wobble * self.base).into_inner(),
            translation: Vector3::new(0.4 * (0.04 * t).sin(), 0.25 * (0.03 * t).sin(), self.distance),
        }
    }

    pub fn project_at(&self, index: u64) -> Vec<Point2f> {
        PinholeProjector.project(&self.points, &self.pose_at(index), &self.camera)
    }

    /// Per point: its face is turned towards the camera
    pub fn visibility_at(&self, index: u64) -> Vec<bool> {
        let pose = self.pose_at(index);
        self.points
            .iter()
            .zip(&self.normals)
            .map(|(p, n)| (pose.rotation * n).dot(&pose.transform(p)) < 0.0)
            .collect()
    }

    /// Box around the visible points of frame `index`, padded by `pad` pixels
    pub fn region_at(&self, index: u64, pad: f32) -> Region {
        let visible: Vec<Point2f> = self
            .project_at(index)
            .into_iter()
            .zip(self.visibility_at(index))
            .filter_map(|(p, v)| v.then_some(p))
            .collect();
        match enclosing_box(&visible) {
            Some([tl, _, br, _]) => Region::from_corners(
                Point2f::new(tl.x - pad, tl.y - pad),
                Point2f::new(br.x + pad, br.y + pad),
            ),
            None => Region::default(),
        }
    }

    /// Dark frame with a bright blob at every visible point
    pub fn render(&self, index: u64) -> Frame {
        let mut img = GrayImage::from_pixel(self.width, self.height, Luma([30u8]));
        for (p, visible) in self.project_at(index).iter().zip(self.visibility_at(index)) {
            if visible {
                draw_filled_circle_mut(&mut img, (p.x.round() as i32, p.y.round() as i32), 2, Luma([220u8]));
            }
        }
        Frame::new(index, self.width, self.height, img.into_raw())
    }
}

/// Seeds a model with every scene point, activating those visible inside the region
#[derive(Debug, Clone)]
pub struct SceneBootstrap {
    scene: Arc<SyntheticScene>,
}

impl SceneBootstrap {
    pub fn new(scene: Arc<SyntheticScene>) -> Self {
        Self { scene }
    }
}

impl ModelBootstrap for SceneBootstrap {
    fn seed(&mut self, frame: &Frame, region: &Region) -> Option<ModelSeed> {
        let observations: Vec<(usize, Point2f)> = self
            .scene
            .project_at(frame.index)
            .into_iter()
            .zip(self.scene.visibility_at(frame.index))
            .enumerate()
            .filter(|(_, (p, visible))| *visible && region.contains(p))
            .map(|(m, (p, _))| (m, p))
            .collect();

        if observations.is_empty() {
            return None;
        }
        Some(ModelSeed {
            points: self.scene.points().to_vec(),
            descriptors: self.scene.descriptors().clone(),
            observations,
        })
    }
}

/// Ground-truth matcher with seeded noise, dropout and outliers
#[derive(Debug, Clone)]
pub struct SceneMatcher {
    scene: Arc<SyntheticScene>,
    rng: StdRng,
    noise: f32,
    dropout: f64,
    outliers: f64,
    recovery: f64,
    blackouts: Vec<Range<u64>>,
}

impl SceneMatcher {
    pub fn new(scene: Arc<SyntheticScene>, seed: u64) -> Self {
        Self {
            scene,
            rng: StdRng::seed_from_u64(seed),
            noise: 0.0,
            dropout: 0.0,
            outliers: 0.0,
            recovery: 0.5,
            blackouts: Vec::new(),
        }
    }

    /// Uniform jitter amplitude in pixels
    pub fn with_noise(mut self, noise: f32) -> Self {
        self.noise = noise.max(0.0);
        self
    }

    /// Probability that a tracked slot fails
    pub fn with_dropout(mut self, p: f64) -> Self {
        self.dropout = p.clamp(0.0, 1.0);
        self
    }

    /// Probability that a tracked slot lands far from its true position
    pub fn with_outliers(mut self, p: f64) -> Self {
        self.outliers = p.clamp(0.0, 1.0);
        self
    }

    /// Probability that a visible lost point is matched again
    pub fn with_recovery(mut self, p: f64) -> Self {
        self.recovery = p.clamp(0.0, 1.0);
        self
    }

    /// Frames in `range` yield no observations at all
    pub fn with_blackout(mut self, range: Range<u64>) -> Self {
        self.blackouts.push(range);
        self
    }

    fn jitter(&mut self, p: Point2f) -> Point2f {
        if self.noise > 0.0 {
            let n = self.noise;
            Point2f::new(p.x + self.rng.gen_range(-n..n), p.y + self.rng.gen_range(-n..n))
        } else {
            p
        }
    }

    fn displace(&mut self, p: Point2f) -> Point2f {
        let angle = self.rng.gen_range(0.0..std::f32::consts::TAU);
        let radius: f32 = self.rng.gen_range(25.0..60.0);
        Point2f::new(p.x + radius * angle.cos(), p.y + radius * angle.sin())
    }
}

impl FrameMatcher for SceneMatcher {
    fn match_frame(&mut self, frame: &Frame, model: &KeypointModel) -> MatchReport {
        let mut report = MatchReport::default();
        let blind = self.blackouts.iter().any(|r| r.contains(&frame.index));
        let truth = self.scene.project_at(frame.index);
        let visible = self.scene.visibility_at(frame.index);

        for (slot, _, m) in model.active().iter() {
            let seen = !blind && visible.get(m).copied().unwrap_or(false);
            let outcome = if !seen || self.rng.gen_bool(self.dropout) {
                SlotOutcome::Failed
            } else if self.rng.gen_bool(self.outliers) {
                SlotOutcome::Tracked(self.displace(truth[m]))
            } else {
                SlotOutcome::Tracked(self.jitter(truth[m]))
            };
            report.slots.push((slot, outcome));
        }

        if !blind {
            for (m, status) in model.statuses().iter().enumerate() {
                if *status == KpStatus::Lost
                    && visible.get(m).copied().unwrap_or(false)
                    && self.rng.gen_bool(self.recovery)
                {
                    let observation = self.jitter(truth[m]);
                    report.new_matches.push(NewMatch { model_index: m, observation });
                }
            }
        }
        report
    }
}

/// Linear (DLT) PnP inside a RANSAC loop.
///
/// Works on undistorted pinhole cameras; distortion coefficients are ignored.
#[derive(Debug, Clone, Copy)]
pub struct DltPoseSolver {
    /// Reprojection error (pixels) below which a correspondence is an inlier
    pub threshold: f64,
    pub seed: u64,
}

impl Default for DltPoseSolver {
    fn default() -> Self {
        Self { threshold: 3.0, seed: 7 }
    }
}

impl DltPoseSolver {
    /// Pose from all given correspondences, `None` when they are degenerate
    pub fn dlt(object: &[Point3f], normalized: &[(f64, f64)]) -> Option<Pose> {
        let n = object.len();
        if n < DLT_MIN_POINTS || normalized.len() != n {
            return None;
        }

        let mut a = DMatrix::<f64>::zeros(2 * n, 12);
        for (i, (pw, &(u, v))) in object.iter().zip(normalized).enumerate() {
            let (x, y, z) = (pw.x as f64, pw.y as f64, pw.z as f64);
            let (r0, r1) = (2 * i, 2 * i + 1);

            a[(r0, 0)] = x;
            a[(r0, 1)] = y;
            a[(r0, 2)] = z;
            a[(r0, 3)] = 1.0;
            a[(r0, 8)] = -u * x;
            a[(r0, 9)] = -u * y;
            a[(r0, 10)] = -u * z;
            a[(r0, 11)] = -u;

            a[(r1, 4)] = x;
            a[(r1, 5)] = y;
            a[(r1, 6)] = z;
            a[(r1, 7)] = 1.0;
            a[(r1, 8)] = -v * x;
            a[(r1, 9)] = -v * y;
            a[(r1, 10)] = -v * z;
            a[(r1, 11)] = -v;
        }

        // Null vector of A: eigenvector of AᵀA with the smallest eigenvalue
        let eig = (a.transpose() * &a).symmetric_eigen();
        let (min_idx, _) = eig
            .eigenvalues
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))?;
        let p = eig.eigenvectors.column(min_idx);

        let mut m = Matrix3::new(p[0], p[1], p[2], p[4], p[5], p[6], p[8], p[9], p[10]);
        let mut t = Vector3::new(p[3], p[7], p[11]);

        // P is only known up to sign; the rotation block must keep det > 0
        if m.determinant() < 0.0 {
            m = -m;
            t = -t;
        }
        let scale = (m.row(0).norm() + m.row(1).norm() + m.row(2).norm()) / 3.0;
        if !(scale > f64::EPSILON) {
            return None;
        }
        m /= scale;
        t /= scale;

        let svd = m.svd(true, true);
        let (u, v_t) = (svd.u?, svd.v_t?);
        let mut rotation = u * v_t;
        if rotation.determinant() < 0.0 {
            let mut u = u;
            u.column_mut(2).neg_mut();
            rotation = u * v_t;
        }

        Some(Pose {
            rotation,
            translation: t,
        })
    }

    fn inliers(&self, pose: &Pose, object: &[Point3f], image: &[Point2f], camera: &CameraModel, out: &mut Vec<usize>) {
        out.clear();
        for (i, (pw, pi)) in object.iter().zip(image).enumerate() {
            if pose.transform(pw).z <= 0.0 {
                continue;
            }
            let proj = PinholeProjector::project_point(pw, pose, camera);
            if ((proj - pi).norm() as f64) < self.threshold {
                out.push(i);
            }
        }
    }
}

impl PoseSolver for DltPoseSolver {
    fn solve(
        &self,
        object_points: &[Point3f],
        image_points: &[Point2f],
        camera: &CameraModel,
        iterations: usize,
    ) -> Option<PoseSolution> {
        let n = object_points.len();
        if n < DLT_MIN_POINTS || image_points.len() != n {
            return None;
        }

        let normalized: Vec<(f64, f64)> = image_points
            .iter()
            .map(|p| ((p.x as f64 - camera.cx) / camera.fx, (p.y as f64 - camera.cy) / camera.fy))
            .collect();

        let mut rng = StdRng::seed_from_u64(self.seed ^ n as u64);
        let mut best: Option<(Pose, Vec<usize>)> = None;
        let mut inliers = Vec::with_capacity(n);
        let mut sample_obj = Vec::with_capacity(DLT_MIN_POINTS);
        let mut sample_img = Vec::with_capacity(DLT_MIN_POINTS);

        for _ in 0..iterations.max(1) {
            sample_obj.clear();
            sample_img.clear();
            for i in rand::seq::index::sample(&mut rng, n, DLT_MIN_POINTS) {
                sample_obj.push(object_points[i]);
                sample_img.push(normalized[i]);
            }
            let Some(pose) = Self::dlt(&sample_obj, &sample_img) else {
                continue;
            };

            self.inliers(&pose, object_points, image_points, camera, &mut inliers);
            if best.as_ref().map_or(true, |(_, b)| inliers.len() > b.len()) {
                best = Some((pose, inliers.clone()));
                if inliers.len() == n {
                    break;
                }
            }
        }

        let (mut pose, mut support) = best?;
        if support.len() < DLT_MIN_POINTS {
            return None;
        }

        // Refit on the consensus set
        let obj: Vec<Point3f> = support.iter().map(|&i| object_points[i]).collect();
        let img: Vec<(f64, f64)> = support.iter().map(|&i| normalized[i]).collect();
        if let Some(refined) = Self::dlt(&obj, &img) {
            self.inliers(&refined, object_points, image_points, camera, &mut inliers);
            if inliers.len() >= support.len() {
                pose = refined;
                support = inliers;
            }
        }

        Some(PoseSolution {
            pose,
            inliers: support.len(),
        })
    }
}
