use kpt_core::{CameraModel, Descriptors, KpStatus, Point2f, Point3f, Pose};
use log::{debug, error};
use nalgebra::Vector3;

use crate::active_set::ActiveSet;
use crate::consistency::{self, Inconsistency};
use crate::error::{ModelError, ModelResult};
use crate::projector::PoseProjector;

/// Persistent 3D keypoint model of the tracked object.
///
/// Model indices are stable for the lifetime of the model: points are never
/// reordered, reused or dropped. Per frame only the statuses and the
/// [`ActiveSet`] change.
#[derive(Debug, Clone)]
pub struct KeypointModel {
    points: Vec<Point3f>,
    descriptors: Descriptors,
    status: Vec<KpStatus>,
    rel_distances: Vec<Vector3<f32>>,
    centroid: Point3f,
    active: ActiveSet,
    pose: Pose,
    custom_pose: Pose,
    seen: Vec<bool>,
}

impl KeypointModel {
    /// Build a model from bootstrap points and one descriptor row per point.
    ///
    /// Inputs are copied. Every point starts `Lost`, the active set is empty and
    /// both poses are zero.
    pub fn init(points: &[Point3f], descriptors: &Descriptors) -> ModelResult<Self> {
        if points.is_empty() || points.len() != descriptors.rows() {
            return Err(ModelError::InvalidInput {
                points: points.len(),
                descriptor_rows: descriptors.rows(),
            });
        }

        let n = points.len();
        let sum = points
            .iter()
            .fold(Vector3::<f32>::zeros(), |acc, p| acc + p.coords);
        let centroid = Point3f::from(sum / n as f32);
        let rel_distances = points.iter().map(|p| centroid - p).collect();

        // Typical active subsets are about a tenth of the model
        let reserved = (n / 10).max(1);

        debug!("keypoint model initialized with {} points, {} active slots reserved", n, reserved);

        Ok(Self {
            points: points.to_vec(),
            descriptors: descriptors.clone(),
            status: vec![KpStatus::Lost; n],
            rel_distances,
            centroid,
            active: ActiveSet::with_capacity(reserved),
            pose: Pose::zeros(),
            custom_pose: Pose::zeros(),
            seen: Vec::with_capacity(n),
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false for an initialized model
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point3f] {
        &self.points
    }

    pub fn descriptors(&self) -> &Descriptors {
        &self.descriptors
    }

    pub fn statuses(&self) -> &[KpStatus] {
        &self.status
    }

    pub fn status(&self, index: usize) -> Option<KpStatus> {
        self.status.get(index).copied()
    }

    /// Displacement from each model point to the centroid
    pub fn rel_distances(&self) -> &[Vector3<f32>] {
        &self.rel_distances
    }

    pub fn centroid(&self) -> Point3f {
        self.centroid
    }

    pub fn active(&self) -> &ActiveSet {
        &self.active
    }

    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    pub fn set_pose(&mut self, pose: Pose) {
        self.pose = pose;
    }

    /// Pose produced by the secondary estimation path
    pub fn custom_pose(&self) -> &Pose {
        &self.custom_pose
    }

    pub fn set_custom_pose(&mut self, pose: Pose) {
        self.custom_pose = pose;
    }

    /// Append an active slot for a model point that is currently `Lost`.
    ///
    /// Returns the new slot index.
    pub fn activate(&mut self, index: usize, observation: Point2f, status: KpStatus) -> ModelResult<usize> {
        if !status.is_active() {
            return Err(ModelError::InactiveStatus { status });
        }
        let len = self.points.len();
        let current = *self
            .status
            .get(index)
            .ok_or(ModelError::IndexOutOfRange { index, len })?;
        if current.is_active() {
            return Err(ModelError::AlreadyActive { index });
        }

        self.status[index] = status;
        Ok(self.active.push(observation, index))
    }

    /// Move the observation of an active slot
    pub fn update_observation(&mut self, slot: usize, observation: Point2f) -> ModelResult<()> {
        self.active.set_point(slot, observation)
    }

    /// Switch an active slot between `Match` and `Track`
    pub fn set_slot_status(&mut self, slot: usize, status: KpStatus) -> ModelResult<()> {
        if !status.is_active() {
            return Err(ModelError::InactiveStatus { status });
        }
        let index = self.active.model_index(slot).ok_or(ModelError::OutOfRange {
            slot,
            len: self.active.len(),
        })?;
        self.status[index] = status;
        Ok(())
    }

    /// Evict a batch of active slots.
    ///
    /// `slots` are active-slot indices as they stand before the call. They are
    /// validated up front, so a duplicate or out-of-range id leaves the model
    /// untouched. Evicted model points become `Lost`.
    pub fn remove_invalid_points(&mut self, slots: &[usize]) -> ModelResult<()> {
        self.active.validate_removal(slots)?;

        for &slot in slots {
            let index = self.active.to_model()[slot];
            self.status[index] = KpStatus::Lost;
        }
        self.active.compact(slots);

        if !slots.is_empty() {
            debug!("evicted {} active slots, {} remain", slots.len(), self.active.len());
        }

        self.verify()
    }

    /// Drop the whole active set, every point becomes `Lost`
    pub fn reset_tracking(&mut self) {
        self.status.fill(KpStatus::Lost);
        self.active.clear();
    }

    /// True when every active slot refers to a distinct `Match`/`Track` point
    pub fn is_consistent(&self) -> bool {
        self.check_consistency().is_ok()
    }

    pub fn check_consistency(&self) -> Result<(), Inconsistency> {
        consistency::check(&self.status, &self.active, &mut Vec::new())
    }

    /// Consistency check on the reusable scratch buffer, escalated as an error
    pub fn verify(&mut self) -> ModelResult<()> {
        consistency::check(&self.status, &self.active, &mut self.seen).map_err(|reason| {
            error!("keypoint model inconsistent: {}", reason);
            ModelError::InvariantViolation(reason)
        })
    }

    /// Model points of the active slots, in slot order, written into `out`
    pub fn gather_correspondences(&self, out: &mut Vec<Point3f>) {
        out.clear();
        out.extend(self.active.to_model().iter().map(|&m| self.points[m]));
    }

    /// Project every active point and its centroid vote endpoint.
    ///
    /// Pair `i` belongs to active slot `i`: the projected model position and the
    /// projection of `position + rel_distance`.
    pub fn project_vectors<P>(&self, projector: &P, camera: &CameraModel, pose: &Pose) -> ModelResult<Vec<(Point2f, Point2f)>>
    where
        P: PoseProjector + ?Sized,
    {
        let k = self.active.len();
        let mut model_pts = Vec::with_capacity(k);
        let mut vote_pts = Vec::with_capacity(k);
        for &m in self.active.to_model() {
            model_pts.push(self.points[m]);
            vote_pts.push(self.points[m] + self.rel_distances[m]);
        }

        let model_2d = projector.project(&model_pts, pose, camera);
        let vote_2d = projector.project(&vote_pts, pose, camera);
        for projected in [&model_2d, &vote_2d] {
            if projected.len() != k {
                return Err(ModelError::ProjectionMismatch {
                    expected: k,
                    actual: projected.len(),
                });
            }
        }

        Ok(model_2d.into_iter().zip(vote_2d).collect())
    }

    /// Corners of the axis-aligned box enclosing the model
    pub fn bounding_corners(&self) -> [Point3f; 8] {
        let mut min = self.points[0].coords;
        let mut max = min;
        for p in &self.points[1..] {
            min = min.inf(&p.coords);
            max = max.sup(&p.coords);
        }
        [
            Point3f::new(min.x, min.y, min.z),
            Point3f::new(max.x, min.y, min.z),
            Point3f::new(max.x, max.y, min.z),
            Point3f::new(min.x, max.y, min.z),
            Point3f::new(min.x, min.y, max.z),
            Point3f::new(max.x, min.y, max.z),
            Point3f::new(max.x, max.y, max.z),
            Point3f::new(min.x, max.y, max.z),
        ]
    }
}
