use kpt_core::{CameraModel, Descriptors, Image, Point2f, Point3f, Pose, Region};
use kpt_model::KeypointModel;

/// One grayscale video frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Position in the source sequence
    pub index: u64,
    pub width: u32,
    pub height: u32,
    pub pixels: Image,
}

impl Frame {
    pub fn new(index: u64, width: u32, height: u32, pixels: Image) -> Self {
        Self {
            index,
            width,
            height,
            pixels,
        }
    }

    /// True when `p` lies at least `margin` pixels inside every frame edge
    pub fn within_margin(&self, p: &Point2f, margin: u32) -> bool {
        let m = margin as f32;
        p.x.is_finite()
            && p.y.is_finite()
            && p.x >= m
            && p.y >= m
            && p.x < self.width as f32 - m
            && p.y < self.height as f32 - m
    }
}

/// What the matcher found for one active slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlotOutcome {
    /// Followed into the current frame
    Tracked(Point2f),
    Failed,
}

/// Descriptor match for a model point outside the active set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewMatch {
    pub model_index: usize,
    pub observation: Point2f,
}

/// Matcher result for one frame.
///
/// `slots` refers to active slots as they stood when the matcher was called.
/// Slots that are not mentioned keep their previous observation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchReport {
    pub slots: Vec<(usize, SlotOutcome)>,
    pub new_matches: Vec<NewMatch>,
}

/// Frame-to-frame tracker and descriptor matcher
pub trait FrameMatcher {
    fn match_frame(&mut self, frame: &Frame, model: &KeypointModel) -> MatchReport;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSolution {
    pub pose: Pose,
    /// Correspondences consistent with `pose`
    pub inliers: usize,
}

/// Robust 2D-3D pose estimation.
///
/// `object_points[i]` is observed at `image_points[i]`. `None` means no pose
/// could be found within the iteration budget.
pub trait PoseSolver {
    fn solve(
        &self,
        object_points: &[Point3f],
        image_points: &[Point2f],
        camera: &CameraModel,
        iterations: usize,
    ) -> Option<PoseSolution>;
}

impl<S: PoseSolver + ?Sized> PoseSolver for Box<S> {
    fn solve(
        &self,
        object_points: &[Point3f],
        image_points: &[Point2f],
        camera: &CameraModel,
        iterations: usize,
    ) -> Option<PoseSolution> {
        (**self).solve(object_points, image_points, camera, iterations)
    }
}

/// Bootstrap output: model geometry plus the observations visible in the seed frame
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSeed {
    pub points: Vec<Point3f>,
    pub descriptors: Descriptors,
    /// `(model index, image point)` pairs to activate right away
    pub observations: Vec<(usize, Point2f)>,
}

/// Builds a model from a frame and a user-selected region
pub trait ModelBootstrap {
    fn seed(&mut self, frame: &Frame, region: &Region) -> Option<ModelSeed>;
}
