use kpt_core::{CameraModel, KpStatus, Point2f, Point3f, Pose, Region, TrackerParams};
use kpt_model::{KeypointModel, ModelError, PinholeProjector, PoseProjector};
use kpt_vote::{cast_votes, enclosing_box, CentroidVoter, VoteTable};
use log::{debug, error, info, warn};
use nalgebra::Vector2;

use crate::collaborators::{
    Frame, FrameMatcher, MatchReport, ModelBootstrap, ModelSeed, PoseSolver, SlotOutcome,
};
use crate::handoff::{FrameSlot, InitSignal};
use crate::{TrackError, TrackResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingState {
    /// No model yet, frames are ignored
    Uninitialized,
    /// Bootstrap in progress
    Initializing,
    Tracking,
    /// Model kept, active set empty, waiting for reacquisition or re-init
    Lost,
}

/// Notable things that happened while processing one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    Initialized { points: usize, active: usize },
    InitRejected,
    PointsRemoved(usize),
    PointsAdded(usize),
    PoseSolved { inliers: usize },
    SolverFailed { consecutive: usize },
    TrackingLost,
    Reacquired,
    InvariantBroken,
}

/// Per-frame result of a [`TrackerSession`]
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutput {
    pub frame_index: u64,
    pub state: TrackingState,
    pub centroid: Option<Point2f>,
    /// Top-left, top-right, bottom-right, bottom-left
    pub bounding_box: Option<[Point2f; 4]>,
    /// Only reported while tracking with a solved pose
    pub pose: Option<Pose>,
    pub active_points: usize,
    /// Projected active point and centroid vote endpoint, one pair per active slot
    pub vote_vectors: Vec<(Point2f, Point2f)>,
    pub events: Vec<FrameEvent>,
}

/// Totals over a [`TrackerSession::run`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    pub frames: usize,
    pub tracking_frames: usize,
    pub lost_frames: usize,
    pub initializations: usize,
    pub solver_failures: usize,
    /// Frames skipped because the matcher report was malformed
    pub rejected_reports: usize,
    pub dropped_frames: u64,
    active_total: usize,
}

impl SessionSummary {
    pub fn record(&mut self, output: &FrameOutput) {
        self.frames += 1;
        match output.state {
            TrackingState::Tracking => {
                self.tracking_frames += 1;
                self.active_total += output.active_points;
            }
            TrackingState::Lost => self.lost_frames += 1,
            _ => {}
        }
        for event in &output.events {
            match event {
                FrameEvent::Initialized { .. } => self.initializations += 1,
                FrameEvent::SolverFailed { .. } => self.solver_failures += 1,
                _ => {}
            }
        }
    }

    /// Mean active set size over tracking frames
    pub fn mean_active(&self) -> f64 {
        if self.tracking_frames == 0 {
            0.0
        } else {
            self.active_total as f64 / self.tracking_frames as f64
        }
    }
}

/// Frame tracking loop for one rigid object.
///
/// Owns the [`KeypointModel`] and drives it through
/// `Uninitialized → Initializing → Tracking ⇄ Lost`. Matching, pose solving and
/// bootstrap are delegated to the collaborators; everything here runs on the
/// calling thread.
pub struct TrackerSession<M, S, B, P = PinholeProjector> {
    params: TrackerParams,
    camera: CameraModel,
    matcher: M,
    solver: S,
    bootstrap: B,
    projector: P,
    secondary: Option<Box<dyn PoseSolver + Send>>,
    voter: CentroidVoter,
    state: TrackingState,
    model: Option<KeypointModel>,
    votes: Option<VoteTable>,
    pending_init: Option<Region>,
    last_region: Option<Region>,
    consecutive_failures: usize,
    centroid: Option<Point2f>,
    bounding_box: Option<[Point2f; 4]>,
    frames_processed: u64,
    // Per-frame scratch
    removals: Vec<usize>,
    object_points: Vec<Point3f>,
    vote_origins: Vec<Point2f>,
    vote_offsets: Vec<Vector2<f32>>,
    marks: Vec<bool>,
}

impl<M, S, B> TrackerSession<M, S, B, PinholeProjector>
where
    M: FrameMatcher,
    S: PoseSolver,
    B: ModelBootstrap,
{
    pub fn new(params: TrackerParams, camera: CameraModel, matcher: M, solver: S, bootstrap: B) -> Self {
        let voter = CentroidVoter::new(params.eps, params.min_points);
        Self {
            params,
            camera,
            matcher,
            solver,
            bootstrap,
            projector: PinholeProjector,
            secondary: None,
            voter,
            state: TrackingState::Uninitialized,
            model: None,
            votes: None,
            pending_init: None,
            last_region: None,
            consecutive_failures: 0,
            centroid: None,
            bounding_box: None,
            frames_processed: 0,
            removals: Vec::new(),
            object_points: Vec::new(),
            vote_origins: Vec::new(),
            vote_offsets: Vec::new(),
            marks: Vec::new(),
        }
    }
}

impl<M, S, B, P> TrackerSession<M, S, B, P>
where
    M: FrameMatcher,
    S: PoseSolver,
    B: ModelBootstrap,
    P: PoseProjector,
{
    /// Swap the projection used for votes and the bounding box
    pub fn with_projector<Q: PoseProjector>(self, projector: Q) -> TrackerSession<M, S, B, Q> {
        TrackerSession {
            params: self.params,
            camera: self.camera,
            matcher: self.matcher,
            solver: self.solver,
            bootstrap: self.bootstrap,
            projector,
            secondary: self.secondary,
            voter: self.voter,
            state: self.state,
            model: self.model,
            votes: self.votes,
            pending_init: self.pending_init,
            last_region: self.last_region,
            consecutive_failures: self.consecutive_failures,
            centroid: self.centroid,
            bounding_box: self.bounding_box,
            frames_processed: self.frames_processed,
            removals: self.removals,
            object_points: self.object_points,
            vote_origins: self.vote_origins,
            vote_offsets: self.vote_offsets,
            marks: self.marks,
        }
    }

    /// Second estimation path whose result is stored as the model's custom pose
    pub fn with_secondary_solver(mut self, solver: Box<dyn PoseSolver + Send>) -> Self {
        self.secondary = Some(solver);
        self
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn model(&self) -> Option<&KeypointModel> {
        self.model.as_ref()
    }

    pub fn params(&self) -> &TrackerParams {
        &self.params
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    pub fn matcher_mut(&mut self) -> &mut M {
        &mut self.matcher
    }

    pub fn last_region(&self) -> Option<Region> {
        self.last_region
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// (Re-)initialize from `region` on the next processed frame
    pub fn request_init(&mut self, region: Region) {
        debug!(
            "init requested for region ({:.0}, {:.0}) {:.0}x{:.0}",
            region.x, region.y, region.width, region.height
        );
        self.pending_init = Some(region);
    }

    pub fn has_pending_init(&self) -> bool {
        self.pending_init.is_some()
    }

    /// Advance the session by one frame.
    ///
    /// A pending init request takes precedence over tracking. A matcher report
    /// naming unknown or duplicate slots is rejected with
    /// [`TrackError::Matcher`] before the model is touched.
    pub fn process_frame(&mut self, frame: &Frame) -> TrackResult<FrameOutput> {
        self.frames_processed += 1;
        let mut events = Vec::new();
        let mut vote_vectors = Vec::new();

        if let Some(region) = self.pending_init.take() {
            self.initialize(frame, region, &mut events);
        } else if matches!(self.state, TrackingState::Tracking | TrackingState::Lost) {
            self.track(frame, &mut events, &mut vote_vectors)?;
        }

        Ok(self.output(frame.index, events, vote_vectors))
    }

    /// Consume frames until the slot is closed, polling `init` between frames.
    ///
    /// A rejected matcher report skips its frame; the model is untouched and the
    /// next frame is tracked as usual. Other errors end the run.
    pub fn run<F>(&mut self, frames: &FrameSlot, init: &InitSignal, mut on_output: F) -> TrackResult<SessionSummary>
    where
        F: FnMut(&Frame, &FrameOutput),
    {
        let mut summary = SessionSummary::default();
        while let Some(frame) = frames.wait_latest() {
            if let Some(region) = init.poll() {
                self.request_init(region);
            }
            let output = match self.process_frame(&frame) {
                Ok(output) => output,
                Err(TrackError::Matcher(e)) => {
                    warn!("frame {}: matcher report rejected: {}", frame.index, e);
                    summary.rejected_reports += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            summary.record(&output);
            on_output(&frame, &output);
        }
        summary.dropped_frames = frames.dropped();

        info!(
            "session finished: {} frames ({} tracking, {} lost, {} dropped, {} rejected), mean active set {:.1}",
            summary.frames,
            summary.tracking_frames,
            summary.lost_frames,
            summary.dropped_frames,
            summary.rejected_reports,
            summary.mean_active()
        );
        Ok(summary)
    }

    fn initialize(&mut self, frame: &Frame, region: Region, events: &mut Vec<FrameEvent>) {
        let previous = self.state;
        self.state = TrackingState::Initializing;
        info!("initializing on frame {}", frame.index);

        let built = match self.bootstrap.seed(frame, &region) {
            Some(seed) => self.build_model(frame, seed),
            None => {
                warn!("bootstrap found nothing to track in the selected region");
                None
            }
        };

        let Some(model) = built else {
            self.state = previous;
            events.push(FrameEvent::InitRejected);
            return;
        };

        let (points, active) = (model.len(), model.active().len());
        self.votes = Some(VoteTable::new(points, self.params.update_votes));
        self.model = Some(model);
        self.last_region = Some(region);
        self.centroid = Some(region.center());
        self.bounding_box = Some(region.corners());
        self.consecutive_failures = 0;
        self.state = TrackingState::Tracking;

        info!("tracking {} model points, {} active", points, active);
        events.push(FrameEvent::Initialized { points, active });
    }

    fn build_model(&self, frame: &Frame, seed: ModelSeed) -> Option<KeypointModel> {
        let mut model = match KeypointModel::init(&seed.points, &seed.descriptors) {
            Ok(model) => model,
            Err(e) => {
                warn!("bootstrap seed rejected: {}", e);
                return None;
            }
        };

        for &(index, observation) in &seed.observations {
            if !frame.within_margin(&observation, self.params.filter_border) {
                continue;
            }
            if let Err(e) = model.activate(index, observation, KpStatus::Match) {
                warn!("bootstrap seed rejected: {}", e);
                return None;
            }
        }
        Some(model)
    }

    fn track(
        &mut self,
        frame: &Frame,
        events: &mut Vec<FrameEvent>,
        vote_vectors: &mut Vec<(Point2f, Point2f)>,
    ) -> TrackResult<()> {
        let Some(model) = self.model.as_mut() else {
            return Ok(());
        };

        let report = self.matcher.match_frame(frame, model);
        validate_report(&report, model, &mut self.marks).map_err(TrackError::Matcher)?;

        let (removed, added) = match apply_report(
            model,
            frame,
            &report,
            self.params.filter_border,
            &mut self.removals,
        ) {
            Ok(counts) => counts,
            Err(e) => return self.absorb_model_error(e, events),
        };
        if removed > 0 {
            events.push(FrameEvent::PointsRemoved(removed));
        }
        if added > 0 {
            events.push(FrameEvent::PointsAdded(added));
        }

        let active = model.active().len();
        debug!(
            "frame {}: {} active after -{} +{}",
            frame.index, active, removed, added
        );

        let enough = active >= self.params.min_active_points;
        match self.state {
            TrackingState::Tracking if !enough => {
                info!(
                    "tracking lost on frame {}: {} active points (need {})",
                    frame.index, active, self.params.min_active_points
                );
                self.enter_lost(events);
                return Ok(());
            }
            TrackingState::Lost if !enough => {
                // Stragglers do not carry over into the next frame
                model.reset_tracking();
                return Ok(());
            }
            TrackingState::Lost => {
                info!("reacquired on frame {} with {} active points", frame.index, active);
                self.state = TrackingState::Tracking;
                self.consecutive_failures = 0;
                events.push(FrameEvent::Reacquired);
            }
            _ => {}
        }

        self.estimate_pose(frame, events, vote_vectors)
    }

    fn estimate_pose(
        &mut self,
        frame: &Frame,
        events: &mut Vec<FrameEvent>,
        vote_vectors: &mut Vec<(Point2f, Point2f)>,
    ) -> TrackResult<()> {
        let Some(model) = self.model.as_mut() else {
            return Ok(());
        };

        model.gather_correspondences(&mut self.object_points);
        let solution = self.solver.solve(
            &self.object_points,
            model.active().points(),
            &self.camera,
            self.params.ransac_iterations,
        );

        let Some(solution) = solution else {
            self.consecutive_failures += 1;
            warn!(
                "pose solver failed on frame {} ({} in a row)",
                frame.index, self.consecutive_failures
            );
            events.push(FrameEvent::SolverFailed {
                consecutive: self.consecutive_failures,
            });
            if self.consecutive_failures > self.params.max_solver_failures {
                info!("tracking lost after {} solver failures", self.consecutive_failures);
                self.enter_lost(events);
            }
            return Ok(());
        };

        self.consecutive_failures = 0;
        let pose = solution.pose;
        model.set_pose(pose);
        if let Some(secondary) = &self.secondary {
            if let Some(custom) = secondary.solve(
                &self.object_points,
                model.active().points(),
                &self.camera,
                self.params.ransac_iterations,
            ) {
                model.set_custom_pose(custom.pose);
            }
        }
        events.push(FrameEvent::PoseSolved {
            inliers: solution.inliers,
        });

        let pairs = model.project_vectors(&self.projector, &self.camera, &pose)?;

        self.vote_origins.clear();
        self.vote_offsets.clear();
        if let Some(votes) = self.votes.as_mut() {
            let active = model.active();
            for ((observation, &m), (start, end)) in active.points().iter().zip(active.to_model()).zip(&pairs) {
                votes.record(m, end - start);
                if let Some(vote) = votes.get(m) {
                    self.vote_origins.push(*observation);
                    self.vote_offsets.push(vote);
                }
            }
        }
        let candidates = cast_votes(&self.vote_origins, &self.vote_offsets);

        let centroid = match self.voter.vote(&candidates) {
            Some(outcome) => Some(outcome.centroid),
            None => {
                debug!("no vote consensus, using projected model centroid");
                self.projector
                    .project(&[model.centroid()], &pose, &self.camera)
                    .first()
                    .copied()
            }
        };
        if centroid.is_some() {
            self.centroid = centroid;
        }

        let corners = self.projector.project(&model.bounding_corners(), &pose, &self.camera);
        if let Some(bbox) = enclosing_box(&corners) {
            self.bounding_box = Some(bbox);
        }

        *vote_vectors = pairs;
        Ok(())
    }

    fn enter_lost(&mut self, events: &mut Vec<FrameEvent>) {
        if let Some(model) = self.model.as_mut() {
            model.reset_tracking();
        }
        self.state = TrackingState::Lost;
        self.centroid = None;
        self.bounding_box = None;
        self.consecutive_failures = 0;
        events.push(FrameEvent::TrackingLost);
    }

    /// Turn a broken model invariant into a tracking reset; pass other errors on
    fn absorb_model_error(&mut self, err: ModelError, events: &mut Vec<FrameEvent>) -> TrackResult<()> {
        match err {
            ModelError::InvariantViolation(inconsistency) => {
                error!("{}", inconsistency);
                self.invariant_broken(events);
                Ok(())
            }
            other => Err(other.into()),
        }
    }

    /// Escalation for a model whose active set no longer agrees with its statuses
    pub(crate) fn invariant_broken(&mut self, events: &mut Vec<FrameEvent>) {
        error!("keypoint model invariant broken, resetting and re-initializing from the last region");
        events.push(FrameEvent::InvariantBroken);
        self.enter_lost(events);
        if self.pending_init.is_none() {
            self.pending_init = self.last_region;
        }
    }

    fn output(&self, frame_index: u64, events: Vec<FrameEvent>, vote_vectors: Vec<(Point2f, Point2f)>) -> FrameOutput {
        let tracking = self.state == TrackingState::Tracking;
        let pose = self
            .model
            .as_ref()
            .map(|m| *m.pose())
            .filter(|p| tracking && !p.is_zero());

        FrameOutput {
            frame_index,
            state: self.state,
            centroid: self.centroid.filter(|_| tracking),
            bounding_box: self.bounding_box.filter(|_| tracking),
            pose,
            active_points: self.model.as_ref().map_or(0, |m| m.active().len()),
            vote_vectors,
            events,
        }
    }
}

/// Reject reports that name a slot or model point the model cannot accept.
///
/// Runs before any mutation so a bad report leaves the model untouched.
fn validate_report(report: &MatchReport, model: &KeypointModel, marks: &mut Vec<bool>) -> Result<(), ModelError> {
    let len = model.active().len();
    marks.clear();
    marks.resize(len, false);
    for &(slot, _) in &report.slots {
        if slot >= len {
            return Err(ModelError::OutOfRange { slot, len });
        }
        if std::mem::replace(&mut marks[slot], true) {
            return Err(ModelError::DuplicateSlot { slot });
        }
    }

    let len = model.len();
    marks.clear();
    marks.resize(len, false);
    for m in &report.new_matches {
        let index = m.model_index;
        let status = model
            .status(index)
            .ok_or(ModelError::IndexOutOfRange { index, len })?;
        if status.is_active() || std::mem::replace(&mut marks[index], true) {
            return Err(ModelError::AlreadyActive { index });
        }
    }
    Ok(())
}

/// Apply a validated report. Returns `(removed, added)`.
fn apply_report(
    model: &mut KeypointModel,
    frame: &Frame,
    report: &MatchReport,
    margin: u32,
    removals: &mut Vec<usize>,
) -> Result<(usize, usize), ModelError> {
    removals.clear();
    for &(slot, outcome) in &report.slots {
        match outcome {
            SlotOutcome::Tracked(p) if frame.within_margin(&p, margin) => {
                model.update_observation(slot, p)?;
                model.set_slot_status(slot, KpStatus::Track)?;
            }
            _ => removals.push(slot),
        }
    }
    model.remove_invalid_points(&removals[..])?;

    let mut added = 0;
    for m in &report.new_matches {
        if frame.within_margin(&m.observation, margin) {
            model.activate(m.model_index, m.observation, KpStatus::Match)?;
            added += 1;
        }
    }
    if added > 0 {
        model.verify()?;
    }
    Ok((removals.len(), added))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{NewMatch, PoseSolution};
    use crate::handoff::init_channel;
    use kpt_core::Descriptors;
    use kpt_model::Inconsistency;
    use nalgebra::Vector3;
    use std::collections::VecDeque;

    /// Replays scripted reports, then reports nothing
    struct ScriptedMatcher {
        reports: VecDeque<MatchReport>,
    }

    impl FrameMatcher for ScriptedMatcher {
        fn match_frame(&mut self, _frame: &Frame, _model: &KeypointModel) -> MatchReport {
            self.reports.pop_front().unwrap_or_default()
        }
    }

    /// Succeeds with a fixed pose whenever it gets enough points
    struct FixedSolver {
        pose: Option<Pose>,
    }

    impl PoseSolver for FixedSolver {
        fn solve(&self, object: &[Point3f], image: &[Point2f], _camera: &CameraModel, _iterations: usize) -> Option<PoseSolution> {
            assert_eq!(object.len(), image.len());
            self.pose.filter(|_| object.len() >= 4).map(|pose| PoseSolution {
                pose,
                inliers: object.len(),
            })
        }
    }

    struct GridBootstrap {
        seeds: usize,
    }

    impl ModelBootstrap for GridBootstrap {
        fn seed(&mut self, _frame: &Frame, region: &Region) -> Option<ModelSeed> {
            if region.width < 10.0 {
                return None;
            }
            self.seeds += 1;
            let points: Vec<Point3f> = (0..12)
                .map(|i| Point3f::new((i % 4) as f32 - 1.5, (i / 4) as f32 - 1.0, 0.0))
                .collect();
            let rows: Vec<[u8; 32]> = (0..12).map(|i| [i as u8; 32]).collect();
            let observations = (0..8)
                .map(|i| (i, Point2f::new(100.0 + 10.0 * i as f32, 100.0)))
                .collect();
            Some(ModelSeed {
                points,
                descriptors: Descriptors::from_rows(&rows),
                observations,
            })
        }
    }

    type TestSession = TrackerSession<ScriptedMatcher, FixedSolver, GridBootstrap>;

    fn create_test_params() -> TrackerParams {
        TrackerParams {
            min_active_points: 6,
            max_solver_failures: 2,
            n_threads: 1,
            ..TrackerParams::default()
        }
    }

    fn create_test_pose() -> Pose {
        Pose::from_rotation_vector(Vector3::zeros(), Vector3::new(0.0, 0.0, 10.0))
    }

    fn create_test_session(reports: Vec<MatchReport>, pose: Option<Pose>) -> TestSession {
        TrackerSession::new(
            create_test_params(),
            CameraModel::new(500.0, 500.0, 320.0, 240.0),
            ScriptedMatcher {
                reports: reports.into(),
            },
            FixedSolver { pose },
            GridBootstrap { seeds: 0 },
        )
    }

    fn create_test_frame(index: u64) -> Frame {
        Frame::new(index, 640, 480, Vec::new())
    }

    fn create_test_region() -> Region {
        Region::new(90.0, 90.0, 100.0, 30.0)
    }

    fn tracked_all(n: usize) -> MatchReport {
        MatchReport {
            slots: (0..n)
                .map(|s| (s, SlotOutcome::Tracked(Point2f::new(120.0 + s as f32, 200.0))))
                .collect(),
            new_matches: Vec::new(),
        }
    }

    fn initialized(reports: Vec<MatchReport>, pose: Option<Pose>) -> TestSession {
        let mut session = create_test_session(reports, pose);
        session.request_init(create_test_region());
        let out = session.process_frame(&create_test_frame(0)).unwrap();
        assert_eq!(out.state, TrackingState::Tracking);
        session
    }

    #[test]
    fn test_frames_ignored_until_init() {
        let mut session = create_test_session(Vec::new(), None);
        let out = session.process_frame(&create_test_frame(0)).unwrap();
        assert_eq!(out.state, TrackingState::Uninitialized);
        assert!(out.centroid.is_none());
        assert!(out.events.is_empty());
        assert!(session.model().is_none());
    }

    #[test]
    fn test_init_emits_region_geometry() {
        let mut session = create_test_session(Vec::new(), None);
        session.request_init(create_test_region());
        let out = session.process_frame(&create_test_frame(0)).unwrap();

        assert_eq!(out.state, TrackingState::Tracking);
        assert_eq!(out.events, vec![FrameEvent::Initialized { points: 12, active: 8 }]);
        assert_eq!(out.centroid, Some(Point2f::new(140.0, 105.0)));
        assert_eq!(out.bounding_box, Some(create_test_region().corners()));
        assert!(out.pose.is_none());

        let model = session.model().unwrap();
        assert!(model.is_consistent());
        assert_eq!(model.statuses().iter().filter(|s| **s == KpStatus::Match).count(), 8);
    }

    #[test]
    fn test_rejected_init_keeps_previous_state() {
        let mut session = create_test_session(Vec::new(), None);
        session.request_init(Region::new(0.0, 0.0, 5.0, 5.0));
        let out = session.process_frame(&create_test_frame(0)).unwrap();
        assert_eq!(out.state, TrackingState::Uninitialized);
        assert_eq!(out.events, vec![FrameEvent::InitRejected]);
        assert!(session.last_region().is_none());
    }

    #[test]
    fn test_tracking_updates_and_solves() {
        let mut report = tracked_all(8);
        report.slots[3].1 = SlotOutcome::Failed;
        report.new_matches.push(NewMatch {
            model_index: 10,
            observation: Point2f::new(300.0, 300.0),
        });
        let mut session = initialized(vec![report], Some(create_test_pose()));

        let out = session.process_frame(&create_test_frame(1)).unwrap();
        assert_eq!(out.state, TrackingState::Tracking);
        assert!(out.events.contains(&FrameEvent::PointsRemoved(1)));
        assert!(out.events.contains(&FrameEvent::PointsAdded(1)));
        assert!(out.events.contains(&FrameEvent::PoseSolved { inliers: 8 }));
        assert_eq!(out.active_points, 8);
        assert_eq!(out.vote_vectors.len(), 8);
        assert_eq!(out.pose, Some(create_test_pose()));
        assert!(out.centroid.is_some());

        let model = session.model().unwrap();
        assert_eq!(model.status(3), Some(KpStatus::Lost));
        assert_eq!(model.status(10), Some(KpStatus::Match));
        assert_eq!(model.status(0), Some(KpStatus::Track));
        assert!(model.is_consistent());
    }

    #[test]
    fn test_border_observations_are_evicted() {
        let mut report = tracked_all(8);
        report.slots[0].1 = SlotOutcome::Tracked(Point2f::new(4.0, 200.0));
        report.new_matches.push(NewMatch {
            model_index: 11,
            observation: Point2f::new(635.0, 200.0),
        });
        let mut session = initialized(vec![report], Some(create_test_pose()));

        let out = session.process_frame(&create_test_frame(1)).unwrap();
        assert!(out.events.contains(&FrameEvent::PointsRemoved(1)));
        assert!(!out.events.iter().any(|e| matches!(e, FrameEvent::PointsAdded(_))));
        let model = session.model().unwrap();
        assert_eq!(model.status(0), Some(KpStatus::Lost));
        assert_eq!(model.status(11), Some(KpStatus::Lost));
    }

    #[test]
    fn test_bad_report_leaves_model_untouched() {
        let duplicate = MatchReport {
            slots: vec![(1, SlotOutcome::Failed), (1, SlotOutcome::Failed)],
            new_matches: Vec::new(),
        };
        let out_of_range = MatchReport {
            slots: vec![(8, SlotOutcome::Failed)],
            new_matches: Vec::new(),
        };
        let already_active = MatchReport {
            slots: vec![(0, SlotOutcome::Failed)],
            new_matches: vec![NewMatch {
                model_index: 2,
                observation: Point2f::new(200.0, 200.0),
            }],
        };
        let repeated_match = MatchReport {
            slots: Vec::new(),
            new_matches: vec![
                NewMatch { model_index: 9, observation: Point2f::new(200.0, 200.0) },
                NewMatch { model_index: 9, observation: Point2f::new(210.0, 200.0) },
            ],
        };
        let unknown_point = MatchReport {
            slots: Vec::new(),
            new_matches: vec![NewMatch { model_index: 40, observation: Point2f::new(200.0, 200.0) }],
        };
        let mut session = initialized(
            vec![duplicate, out_of_range, already_active, repeated_match, unknown_point],
            Some(create_test_pose()),
        );
        let before = session.model().unwrap().statuses().to_vec();

        let results: Vec<_> = (1..=5).map(|i| session.process_frame(&create_test_frame(i))).collect();
        assert!(matches!(results[0], Err(TrackError::Matcher(ModelError::DuplicateSlot { slot: 1 }))));
        assert!(matches!(results[1], Err(TrackError::Matcher(ModelError::OutOfRange { slot: 8, len: 8 }))));
        assert!(matches!(results[2], Err(TrackError::Matcher(ModelError::AlreadyActive { index: 2 }))));
        assert!(matches!(results[3], Err(TrackError::Matcher(ModelError::AlreadyActive { index: 9 }))));
        assert!(matches!(results[4], Err(TrackError::Matcher(ModelError::IndexOutOfRange { index: 40, len: 12 }))));

        let model = session.model().unwrap();
        assert_eq!(model.statuses(), &before[..]);
        assert_eq!(model.active().len(), 8);
        assert_eq!(session.state(), TrackingState::Tracking);
    }

    #[test]
    fn test_too_few_points_loses_tracking() {
        let mut report = tracked_all(8);
        for slot in 0..3 {
            report.slots[slot].1 = SlotOutcome::Failed;
        }
        let mut session = initialized(vec![report], Some(create_test_pose()));

        let out = session.process_frame(&create_test_frame(1)).unwrap();
        assert_eq!(out.state, TrackingState::Lost);
        assert!(out.events.contains(&FrameEvent::TrackingLost));
        assert!(out.pose.is_none() && out.centroid.is_none() && out.bounding_box.is_none());
        assert_eq!(out.active_points, 0);
        assert!(session.model().unwrap().statuses().iter().all(|s| *s == KpStatus::Lost));
    }

    #[test]
    fn test_reacquire_from_new_matches() {
        let mut lose = tracked_all(8);
        lose.slots.iter_mut().for_each(|s| s.1 = SlotOutcome::Failed);
        let few = MatchReport {
            slots: Vec::new(),
            new_matches: (0..3)
                .map(|m| NewMatch { model_index: m, observation: Point2f::new(200.0 + m as f32 * 20.0, 200.0) })
                .collect(),
        };
        let many = MatchReport {
            slots: Vec::new(),
            new_matches: (2..10)
                .map(|m| NewMatch { model_index: m, observation: Point2f::new(200.0 + m as f32 * 20.0, 200.0) })
                .collect(),
        };
        let mut session = initialized(vec![lose, few, many], Some(create_test_pose()));

        assert_eq!(session.process_frame(&create_test_frame(1)).unwrap().state, TrackingState::Lost);

        let out = session.process_frame(&create_test_frame(2)).unwrap();
        assert_eq!(out.state, TrackingState::Lost);
        assert_eq!(out.active_points, 0);

        let out = session.process_frame(&create_test_frame(3)).unwrap();
        assert_eq!(out.state, TrackingState::Tracking);
        assert!(out.events.contains(&FrameEvent::Reacquired));
        assert_eq!(out.active_points, 8);
        assert!(out.pose.is_some());
    }

    #[test]
    fn test_solver_failure_streak() {
        let reports = (0..4).map(|_| tracked_all(8)).collect();
        let mut session = initialized(reports, None);

        for (frame, expected) in [(1, 1), (2, 2)] {
            let out = session.process_frame(&create_test_frame(frame)).unwrap();
            assert_eq!(out.state, TrackingState::Tracking);
            assert!(out.events.contains(&FrameEvent::SolverFailed { consecutive: expected }));
            // Region geometry from init is retained while the solver fails
            assert_eq!(out.centroid, Some(create_test_region().center()));
        }

        let out = session.process_frame(&create_test_frame(3)).unwrap();
        assert_eq!(out.state, TrackingState::Lost);
        assert!(out.events.contains(&FrameEvent::SolverFailed { consecutive: 3 }));
        assert!(out.events.contains(&FrameEvent::TrackingLost));
    }

    #[test]
    fn test_invariant_break_requests_reinit() {
        let mut session = initialized(Vec::new(), Some(create_test_pose()));

        let mut events = Vec::new();
        session.invariant_broken(&mut events);
        assert_eq!(events, vec![FrameEvent::InvariantBroken, FrameEvent::TrackingLost]);
        assert_eq!(session.state(), TrackingState::Lost);
        assert!(session.has_pending_init());

        let out = session.process_frame(&create_test_frame(1)).unwrap();
        assert_eq!(out.state, TrackingState::Tracking);
        assert!(matches!(out.events[..], [FrameEvent::Initialized { .. }]));
        assert_eq!(session.bootstrap.seeds, 2);
    }

    /// Pinhole projection shifted by a fixed offset
    struct ShiftedProjector(f32);

    impl PoseProjector for ShiftedProjector {
        fn project(&self, points: &[Point3f], pose: &Pose, camera: &CameraModel) -> Vec<Point2f> {
            PinholeProjector
                .project(points, pose, camera)
                .into_iter()
                .map(|p| Point2f::new(p.x + self.0, p.y))
                .collect()
        }
    }

    #[test]
    fn test_secondary_solver_sets_custom_pose() {
        let custom = Pose::from_rotation_vector(Vector3::new(0.0, 0.1, 0.0), Vector3::new(0.0, 0.0, 12.0));
        let mut session = initialized(vec![tracked_all(8)], Some(create_test_pose()))
            .with_secondary_solver(Box::new(FixedSolver { pose: Some(custom) }));

        let out = session.process_frame(&create_test_frame(1)).unwrap();
        assert_eq!(out.pose, Some(create_test_pose()));
        let model = session.model().unwrap();
        assert_eq!(model.custom_pose(), &custom);
        assert_eq!(model.pose(), &create_test_pose());
    }

    #[test]
    fn test_custom_projector_moves_box() {
        let plain = {
            let mut session = initialized(vec![tracked_all(8)], Some(create_test_pose()));
            session.process_frame(&create_test_frame(1)).unwrap()
        };
        let shifted = {
            let mut session =
                initialized(vec![tracked_all(8)], Some(create_test_pose())).with_projector(ShiftedProjector(25.0));
            session.process_frame(&create_test_frame(1)).unwrap()
        };

        let (a, b) = (plain.bounding_box.unwrap(), shifted.bounding_box.unwrap());
        for (p, q) in a.iter().zip(&b) {
            assert!((q.x - p.x - 25.0).abs() < 1e-3);
            assert!((q.y - p.y).abs() < 1e-3);
        }
        for ((s0, _), (s1, _)) in plain.vote_vectors.iter().zip(&shifted.vote_vectors) {
            assert!((s1.x - s0.x - 25.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_model_invariant_violation_resets_and_reinits() {
        let mut session = initialized(Vec::new(), Some(create_test_pose()));

        let mut events = Vec::new();
        let violation = ModelError::InvariantViolation(Inconsistency::DuplicateIndex { slot: 3, index: 1 });
        session.absorb_model_error(violation, &mut events).unwrap();

        assert_eq!(events, vec![FrameEvent::InvariantBroken, FrameEvent::TrackingLost]);
        assert_eq!(session.state(), TrackingState::Lost);
        assert_eq!(session.pending_init, Some(create_test_region()));
        assert_eq!(session.model().unwrap().active().len(), 0);

        let out = session.process_frame(&create_test_frame(1)).unwrap();
        assert_eq!(out.state, TrackingState::Tracking);
        assert!(matches!(out.events[..], [FrameEvent::Initialized { points: 12, active: 8 }]));
        assert!(!session.has_pending_init());
    }

    #[test]
    fn test_other_model_errors_propagate() {
        let mut session = initialized(Vec::new(), Some(create_test_pose()));
        let mut events = Vec::new();
        let result = session.absorb_model_error(ModelError::DuplicateSlot { slot: 2 }, &mut events);

        assert!(matches!(result, Err(TrackError::Model(ModelError::DuplicateSlot { slot: 2 }))));
        assert!(events.is_empty());
        assert_eq!(session.state(), TrackingState::Tracking);
        assert!(!session.has_pending_init());
    }

    #[test]
    fn test_run_skips_rejected_report() {
        let bad = MatchReport {
            slots: vec![(99, SlotOutcome::Failed)],
            new_matches: Vec::new(),
        };
        let mut session = create_test_session(vec![bad, tracked_all(8), tracked_all(8)], Some(create_test_pose()));
        session.request_init(create_test_region());
        let (_requester, signal) = init_channel();

        // One closed slot per frame keeps the run deterministic
        let mut delivered = Vec::new();
        let mut totals = SessionSummary::default();
        for index in 0..4 {
            let frames = FrameSlot::new();
            frames.publish(create_test_frame(index));
            frames.close();
            let summary = session
                .run(&frames, &signal, |_, out| delivered.push((out.frame_index, out.state)))
                .unwrap();
            totals.frames += summary.frames;
            totals.rejected_reports += summary.rejected_reports;
        }

        assert_eq!(totals.frames, 3);
        assert_eq!(totals.rejected_reports, 1);
        assert_eq!(
            delivered,
            vec![
                (0, TrackingState::Tracking),
                (2, TrackingState::Tracking),
                (3, TrackingState::Tracking),
            ]
        );
        assert_eq!(session.model().unwrap().active().len(), 8);
        assert!(session.model().unwrap().is_consistent());
    }

    /// Drops every projected point
    struct EmptyProjector;

    impl PoseProjector for EmptyProjector {
        fn project(&self, _points: &[Point3f], _pose: &Pose, _camera: &CameraModel) -> Vec<Point2f> {
            Vec::new()
        }
    }

    #[test]
    fn test_run_propagates_model_errors() {
        let mut session = initialized(vec![tracked_all(8)], Some(create_test_pose())).with_projector(EmptyProjector);
        let (_requester, signal) = init_channel();

        let frames = FrameSlot::new();
        frames.publish(create_test_frame(1));
        frames.close();
        let result = session.run(&frames, &signal, |_, _| panic!("no output expected"));
        assert!(matches!(
            result,
            Err(TrackError::Model(ModelError::ProjectionMismatch { expected: 8, actual: 0 }))
        ));
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = SessionSummary::default();
        let mut out = FrameOutput {
            frame_index: 0,
            state: TrackingState::Tracking,
            centroid: None,
            bounding_box: None,
            pose: None,
            active_points: 10,
            vote_vectors: Vec::new(),
            events: vec![FrameEvent::Initialized { points: 20, active: 10 }],
        };
        summary.record(&out);
        out.active_points = 20;
        out.events = vec![FrameEvent::SolverFailed { consecutive: 1 }];
        summary.record(&out);
        out.state = TrackingState::Lost;
        summary.record(&out);

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.tracking_frames, 2);
        assert_eq!(summary.lost_frames, 1);
        assert_eq!(summary.initializations, 1);
        assert_eq!(summary.solver_failures, 2);
        assert!((summary.mean_active() - 15.0).abs() < 1e-9);
    }
}
