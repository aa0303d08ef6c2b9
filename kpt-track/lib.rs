//! Per-frame tracking loop for a rigid object described by a [`KeypointModel`].
//!
//! [`TrackerSession`] drives the model through `Uninitialized → Initializing →
//! Tracking ⇄ Lost`. Matching, pose solving and model bootstrap are external
//! collaborators behind the traits in [`collaborators`]; [`synthetic`] ships a
//! deterministic set of them for tests and the `kpt` binary. Frames and init
//! requests cross threads through [`handoff`].
//!
//! [`KeypointModel`]: kpt_model::KeypointModel

use thiserror::Error;

use kpt_model::ModelError;

pub mod builder;
pub mod collaborators;
pub mod config;
pub mod handoff;
pub mod session;
pub mod synthetic;

pub use builder::SessionBuilder;
pub use collaborators::{
    Frame, FrameMatcher, MatchReport, ModelBootstrap, ModelSeed, NewMatch, PoseSolution, PoseSolver,
    SlotOutcome,
};
pub use config::{ConfigError, TrackerConfig};
pub use handoff::{init_channel, FrameSlot, InitRequester, InitSignal, RegionSelector};
pub use session::{FrameEvent, FrameOutput, SessionSummary, TrackerSession, TrackingState};

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Matcher report rejected: {0}")]
    Matcher(ModelError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type TrackResult<T> = Result<T, TrackError>;
