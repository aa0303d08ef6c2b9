//! Keypoint model lifecycle for rigid-object tracking.
//!
//! A [`KeypointModel`] owns the 3D points and descriptors of the tracked object
//! together with a tri-state status per point. The [`ActiveSet`] holds the
//! subset that is being tracked in the current frame and maps each slot back to
//! its model index. Both are kept consistent on every mutation; the check lives
//! in [`consistency`].

pub mod active_set;
pub mod consistency;
pub mod error;
pub mod model;
pub mod projector;

pub use active_set::ActiveSet;
pub use consistency::Inconsistency;
pub use error::{ModelError, ModelResult};
pub use model::KeypointModel;
pub use projector::{PinholeProjector, PoseProjector};
