use kpt_core::KpStatus;
use thiserror::Error;

use crate::consistency::Inconsistency;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("Invalid model input: {points} points but {descriptor_rows} descriptor rows (both must be equal and non-zero)")]
    InvalidInput { points: usize, descriptor_rows: usize },
    #[error("Active slot {slot} out of range (active set holds {len})")]
    OutOfRange { slot: usize, len: usize },
    #[error("Active slot {slot} listed more than once for removal")]
    DuplicateSlot { slot: usize },
    #[error("Model index {index} out of range (model holds {len} points)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Model point {index} is already active")]
    AlreadyActive { index: usize },
    #[error("Status {status:?} cannot be assigned to an active slot")]
    InactiveStatus { status: KpStatus },
    #[error("Projector returned {actual} points for {expected} inputs")]
    ProjectionMismatch { expected: usize, actual: usize },
    #[error("Model invariant broken: {0}")]
    InvariantViolation(Inconsistency),
}

pub type ModelResult<T> = Result<T, ModelError>;
