use std::fmt;

use kpt_core::KpStatus;

use crate::active_set::ActiveSet;

/// First broken invariant found between the model statuses and the active set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inconsistency {
    /// Observation and model-index arrays disagree in length
    LengthMismatch { points: usize, model: usize },
    /// A slot refers past the end of the model
    IndexOutOfRange { slot: usize, index: usize },
    /// Two slots refer to the same model point
    DuplicateIndex { slot: usize, index: usize },
    /// A slot refers to a model point that is not `Match`/`Track`
    InactiveStatus { slot: usize, index: usize, status: KpStatus },
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::LengthMismatch { points, model } => {
                write!(f, "active set holds {} observations but {} model indices", points, model)
            }
            Inconsistency::IndexOutOfRange { slot, index } => {
                write!(f, "slot {} refers to missing model point {}", slot, index)
            }
            Inconsistency::DuplicateIndex { slot, index } => {
                write!(f, "slot {} repeats model point {}", slot, index)
            }
            Inconsistency::InactiveStatus { slot, index, status } => {
                write!(f, "slot {} refers to model point {} with status {:?}", slot, index, status)
            }
        }
    }
}

/// Verify the active set against per-point statuses.
///
/// Duplicate detection relies on the status invariant: the first slot seen for a
/// model point flips a mark in `seen`, so the check stays linear.
pub fn check(statuses: &[KpStatus], active: &ActiveSet, seen: &mut Vec<bool>) -> Result<(), Inconsistency> {
    if active.points().len() != active.to_model().len() {
        return Err(Inconsistency::LengthMismatch {
            points: active.points().len(),
            model: active.to_model().len(),
        });
    }

    seen.clear();
    seen.resize(statuses.len(), false);

    for (slot, &index) in active.to_model().iter().enumerate() {
        let status = *statuses
            .get(index)
            .ok_or(Inconsistency::IndexOutOfRange { slot, index })?;
        if seen[index] {
            return Err(Inconsistency::DuplicateIndex { slot, index });
        }
        seen[index] = true;
        if !status.is_active() {
            return Err(Inconsistency::InactiveStatus { slot, index, status });
        }
    }
    Ok(())
}
