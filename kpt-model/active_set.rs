use kpt_core::Point2f;

use crate::error::{ModelError, ModelResult};

/// Currently tracked subset of the model, stored as parallel arrays.
///
/// Slot `i` of [`points`](Self::points) and [`to_model`](Self::to_model) describe
/// the same tracked point. Keeping the two arrays separate lets the matcher and the
/// pose solver consume the observations as one contiguous buffer.
#[derive(Debug, Clone, Default)]
pub struct ActiveSet {
    points: Vec<Point2f>,
    to_model: Vec<usize>,
    // Scratch buffers reused by removal so steady-state frames do not allocate
    marks: Vec<bool>,
    pos_of: Vec<usize>,
    orig_at: Vec<usize>,
}

impl ActiveSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
            to_model: Vec::with_capacity(capacity),
            marks: Vec::with_capacity(capacity),
            pos_of: Vec::with_capacity(capacity),
            orig_at: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.to_model.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_model.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.to_model.capacity()
    }

    /// Current observations, one per slot
    pub fn points(&self) -> &[Point2f] {
        &self.points
    }

    /// Model index of every slot
    pub fn to_model(&self) -> &[usize] {
        &self.to_model
    }

    pub fn model_index(&self, slot: usize) -> Option<usize> {
        self.to_model.get(slot).copied()
    }

    /// Iterate `(slot, observation, model index)` in slot order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Point2f, usize)> + '_ {
        self.points
            .iter()
            .zip(self.to_model.iter())
            .enumerate()
            .map(|(slot, (p, &m))| (slot, p, m))
    }

    /// Overwrite the observation held by `slot`
    pub fn set_point(&mut self, slot: usize, point: Point2f) -> ModelResult<()> {
        let len = self.len();
        let target = self
            .points
            .get_mut(slot)
            .ok_or(ModelError::OutOfRange { slot, len })?;
        *target = point;
        Ok(())
    }

    /// Appends a slot. Uniqueness of `model_index` is checked by the owning model.
    pub(crate) fn push(&mut self, point: Point2f, model_index: usize) -> usize {
        self.points.push(point);
        self.to_model.push(model_index);
        self.to_model.len() - 1
    }

    pub(crate) fn clear(&mut self) {
        self.points.clear();
        self.to_model.clear();
    }

    /// Check that `slots` are in range and distinct without mutating the set.
    pub fn validate_removal(&mut self, slots: &[usize]) -> ModelResult<()> {
        let len = self.len();
        self.marks.clear();
        self.marks.resize(len, false);

        for &slot in slots {
            if slot >= len {
                return Err(ModelError::OutOfRange { slot, len });
            }
            if self.marks[slot] {
                return Err(ModelError::DuplicateSlot { slot });
            }
            self.marks[slot] = true;
        }
        Ok(())
    }

    /// Evict `slots` by swapping each one to the tail and truncating.
    ///
    /// `slots` address the set as it was before the call. A swap can move a slot
    /// that is still waiting to be evicted, so `pos_of` tracks where every original
    /// slot currently lives and `orig_at` is its inverse. Each eviction is O(1);
    /// resetting the two tables is a single O(len) pass per call.
    ///
    /// Callers must run [`validate_removal`](Self::validate_removal) first.
    pub(crate) fn compact(&mut self, slots: &[usize]) {
        if slots.is_empty() {
            return;
        }

        let len = self.len();
        self.pos_of.clear();
        self.pos_of.extend(0..len);
        self.orig_at.clear();
        self.orig_at.extend(0..len);

        let mut live = len;
        for &slot in slots {
            live -= 1;
            let pos = self.pos_of[slot];
            self.swap_positions(pos, live);
        }

        self.points.truncate(live);
        self.to_model.truncate(live);
    }

    fn swap_positions(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.points.swap(a, b);
        self.to_model.swap(a, b);
        self.orig_at.swap(a, b);
        self.pos_of[self.orig_at[a]] = a;
        self.pos_of[self.orig_at[b]] = b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn create_test_set(model_indices: &[usize]) -> ActiveSet {
        let mut set = ActiveSet::with_capacity(model_indices.len());
        for &m in model_indices {
            set.push(Point2f::new(m as f32, 2.0 * m as f32), m);
        }
        set
    }

    fn remove(set: &mut ActiveSet, slots: &[usize]) -> ModelResult<()> {
        set.validate_removal(slots)?;
        set.compact(slots);
        Ok(())
    }

    fn assert_slots_coherent(set: &ActiveSet) {
        assert_eq!(set.points().len(), set.to_model().len());
        for (_, p, m) in set.iter() {
            // Every observation must still sit next to its own model index
            assert_eq!(*p, Point2f::new(m as f32, 2.0 * m as f32));
        }
    }

    #[test]
    fn test_remove_single_slot() {
        let mut set = create_test_set(&[10, 11, 12, 13]);
        remove(&mut set, &[1]).unwrap();

        assert_eq!(set.len(), 3);
        let remaining: BTreeSet<usize> = set.to_model().iter().copied().collect();
        assert_eq!(remaining, BTreeSet::from([10, 12, 13]));
        assert_slots_coherent(&set);
    }

    #[test]
    fn test_remove_nothing_is_noop() {
        let mut set = create_test_set(&[3, 1, 4]);
        remove(&mut set, &[]).unwrap();
        assert_eq!(set.to_model(), &[3, 1, 4]);
    }

    #[test]
    fn test_remove_slots_moved_by_earlier_swaps() {
        // Evicting slot 0 first moves slot 4 into position 0, which is then evicted too
        let mut set = create_test_set(&[0, 1, 2, 3, 4]);
        remove(&mut set, &[0, 4, 2]).unwrap();

        let remaining: BTreeSet<usize> = set.to_model().iter().copied().collect();
        assert_eq!(remaining, BTreeSet::from([1, 3]));
        assert_slots_coherent(&set);
    }

    #[test]
    fn test_remove_tail_first() {
        let mut set = create_test_set(&[0, 1, 2, 3, 4, 5]);
        remove(&mut set, &[5, 4, 3]).unwrap();
        assert_eq!(set.to_model(), &[0, 1, 2]);
    }

    #[test]
    fn test_remove_all() {
        let mut set = create_test_set(&[7, 8, 9]);
        remove(&mut set, &[2, 0, 1]).unwrap();
        assert!(set.is_empty());
        assert!(set.points().is_empty());
    }

    #[test]
    fn test_out_of_range_leaves_set_untouched() {
        let mut set = create_test_set(&[0, 1, 2]);
        let result = remove(&mut set, &[0, 3]);
        assert!(matches!(result, Err(ModelError::OutOfRange { slot: 3, len: 3 })));
        assert_eq!(set.to_model(), &[0, 1, 2]);
    }

    #[test]
    fn test_duplicate_slot_rejected() {
        let mut set = create_test_set(&[0, 1, 2]);
        let result = remove(&mut set, &[1, 1]);
        assert!(matches!(result, Err(ModelError::DuplicateSlot { slot: 1 })));
        assert_eq!(set.to_model(), &[0, 1, 2]);
    }

    #[test]
    fn test_set_point() {
        let mut set = create_test_set(&[0, 1]);
        set.set_point(1, Point2f::new(5.0, 5.0)).unwrap();
        assert_eq!(set.points()[1], Point2f::new(5.0, 5.0));
        assert!(matches!(
            set.set_point(2, Point2f::origin()),
            Err(ModelError::OutOfRange { slot: 2, len: 2 })
        ));
    }

    #[test]
    fn test_scratch_reuse_across_frames() {
        let mut set = create_test_set(&(0..50).collect::<Vec<_>>());
        for frame in 0..5 {
            let slots: Vec<usize> = (0..set.len()).step_by(3).collect();
            remove(&mut set, &slots).unwrap();
            assert_slots_coherent(&set);
            set.push(Point2f::new(100.0 + frame as f32, 200.0 + 2.0 * frame as f32), 100 + frame);
        }
        let unique: BTreeSet<usize> = set.to_model().iter().copied().collect();
        assert_eq!(unique.len(), set.len());
    }
}
