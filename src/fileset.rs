//! User-reorderable inputs for multi-file operations (merge, batch).
//!
//! Every reordering gesture, whether drag-and-drop or the up/down buttons,
//! goes through [`OrderedFileSet::move_item`], so keyboard and pointer
//! interactions produce identical orders.

use crate::error::DocOpsError;
use serde::{Deserialize, Serialize};

/// An ordered sequence of opaque file handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderedFileSet<T> {
    items: Vec<T>,
}

impl<T> Default for OrderedFileSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> OrderedFileSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }

    /// Append at the end.
    pub fn insert(&mut self, item: T) {
        self.items.push(item);
    }

    /// Remove and return the item at `index`; later items shift down by one.
    pub fn remove(&mut self, index: usize) -> Result<T, DocOpsError> {
        self.check(index)?;
        Ok(self.items.remove(index))
    }

    /// Relocate the item at `from` to position `to`. Every other item
    /// keeps its relative order; `move_item(i, i)` is a no-op.
    pub fn move_item(&mut self, from: usize, to: usize) -> Result<(), DocOpsError> {
        self.check(from)?;
        self.check(to)?;
        if from < to {
            self.items[from..=to].rotate_left(1);
        } else if from > to {
            self.items[to..=from].rotate_right(1);
        }
        Ok(())
    }

    /// "Up" button. No-op on the first item.
    pub fn move_up(&mut self, index: usize) -> Result<(), DocOpsError> {
        self.check(index)?;
        self.move_item(index, index.saturating_sub(1))
    }

    /// "Down" button. No-op on the last item.
    pub fn move_down(&mut self, index: usize) -> Result<(), DocOpsError> {
        self.check(index)?;
        self.move_item(index, (index + 1).min(self.items.len() - 1))
    }

    /// Drop the dragged item onto the slot currently holding `target`.
    pub fn drop_onto(&mut self, dragged: usize, target: usize) -> Result<(), DocOpsError> {
        self.move_item(dragged, target)
    }

    fn check(&self, index: usize) -> Result<(), DocOpsError> {
        if index < self.items.len() {
            Ok(())
        } else {
            Err(DocOpsError::IndexOutOfRange {
                index,
                len: self.items.len(),
            })
        }
    }
}

impl<T> FromIterator<T> for OrderedFileSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<T> From<Vec<T>> for OrderedFileSet<T> {
    fn from(items: Vec<T>) -> Self {
        Self { items }
    }
}

impl<'a, T> IntoIterator for &'a OrderedFileSet<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abcd() -> OrderedFileSet<char> {
        "ABCD".chars().collect()
    }

    fn order(set: &OrderedFileSet<char>) -> String {
        set.iter().collect()
    }

    #[test]
    fn move_last_to_front() {
        let mut set = abcd();
        set.move_item(3, 0).unwrap();
        assert_eq!(order(&set), "DABC");
    }

    #[test]
    fn move_front_to_back() {
        let mut set = abcd();
        set.move_item(0, 3).unwrap();
        assert_eq!(order(&set), "BCDA");
    }

    #[test]
    fn move_to_same_index_is_noop() {
        for i in 0..4 {
            let mut set = abcd();
            set.move_item(i, i).unwrap();
            assert_eq!(order(&set), "ABCD");
        }
    }

    #[test]
    fn every_move_is_a_permutation_relocating_one_item() {
        let n = 6;
        let original: Vec<usize> = (0..n).collect();
        for from in 0..n {
            for to in 0..n {
                let mut set: OrderedFileSet<usize> = original.clone().into();
                set.move_item(from, to).unwrap();

                let mut sorted = set.as_slice().to_vec();
                sorted.sort_unstable();
                assert_eq!(sorted, original, "not a permutation for {from}->{to}");
                assert_eq!(set.get(to), Some(&original[from]));

                let rest_before: Vec<usize> =
                    original.iter().copied().filter(|&x| x != from).collect();
                let rest_after: Vec<usize> =
                    set.iter().copied().filter(|&x| x != from).collect();
                assert_eq!(rest_before, rest_after, "relative order broken for {from}->{to}");
            }
        }
    }

    #[test]
    fn out_of_range_is_rejected_and_leaves_set_untouched() {
        let mut set = abcd();
        assert!(matches!(
            set.move_item(4, 0),
            Err(DocOpsError::IndexOutOfRange { index: 4, len: 4 })
        ));
        assert!(set.move_item(0, 9).is_err());
        assert_eq!(order(&set), "ABCD");
    }

    #[test]
    fn remove_shifts_without_gaps() {
        let mut set = abcd();
        assert_eq!(set.remove(1).unwrap(), 'B');
        assert_eq!(order(&set), "ACD");
        assert_eq!(set.get(1), Some(&'C'));
        assert!(set.remove(3).is_err());
    }

    #[test]
    fn insert_appends() {
        let mut set = abcd();
        set.insert('E');
        assert_eq!(order(&set), "ABCDE");
    }

    #[test]
    fn buttons_at_edges_are_noops() {
        let mut set = abcd();
        set.move_up(0).unwrap();
        set.move_down(3).unwrap();
        assert_eq!(order(&set), "ABCD");
    }

    #[test]
    fn keyboard_and_drag_reorders_agree() {
        // Moving D to the front with three "up" presses…
        let mut keyboard = abcd();
        keyboard.move_up(3).unwrap();
        keyboard.move_up(2).unwrap();
        keyboard.move_up(1).unwrap();

        // …equals a single drag of D onto A.
        let mut pointer = abcd();
        pointer.drop_onto(3, 0).unwrap();

        assert_eq!(keyboard, pointer);
        assert_eq!(order(&pointer), "DABC");

        let mut keyboard = abcd();
        keyboard.move_down(0).unwrap();
        keyboard.move_down(1).unwrap();
        let mut pointer = abcd();
        pointer.drop_onto(0, 2).unwrap();
        assert_eq!(keyboard, pointer);
    }
}
