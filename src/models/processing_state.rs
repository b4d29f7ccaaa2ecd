//! The two persisted outcome sets.

use std::collections::BTreeSet;

/// Filenames already handled by earlier runs.
///
/// `posted` and `failed` should be disjoint, but nothing enforces it: a
/// name recorded as failed and later fixed by hand can end up in both.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessingState {
    /// Names successfully transferred and verified.
    pub posted: BTreeSet<String>,

    /// Names whose transfer attempt did not complete.
    pub failed: BTreeSet<String>,
}

impl ProcessingState {
    /// True when `name` is in either set.
    pub fn is_known(&self, name: &str) -> bool {
        self.posted.contains(name) || self.failed.contains(name)
    }

    /// Names present in both sets.
    pub fn overlap(&self) -> impl Iterator<Item = &String> {
        self.posted.intersection(&self.failed)
    }

    pub fn len(&self) -> usize {
        self.posted.len() + self.failed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_in_either_set() {
        let mut state = ProcessingState::default();
        state.posted.insert("a.csv".into());
        state.failed.insert("b.csv".into());

        assert!(state.is_known("a.csv"));
        assert!(state.is_known("b.csv"));
        assert!(!state.is_known("c.csv"));
    }

    #[test]
    fn overlap_lists_names_in_both_sets() {
        let mut state = ProcessingState::default();
        state.posted.insert("a.csv".into());
        state.failed.insert("a.csv".into());
        state.failed.insert("b.csv".into());

        let overlap: Vec<_> = state.overlap().collect();
        assert_eq!(overlap, vec!["a.csv"]);
        assert_eq!(state.len(), 3);
    }
}
