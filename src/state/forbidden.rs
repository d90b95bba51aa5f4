use std::collections::BTreeSet;
use std::fmt;

use crate::env::StateId;

/// Per-agent set of states the agent must not plan through, with a stack of
/// snapshots so a tentative change can be rolled back.
#[derive(Debug, Clone, Default)]
pub struct ForbiddenStates {
    states: BTreeSet<StateId>,
    snapshots: Vec<BTreeSet<StateId>>,
}

impl ForbiddenStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, state: StateId) -> bool {
        self.states.insert(state)
    }

    pub fn add_all(&mut self, states: impl IntoIterator<Item = StateId>) {
        self.states.extend(states);
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn contains(&self, state: StateId) -> bool {
        self.states.contains(&state)
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = StateId> + '_ {
        self.states.iter().copied()
    }

    /// Push a copy of the current contents.
    pub fn save(&mut self) {
        self.snapshots.push(self.states.clone());
    }

    /// Roll back to the most recent snapshot. Returns `false` if there is none.
    pub fn restore(&mut self) -> bool {
        match self.snapshots.pop() {
            Some(snapshot) => {
                self.states = snapshot;
                true
            }
            None => false,
        }
    }

    /// Keep the current contents and drop the most recent snapshot.
    pub fn commit(&mut self) -> bool {
        self.snapshots.pop().is_some()
    }

    pub fn snapshot_depth(&self) -> usize {
        self.snapshots.len()
    }

    /// Clear contents and snapshots.
    pub fn reset(&mut self) {
        self.states.clear();
        self.snapshots.clear();
    }
}

impl fmt::Display for ForbiddenStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.states.iter().map(|s| s.to_string()).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_snapshot_round_trip() {
        let mut forbidden = ForbiddenStates::new();
        forbidden.add_all([3, 5, 8]);
        let before: Vec<StateId> = forbidden.iter().collect();

        forbidden.save();
        forbidden.clear();
        forbidden.add_all([1, 2]);
        assert!(forbidden.contains(1));
        assert!(!forbidden.contains(3));

        assert!(forbidden.restore());
        let after: Vec<StateId> = forbidden.iter().collect();
        assert_eq!(before, after);
        assert_eq!(forbidden.snapshot_depth(), 0);
    }

    #[test]
    fn test_forbidden_commit_keeps_changes() {
        let mut forbidden = ForbiddenStates::new();
        forbidden.add(4);
        forbidden.save();
        forbidden.add(9);
        assert!(forbidden.commit());
        assert!(forbidden.contains(9));
        assert!(!forbidden.restore());
    }

    #[test]
    fn test_forbidden_nested_snapshots() {
        let mut forbidden = ForbiddenStates::new();
        forbidden.add(1);
        forbidden.save();
        forbidden.add(2);
        forbidden.save();
        forbidden.add(3);
        forbidden.restore();
        assert_eq!(forbidden.len(), 2);
        forbidden.restore();
        assert_eq!(forbidden.len(), 1);
        assert_eq!(forbidden.to_string(), "{1}");
    }
}
