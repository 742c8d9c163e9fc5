//! Bounded linear undo/redo over mesh snapshots

use std::sync::Arc;
use tracing::debug;

use crate::mesh::Mesh;

/// Default number of snapshots kept
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Snapshot history with a cursor. `states` is never empty and `cursor`
/// always indexes into it.
#[derive(Debug, Clone)]
pub struct MeshHistory {
    states: Vec<Arc<Mesh>>,
    cursor: usize,
    limit: usize,
}

impl MeshHistory {
    /// Start a history seeded with `mesh`. Limits below 2 are raised to 2.
    pub fn new(mesh: Mesh, limit: usize) -> Self {
        Self {
            states: vec![Arc::new(mesh)],
            cursor: 0,
            limit: limit.max(2),
        }
    }

    pub fn current(&self) -> &Arc<Mesh> {
        &self.states[self.cursor]
    }

    /// Record a committed edit. Returns false when it equals the current
    /// state and nothing was recorded.
    pub fn record(&mut self, mesh: Mesh) -> bool {
        if *self.states[self.cursor] == mesh {
            return false;
        }

        self.states.truncate(self.cursor + 1);
        self.states.push(Arc::new(mesh));

        if self.states.len() > self.limit {
            // Drop the oldest; the cursor stays on the last index
            self.states.remove(0);
            self.cursor = self.states.len() - 1;
        } else {
            self.cursor += 1;
        }

        debug!("History: recorded state {} of {}", self.cursor + 1, self.states.len());
        true
    }

    pub fn undo(&mut self) -> Option<&Arc<Mesh>> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        Some(&self.states[self.cursor])
    }

    pub fn redo(&mut self) -> Option<&Arc<Mesh>> {
        if self.cursor + 1 >= self.states.len() {
            return None;
        }
        self.cursor += 1;
        Some(&self.states[self.cursor])
    }

    /// Replace the whole history with a single state
    pub fn reset(&mut self, mesh: Mesh) {
        self.states = vec![Arc::new(mesh)];
        self.cursor = 0;
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor + 1 < self.states.len()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nudged(base: &Mesh, step: usize) -> Mesh {
        base.with_point("0-0", step as f64 * 0.001, 0.0).unwrap()
    }

    #[test]
    fn test_record_undo_redo() {
        let base = Mesh::generate(3, 3).unwrap();
        let a = base.with_point("1-1", 0.4, 0.4).unwrap();
        let b = base.with_point("1-1", 0.6, 0.6).unwrap();

        let mut history = MeshHistory::new(base.clone(), 10);
        assert!(!history.can_undo());
        assert!(history.record(a.clone()));
        assert!(history.record(b.clone()));

        assert_eq!(**history.undo().unwrap(), a);
        assert_eq!(**history.current(), a);
        assert!(history.can_redo());
        assert_eq!(**history.redo().unwrap(), b);
        assert!(history.redo().is_none());
    }

    #[test]
    fn test_noop_record_is_ignored() {
        let base = Mesh::generate(2, 2).unwrap();
        let mut history = MeshHistory::new(base.clone(), 10);
        assert!(!history.record(base.clone()));
        assert_eq!(history.len(), 1);

        let a = nudged(&base, 5);
        history.record(a.clone());
        assert!(!history.record(a));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_record_after_undo_truncates() {
        let base = Mesh::generate(2, 2).unwrap();
        let mut history = MeshHistory::new(base.clone(), 10);
        history.record(nudged(&base, 1));
        history.record(nudged(&base, 2));
        history.undo();
        history.undo();
        let c = nudged(&base, 3);
        history.record(c.clone());
        assert_eq!(history.len(), 2);
        assert!(!history.can_redo());
        assert_eq!(**history.current(), c);
    }

    #[test]
    fn test_bound_drops_oldest() {
        let n = 8;
        let base = Mesh::generate(2, 2).unwrap();
        let mut history = MeshHistory::new(nudged(&base, 1), n);
        // Seed counts as the first recorded state
        for step in 2..=n + 5 {
            assert!(history.record(nudged(&base, step)));
        }
        assert_eq!(history.len(), n);
        assert_eq!(history.cursor(), n - 1);

        // Walk back to the oldest surviving state: the 6th recorded
        while history.undo().is_some() {}
        assert_eq!(**history.current(), nudged(&base, 6));
        assert_eq!(history.cursor(), 0);
    }

    #[test]
    fn test_reset() {
        let base = Mesh::generate(2, 2).unwrap();
        let mut history = MeshHistory::new(base.clone(), 4);
        history.record(nudged(&base, 1));
        history.reset(base.clone());
        assert_eq!(history.len(), 1);
        assert!(!history.can_undo());
        assert!(!history.can_redo());
        assert!(history.undo().is_none());
    }
}
