//! Parked continuations and their registry.
//!
//! `park` captures the reduction waiting for its result and registers it
//! under a fresh id. Each id resumes at most once: [`ParkRegistry::take`]
//! removes the entry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::VmError;
use crate::machine::BackendKind;
use crate::register::RegisterSnapshot;
use crate::stack::StackSnapshot;
use crate::value::ParkedId;
use crate::walk::WalkSnapshot;

/// Backend-specific captured state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParkedState {
    Walk(WalkSnapshot),
    Stack(StackSnapshot),
    Register(RegisterSnapshot),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkedContinuation {
    pub backend: BackendKind,
    pub state: ParkedState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkRegistry {
    next: ParkedId,
    entries: BTreeMap<ParkedId, ParkedContinuation>,
}

impl Default for ParkRegistry {
    fn default() -> Self {
        Self {
            next: 1,
            entries: BTreeMap::new(),
        }
    }
}

impl ParkRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under an id never issued by this registry before.
    pub fn park(&mut self, continuation: ParkedContinuation) -> ParkedId {
        let id = self.next;
        self.next += 1;
        self.entries.insert(id, continuation);
        id
    }

    pub fn get(&self, id: ParkedId) -> Result<&ParkedContinuation, VmError> {
        self.entries.get(&id).ok_or(VmError::UnknownContinuation { id })
    }

    /// Remove for resumption. A second take of the same id fails.
    pub fn take(&mut self, id: ParkedId) -> Result<ParkedContinuation, VmError> {
        self.entries.remove(&id).ok_or(VmError::UnknownContinuation { id })
    }

    #[must_use]
    pub fn contains(&self, id: ParkedId) -> bool {
        self.entries.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ParkedId> + '_ {
        self.entries.keys().copied()
    }

    /// Drop every entry. Ids keep counting up, so stale handles stay dead.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::Cont;
    use crate::env::Env;
    use assert_matches::assert_matches;

    fn walk_entry() -> ParkedContinuation {
        ParkedContinuation {
            backend: BackendKind::Tree,
            state: ParkedState::Walk(WalkSnapshot {
                env: Env::new(),
                frames: Cont::empty(),
            }),
        }
    }

    #[test]
    fn test_ids_are_one_shot() {
        let mut registry = ParkRegistry::new();
        let id = registry.park(walk_entry());
        assert!(registry.contains(id));
        registry.take(id).unwrap();
        assert_matches!(registry.take(id), Err(VmError::UnknownContinuation { .. }));
    }

    #[test]
    fn test_clear_does_not_reissue_ids() {
        let mut registry = ParkRegistry::new();
        let first = registry.park(walk_entry());
        registry.clear();
        let second = registry.park(walk_entry());
        assert_ne!(first, second);
        assert_matches!(registry.get(first), Err(VmError::UnknownContinuation { id }) if id == first);
    }
}
