//! Machine lifecycle events.
//!
//! Recorded when [`crate::config::VMConfig::record_events`] is set. Step
//! numbers count successful steps since the machine was created or reset.

use cesk_types::EntityId;
use serde::{Deserialize, Serialize};

use crate::value::{ParkedId, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MachineEvent {
    Loaded { step: u64, root: EntityId },
    /// A stream operation produced [`Value::Blocked`].
    Blocked { step: u64 },
    Parked { step: u64, id: ParkedId },
    Resumed { step: u64, id: ParkedId },
    /// A continuation bundle was registered.
    Imported { step: u64, id: ParkedId, created: usize },
    Halted { step: u64, value: Value },
}

impl MachineEvent {
    #[must_use]
    pub fn step(&self) -> u64 {
        match self {
            MachineEvent::Loaded { step, .. }
            | MachineEvent::Blocked { step }
            | MachineEvent::Parked { step, .. }
            | MachineEvent::Resumed { step, .. }
            | MachineEvent::Imported { step, .. }
            | MachineEvent::Halted { step, .. } => *step,
        }
    }
}

/// Events with step numbers rebased to the first event.
#[must_use]
pub fn normalize(events: &[MachineEvent]) -> Vec<MachineEvent> {
    let Some(first) = events.first().map(MachineEvent::step) else {
        return Vec::new();
    };
    events
        .iter()
        .cloned()
        .map(|mut ev| {
            let rebased = ev.step() - first.min(ev.step());
            match &mut ev {
                MachineEvent::Loaded { step, .. }
                | MachineEvent::Blocked { step }
                | MachineEvent::Parked { step, .. }
                | MachineEvent::Resumed { step, .. }
                | MachineEvent::Imported { step, .. }
                | MachineEvent::Halted { step, .. } => *step = rebased,
            }
            ev
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_rebases_steps() {
        let events = vec![
            MachineEvent::Loaded { step: 7, root: -1 },
            MachineEvent::Halted {
                step: 10,
                value: Value::Int(1),
            },
        ];
        let steps: Vec<u64> = normalize(&events).iter().map(MachineEvent::step).collect();
        assert_eq!(steps, vec![0, 3]);
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_string(&MachineEvent::Parked { step: 2, id: 1 }).unwrap();
        assert_eq!(json, r#"{"kind":"parked","step":2,"id":1}"#);
    }
}
