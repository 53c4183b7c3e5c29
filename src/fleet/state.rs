//! Point-in-time view of the fleet's instance states.

use std::collections::BTreeMap;

use crate::cloud::{Instance, InstanceState};

/// Instance id → lifecycle state, rebuilt on every poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetSnapshot {
    states: BTreeMap<String, InstanceState>,
}

impl FleetSnapshot {
    pub fn from_instances(instances: &[Instance]) -> Self {
        Self {
            states: instances
                .iter()
                .map(|i| (i.id.clone(), i.state))
                .collect(),
        }
    }

    /// Number of instances in each state present.
    pub fn counts(&self) -> BTreeMap<InstanceState, usize> {
        let mut counts = BTreeMap::new();
        for state in self.states.values() {
            *counts.entry(*state).or_default() += 1;
        }
        counts
    }

    /// Ids of instances currently in `state`.
    pub fn ids_in(&self, state: InstanceState) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// True when all of `expected` instances are reported terminated.
    pub fn all_terminated(&self, expected: usize) -> bool {
        self.ids_in(InstanceState::Terminated).len() == expected
    }
}

/// Render counts as `pending: 1, running: 2`.
pub fn summarize(counts: &BTreeMap<InstanceState, usize>) -> String {
    counts
        .iter()
        .map(|(state, n)| format!("{state}: {n}"))
        .collect::<Vec<_>>()
        .join(", ")
}
