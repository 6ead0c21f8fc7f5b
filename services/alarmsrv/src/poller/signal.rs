//! Per-site signal memory and edge detection

use std::collections::{BTreeMap, HashMap};

/// Last observed value per logical point
///
/// A point absent from the map is unknown. Owned by one site task and
/// reset whenever that site reconnects.
#[derive(Debug, Default)]
pub struct SignalState {
    values: HashMap<String, bool>,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample; returns the new value when it is an edge
    ///
    /// The first sample of an unknown point only seeds the state.
    pub fn observe(&mut self, point: &str, value: bool) -> Option<bool> {
        match self.values.insert(point.to_string(), value) {
            Some(previous) if previous != value => Some(value),
            _ => None,
        }
    }

    pub fn get(&self, point: &str) -> Option<bool> {
        self.values.get(point).copied()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .collect()
    }
}
