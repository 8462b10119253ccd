use serde::{Deserialize, Serialize};

/// Accumulator tracking the minimum and maximum value seen
///
/// Shared by the `Min` and `Max` functions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MinMaxAccumulator {
    min: Option<f64>,
    max: Option<f64>,
    count: u64,
}

impl MinMaxAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64) {
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
        self.count += 1;
    }

    pub fn merge(&mut self, other: &MinMaxAccumulator) {
        if let Some(min) = other.min {
            self.min = Some(self.min.map_or(min, |m| m.min(min)));
        }
        if let Some(max) = other.max {
            self.max = Some(self.max.map_or(max, |m| m.max(max)));
        }
        self.count += other.count;
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}
