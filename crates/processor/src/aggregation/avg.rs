use serde::{Deserialize, Serialize};

/// Accumulator for average aggregation
///
/// Keeps the running sum and count so partial averages merge exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AverageAccumulator {
    sum: f64,
    count: u64,
}

impl AverageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn merge(&mut self, other: &AverageAccumulator) {
        self.sum += other.sum;
        self.count += other.count;
    }

    /// Mean of all values, `None` before the first update
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_basic() {
        let mut acc = AverageAccumulator::new();
        assert_eq!(acc.mean(), None);
        for v in [10.0, 20.0, 30.0] {
            acc.update(v);
        }
        assert_eq!(acc.mean(), Some(20.0));
    }

    #[test]
    fn test_average_merge_is_weighted() {
        let mut a = AverageAccumulator::new();
        a.update(10.0);
        let mut b = AverageAccumulator::new();
        b.update(20.0);
        b.update(30.0);
        a.merge(&b);
        assert_eq!(a.mean(), Some(20.0));
        assert_eq!(a.count(), 3);
    }
}
