use serde::{Deserialize, Serialize};

/// Accumulator for sum aggregation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SumAccumulator {
    sum: f64,
    count: u64,
}

impl SumAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn merge(&mut self, other: &SumAccumulator) {
        self.sum += other.sum;
        self.count += other.count;
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_basic() {
        let mut acc = SumAccumulator::new();
        for v in [1.0, 2.0, 3.5] {
            acc.update(v);
        }
        assert_eq!(acc.sum(), 6.5);
        assert_eq!(acc.count(), 3);
    }

    #[test]
    fn test_sum_merge() {
        let mut a = SumAccumulator::new();
        a.update(1.0);
        a.update(2.0);
        let mut b = SumAccumulator::new();
        b.update(-4.0);
        a.merge(&b);
        assert_eq!(a.sum(), -1.0);
        assert_eq!(a.count(), 3);
    }
}
