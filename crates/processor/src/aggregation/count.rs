use serde::{Deserialize, Serialize};

/// Accumulator for count aggregation
///
/// Counts records regardless of their payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountAccumulator {
    pub(crate) count: u64,
}

impl CountAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self) {
        self.count += 1;
    }

    pub fn merge(&mut self, other: &CountAccumulator) {
        self.count += other.count;
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_basic() {
        let mut acc = CountAccumulator::new();
        acc.update();
        acc.update();
        acc.update();
        assert_eq!(acc.count(), 3);
    }

    #[test]
    fn test_count_merge() {
        let mut a = CountAccumulator { count: 2 };
        a.merge(&CountAccumulator { count: 3 });
        assert_eq!(a.count(), 5);
    }

    #[test]
    fn test_count_serialization() {
        let acc = CountAccumulator { count: 2 };
        let bytes = bincode::serialize(&acc).unwrap();
        let restored: CountAccumulator = bincode::deserialize(&bytes).unwrap();
        assert_eq!(acc, restored);
    }
}
