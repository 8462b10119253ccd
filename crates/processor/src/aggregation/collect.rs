use serde::{Deserialize, Serialize};

/// Accumulator that keeps every value in arrival order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectAccumulator<V> {
    values: Vec<V>,
}

impl<V> Default for CollectAccumulator<V> {
    fn default() -> Self {
        Self { values: Vec::new() }
    }
}

impl<V: Clone> CollectAccumulator<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: V) {
        self.values.push(value);
    }

    pub fn merge(&mut self, other: &CollectAccumulator<V>) {
        self.values.extend(other.values.iter().cloned());
    }

    pub fn values(&self) -> &[V] {
        &self.values
    }

    pub fn count(&self) -> u64 {
        self.values.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_keeps_order() {
        let mut acc = CollectAccumulator::new();
        acc.update("b".to_string());
        acc.update("a".to_string());
        let mut other = CollectAccumulator::new();
        other.update("c".to_string());
        acc.merge(&other);
        assert_eq!(acc.values(), ["b", "a", "c"]);
        assert_eq!(acc.count(), 3);
    }
}
