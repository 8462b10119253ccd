use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A named user reduction `Fn(acc, value) -> acc`
///
/// The function must be associative for session merges to be meaningful.
#[derive(Clone)]
pub struct Reducer {
    name: String,
    func: Arc<dyn Fn(f64, f64) -> f64 + Send + Sync>,
}

impl Reducer {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(f64, f64) -> f64 + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, acc: f64, value: f64) -> f64 {
        (self.func)(acc, value)
    }
}

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reducer").field("name", &self.name).finish()
    }
}

/// Accumulator for a [`Reducer`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReduceAccumulator {
    value: Option<f64>,
    count: u64,
}

impl ReduceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, reducer: &Reducer, value: f64) {
        self.value = Some(match self.value {
            Some(acc) => reducer.apply(acc, value),
            None => value,
        });
        self.count += 1;
    }

    pub fn merge(&mut self, reducer: &Reducer, other: &ReduceAccumulator) {
        if let Some(value) = other.value {
            self.value = Some(match self.value {
                Some(acc) => reducer.apply(acc, value),
                None => value,
            });
        }
        self.count += other.count;
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}
