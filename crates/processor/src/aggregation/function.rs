//! Aggregate functions and their accumulators

use serde::{Deserialize, Serialize};
use std::fmt;

use super::avg::AverageAccumulator;
use super::collect::CollectAccumulator;
use super::count::CountAccumulator;
use super::minmax::MinMaxAccumulator;
use super::reduce::{ReduceAccumulator, Reducer};
use crate::core::{Record, ToF64};
use crate::error::{AggregationError, AggregationResult};

/// Built-in aggregate functions
#[derive(Debug, Clone)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Average,
    /// Every value in the window, in arrival order
    Collect,
    Reduce(Reducer),
}

impl AggregateFunction {
    /// Look up a built-in function by name
    ///
    /// `Reduce` needs a closure and cannot be named.
    pub fn from_name(name: &str) -> AggregationResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "count" => Ok(AggregateFunction::Count),
            "sum" => Ok(AggregateFunction::Sum),
            "min" => Ok(AggregateFunction::Min),
            "max" => Ok(AggregateFunction::Max),
            "avg" | "average" | "mean" => Ok(AggregateFunction::Average),
            "collect" => Ok(AggregateFunction::Collect),
            other => Err(AggregationError::InvalidValue {
                function: other.to_string(),
                reason: "unknown aggregate function".to_string(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Average => "average",
            AggregateFunction::Collect => "collect",
            AggregateFunction::Reduce(reducer) => reducer.name(),
        }
    }

    /// Empty accumulator for this function
    pub fn create_accumulator<V>(&self) -> Accumulator<V> {
        match self {
            AggregateFunction::Count => Accumulator::Count(CountAccumulator::new()),
            AggregateFunction::Sum => Accumulator::Sum(super::sum::SumAccumulator::new()),
            AggregateFunction::Min | AggregateFunction::Max => {
                Accumulator::MinMax(MinMaxAccumulator::new())
            }
            AggregateFunction::Average => Accumulator::Average(AverageAccumulator::new()),
            AggregateFunction::Collect => Accumulator::Collect(CollectAccumulator::default()),
            AggregateFunction::Reduce(_) => Accumulator::Reduce(ReduceAccumulator::new()),
        }
    }

    fn numeric<V: ToF64>(&self, value: &V) -> AggregationResult<f64> {
        match value.to_f64() {
            Some(v) if v.is_finite() => Ok(v),
            Some(v) => Err(AggregationError::InvalidValue {
                function: self.name().to_string(),
                reason: format!("non-finite value {}", v),
            }),
            None => Err(AggregationError::InvalidValue {
                function: self.name().to_string(),
                reason: "value is not numeric".to_string(),
            }),
        }
    }

    /// Fold a record into an accumulator, creating it if absent
    pub fn fold<V>(
        &self,
        acc: Option<Accumulator<V>>,
        record: &Record<V>,
    ) -> AggregationResult<Accumulator<V>>
    where
        V: Clone + ToF64,
    {
        let mut acc = acc.unwrap_or_else(|| self.create_accumulator());
        match (self, &mut acc) {
            (AggregateFunction::Count, Accumulator::Count(a)) => a.update(),
            (AggregateFunction::Sum, Accumulator::Sum(a)) => a.update(self.numeric(&record.value)?),
            (AggregateFunction::Min | AggregateFunction::Max, Accumulator::MinMax(a)) => {
                a.update(self.numeric(&record.value)?)
            }
            (AggregateFunction::Average, Accumulator::Average(a)) => {
                a.update(self.numeric(&record.value)?)
            }
            (AggregateFunction::Collect, Accumulator::Collect(a)) => a.update(record.value.clone()),
            (AggregateFunction::Reduce(reducer), Accumulator::Reduce(a)) => {
                let value = self.numeric(&record.value)?;
                a.update(reducer, value);
                if let Some(v) = a.value() {
                    if !v.is_finite() {
                        return Err(AggregationError::InvalidValue {
                            function: self.name().to_string(),
                            reason: format!("reducer produced non-finite value {}", v),
                        });
                    }
                }
            }
            (_, other) => return Err(self.mismatch(other)),
        }
        Ok(acc)
    }

    /// Combine two accumulators of this function (session merges)
    pub fn merge<V: Clone>(
        &self,
        mut left: Accumulator<V>,
        right: &Accumulator<V>,
    ) -> AggregationResult<Accumulator<V>> {
        match (self, &mut left, right) {
            (AggregateFunction::Count, Accumulator::Count(a), Accumulator::Count(b)) => a.merge(b),
            (AggregateFunction::Sum, Accumulator::Sum(a), Accumulator::Sum(b)) => a.merge(b),
            (
                AggregateFunction::Min | AggregateFunction::Max,
                Accumulator::MinMax(a),
                Accumulator::MinMax(b),
            ) => a.merge(b),
            (AggregateFunction::Average, Accumulator::Average(a), Accumulator::Average(b)) => {
                a.merge(b)
            }
            (AggregateFunction::Collect, Accumulator::Collect(a), Accumulator::Collect(b)) => {
                a.merge(b)
            }
            (AggregateFunction::Reduce(reducer), Accumulator::Reduce(a), Accumulator::Reduce(b)) => {
                a.merge(reducer, b)
            }
            (_, _, other) => return Err(self.mismatch(other)),
        }
        Ok(left)
    }

    /// Final value of a window
    pub fn finalize<V: Clone>(&self, acc: &Accumulator<V>) -> AggregationResult<AggregateValue<V>> {
        let insufficient = || AggregationError::InsufficientData {
            function: self.name().to_string(),
        };
        match (self, acc) {
            (AggregateFunction::Count, Accumulator::Count(a)) => Ok(AggregateValue::Count(a.count())),
            (AggregateFunction::Sum, Accumulator::Sum(a)) => Ok(AggregateValue::Number(a.sum())),
            (AggregateFunction::Min, Accumulator::MinMax(a)) => {
                a.min().map(AggregateValue::Number).ok_or_else(insufficient)
            }
            (AggregateFunction::Max, Accumulator::MinMax(a)) => {
                a.max().map(AggregateValue::Number).ok_or_else(insufficient)
            }
            (AggregateFunction::Average, Accumulator::Average(a)) => {
                a.mean().map(AggregateValue::Number).ok_or_else(insufficient)
            }
            (AggregateFunction::Collect, Accumulator::Collect(a)) => {
                Ok(AggregateValue::Values(a.values().to_vec()))
            }
            (AggregateFunction::Reduce(_), Accumulator::Reduce(a)) => {
                a.value().map(AggregateValue::Number).ok_or_else(insufficient)
            }
            (_, other) => Err(self.mismatch(other)),
        }
    }

    fn mismatch<V>(&self, acc: &Accumulator<V>) -> AggregationError {
        AggregationError::TypeMismatch {
            expected: self.name().to_string(),
            actual: acc.kind().to_string(),
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Serializable per-window aggregation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Accumulator<V> {
    Count(CountAccumulator),
    Sum(super::sum::SumAccumulator),
    MinMax(MinMaxAccumulator),
    Average(AverageAccumulator),
    Collect(CollectAccumulator<V>),
    Reduce(ReduceAccumulator),
}

impl<V> Accumulator<V> {
    pub fn kind(&self) -> &'static str {
        match self {
            Accumulator::Count(_) => "count",
            Accumulator::Sum(_) => "sum",
            Accumulator::MinMax(_) => "min_max",
            Accumulator::Average(_) => "average",
            Accumulator::Collect(_) => "collect",
            Accumulator::Reduce(_) => "reduce",
        }
    }
}

/// Finalized window value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregateValue<V> {
    Count(u64),
    Number(f64),
    Values(Vec<V>),
}

impl<V> AggregateValue<V> {
    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AggregateValue::Count(c) => Some(*c as f64),
            AggregateValue::Number(n) => Some(*n),
            AggregateValue::Values(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(values: &[f64]) -> Vec<Record<f64>> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Record::with_ingestion_time("k", *v, i as i64, 0))
            .collect()
    }

    fn fold_all(function: &AggregateFunction, values: &[f64]) -> Accumulator<f64> {
        let mut acc = None;
        for record in records(values) {
            acc = Some(function.fold(acc, &record).unwrap());
        }
        acc.unwrap()
    }

    #[test]
    fn test_builtin_functions() {
        let values = [4.0, 1.0, 7.0];
        let cases = [
            (AggregateFunction::Count, AggregateValue::Count(3)),
            (AggregateFunction::Sum, AggregateValue::Number(12.0)),
            (AggregateFunction::Min, AggregateValue::Number(1.0)),
            (AggregateFunction::Max, AggregateValue::Number(7.0)),
            (AggregateFunction::Average, AggregateValue::Number(4.0)),
            (AggregateFunction::Collect, AggregateValue::Values(vec![4.0, 1.0, 7.0])),
        ];
        for (function, expected) in cases {
            let acc = fold_all(&function, &values);
            assert_eq!(function.finalize(&acc).unwrap(), expected, "{}", function);
        }
    }

    #[test]
    fn test_reduce_function() {
        let function = AggregateFunction::Reduce(Reducer::new("product", |a, b| a * b));
        let acc = fold_all(&function, &[2.0, 5.0]);
        assert_eq!(function.finalize(&acc).unwrap(), AggregateValue::Number(10.0));
        assert_eq!(function.name(), "product");
    }

    #[test]
    fn test_merge_matches_single_fold() {
        for function in [
            AggregateFunction::Count,
            AggregateFunction::Sum,
            AggregateFunction::Min,
            AggregateFunction::Max,
            AggregateFunction::Average,
            AggregateFunction::Collect,
        ] {
            let left = fold_all(&function, &[1.0, 2.0]);
            let right = fold_all(&function, &[10.0]);
            let merged = function.merge(left, &right).unwrap();
            let whole = fold_all(&function, &[1.0, 2.0, 10.0]);
            assert_eq!(
                function.finalize(&merged).unwrap(),
                function.finalize(&whole).unwrap()
            );
        }
    }

    #[test]
    fn test_non_finite_value_fails_fold() {
        let record = Record::with_ingestion_time("k", f64::NAN, 0, 0);
        let err = AggregateFunction::Sum.fold(None, &record).unwrap_err();
        assert!(matches!(err, AggregationError::InvalidValue { .. }));

        // Count does not look at the payload
        assert!(AggregateFunction::Count.fold(None, &record).is_ok());
    }

    #[test]
    fn test_non_numeric_json_fails_fold() {
        let record = Record::with_ingestion_time("k", serde_json::json!({"x": 1}), 0, 0);
        assert!(AggregateFunction::Average.fold(None, &record).is_err());
        assert!(AggregateFunction::Collect.fold(None, &record).is_ok());
    }

    #[test]
    fn test_mismatched_accumulator() {
        let acc: Accumulator<f64> = AggregateFunction::Count.create_accumulator();
        let err = AggregateFunction::Sum.finalize(&acc).unwrap_err();
        assert!(matches!(err, AggregationError::TypeMismatch { .. }));
    }

    #[test]
    fn test_from_name() {
        assert!(matches!(
            AggregateFunction::from_name("AVG").unwrap(),
            AggregateFunction::Average
        ));
        assert!(AggregateFunction::from_name("median").is_err());
    }

    #[test]
    fn test_accumulator_bincode_roundtrip() {
        let acc = fold_all(&AggregateFunction::Average, &[1.0, 3.0]);
        let bytes = bincode::serialize(&acc).unwrap();
        let restored: Accumulator<f64> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(acc, restored);
    }

    #[test]
    fn test_aggregate_value_json_shape() {
        let value: AggregateValue<f64> = AggregateValue::Count(3);
        assert_eq!(serde_json::to_string(&value).unwrap(), "3");
        let value: AggregateValue<f64> = AggregateValue::Values(vec![1.5]);
        assert_eq!(serde_json::to_string(&value).unwrap(), "[1.5]");
    }
}
