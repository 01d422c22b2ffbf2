use crate::error::EvalError;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use std::fmt;

/// Value of one metric for one algorithm in one round (1-based).
///
/// Aggregated results carry the number of rounds they were averaged over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub algorithm: String,
    pub metric: String,
    #[serde(with = "nullable_f64")]
    pub value: f64,
    pub round: usize,
}

impl EvaluationResult {
    pub fn new(algorithm: &str, metric: &str, value: f64, round: usize) -> EvaluationResult {
        EvaluationResult { algorithm: algorithm.to_string(), metric: metric.to_string(), value, round }
    }

    pub fn identity(&self) -> (String, String) {
        (self.algorithm.clone(), self.metric.clone())
    }
}

impl fmt::Display for EvaluationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} = {:.4} (round {})", self.algorithm, self.metric, self.value, self.round)
    }
}

// JSON has no NaN: undefined values travel as null
mod nullable_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_some(value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Averages per-round results by `(algorithm, metric)`.
///
/// The identities of the first round define the output; a later result with an
/// unknown identity is an error. Output is sorted by algorithm then metric.
pub fn aggregate(per_round: &BTreeMap<usize, Vec<EvaluationResult>>) -> Result<Vec<EvaluationResult>, EvalError> {
    let Some(first) = per_round.values().next() else {
        return Ok(Vec::new());
    };

    let mut accumulators: BTreeMap<(String, String), Option<f64>> =
        first.iter().map(|r| (r.identity(), None)).collect();

    for (round, results) in per_round {
        for result in results {
            let slot = accumulators.get_mut(&result.identity()).ok_or_else(|| EvalError::InconsistentResults {
                algorithm: result.algorithm.clone(),
                metric: result.metric.clone(),
                round: *round,
            })?;
            *slot = Some(slot.map_or(result.value, |sum| sum + result.value));
        }
    }

    let rounds = per_round.len();
    Ok(accumulators.into_iter()
        .map(|((algorithm, metric), sum)| EvaluationResult {
            algorithm,
            metric,
            value: sum.map_or(f64::NAN, |s| s / rounds as f64),
            round: rounds,
        })
        .collect())
}

/// Spread of one identity's values across rounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispersion {
    pub algorithm: String,
    pub metric: String,
    #[serde(with = "nullable_f64")]
    pub std_dev: f64,
    #[serde(with = "nullable_f64")]
    pub min: f64,
    #[serde(with = "nullable_f64")]
    pub max: f64,
}

/// Sample standard deviation, min and max of every identity over the rounds.
/// NaN when fewer than two rounds contributed.
pub fn dispersion(per_round: &BTreeMap<usize, Vec<EvaluationResult>>) -> Vec<Dispersion> {
    let mut values: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();
    for result in per_round.values().flatten() {
        values.entry(result.identity()).or_default().push(result.value);
    }
    values.into_iter()
        .map(|((algorithm, metric), v)| Dispersion {
            algorithm,
            metric,
            std_dev: v.iter().std_dev(),
            min: Statistics::min(v.iter()),
            max: Statistics::max(v.iter()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rounds(entries: Vec<(usize, Vec<EvaluationResult>)>) -> BTreeMap<usize, Vec<EvaluationResult>> {
        entries.into_iter().collect()
    }

    #[test]
    fn test_two_rounds_are_averaged() {
        let per_round = rounds(vec![
            (1, vec![EvaluationResult::new("algoA", "MAE", 1.0, 1)]),
            (2, vec![EvaluationResult::new("algoA", "MAE", 3.0, 2)]),
        ]);
        let results = aggregate(&per_round).unwrap();
        assert_eq!(results, vec![EvaluationResult::new("algoA", "MAE", 2.0, 2)]);
    }

    #[test]
    fn test_single_round_is_unchanged() {
        let raw = vec![
            EvaluationResult::new("b", "RMSE", 0.91, 1),
            EvaluationResult::new("a", "MAE", 0.73, 1),
        ];
        let results = aggregate(&rounds(vec![(1, raw)])).unwrap();
        assert_eq!(results[0], EvaluationResult::new("a", "MAE", 0.73, 1));
        assert_eq!(results[1], EvaluationResult::new("b", "RMSE", 0.91, 1));
    }

    #[test]
    fn test_arrival_order_does_not_matter() {
        let a = rounds(vec![
            (1, vec![EvaluationResult::new("x", "MAE", 1.0, 1), EvaluationResult::new("y", "MAE", 4.0, 1)]),
            (2, vec![EvaluationResult::new("y", "MAE", 2.0, 2), EvaluationResult::new("x", "MAE", 3.0, 2)]),
        ]);
        let b = rounds(vec![
            (2, vec![EvaluationResult::new("x", "MAE", 3.0, 2), EvaluationResult::new("y", "MAE", 2.0, 2)]),
            (1, vec![EvaluationResult::new("y", "MAE", 4.0, 1), EvaluationResult::new("x", "MAE", 1.0, 1)]),
        ]);
        assert_eq!(aggregate(&a).unwrap(), aggregate(&b).unwrap());
    }

    #[test]
    fn test_negative_and_nan_values() {
        let per_round = rounds(vec![
            (1, vec![EvaluationResult::new("a", "Delta", -1.0, 1), EvaluationResult::new("a", "Precision", f64::NAN, 1)]),
            (2, vec![EvaluationResult::new("a", "Delta", -3.0, 2), EvaluationResult::new("a", "Precision", 0.5, 2)]),
        ]);
        let results = aggregate(&per_round).unwrap();
        assert_eq!(results[0].value, -2.0);
        assert!(results[1].value.is_nan());
    }

    #[test]
    fn test_unknown_identity_is_an_error() {
        let per_round = rounds(vec![
            (1, vec![EvaluationResult::new("a", "MAE", 1.0, 1)]),
            (2, vec![EvaluationResult::new("a", "RMSE", 1.0, 2)]),
        ]);
        match aggregate(&per_round) {
            Err(EvalError::InconsistentResults { metric, round, .. }) => {
                assert_eq!(metric, "RMSE");
                assert_eq!(round, 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_undefined_values_survive_json() {
        let result = EvaluationResult::new("a", "Precision", f64::NAN, 1);
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("null"));
        let back: EvaluationResult = serde_json::from_str(&json).unwrap();
        assert!(back.value.is_nan());
    }

    #[test]
    fn test_empty_input() {
        assert!(aggregate(&BTreeMap::new()).unwrap().is_empty());
    }

    #[test]
    fn test_dispersion() {
        let per_round = rounds(vec![
            (1, vec![EvaluationResult::new("a", "MAE", 1.0, 1)]),
            (2, vec![EvaluationResult::new("a", "MAE", 3.0, 2)]),
        ]);
        let d = dispersion(&per_round);
        assert_eq!(d.len(), 1);
        assert!((d[0].std_dev - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!((d[0].min, d[0].max), (1.0, 3.0));

        let single = dispersion(&rounds(vec![(1, vec![EvaluationResult::new("a", "MAE", 1.0, 1)])]));
        assert!(single[0].std_dev.is_nan());
    }
}
