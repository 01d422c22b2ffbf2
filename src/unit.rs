use crate::aggregate::EvaluationResult;
use crate::data::{RatingStore, UserId};
use crate::error::EvalError;
use crate::metrics::{Metric, MetricContext, NamedMetric};
use crate::recommender::Recommender;
use crate::utils::bound_value;
use log::debug;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

/// Limits applied while a unit runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitLimits {
    pub min_rating: i8,
    pub max_rating: i8,
    /// 0 = unlimited
    pub max_rating_predictions: usize,
    /// 0 = unlimited
    pub max_recommendations: usize,
}

/// One algorithm evaluated on one round: a recommender, its training/test pair and
/// fresh metric instances. Owned by exactly one worker.
pub struct ExperimentUnit {
    pub round: usize,
    pub algorithm: String,
    pub cost: u8,
    recommender: Box<dyn Recommender>,
    training: Arc<RatingStore>,
    test: RatingStore,
    metrics: Vec<NamedMetric>,
    focus_users: Option<BTreeSet<UserId>>,
    limits: UnitLimits,
}

impl ExperimentUnit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        round: usize,
        algorithm: String,
        cost: u8,
        recommender: Box<dyn Recommender>,
        training: Arc<RatingStore>,
        test: RatingStore,
        metrics: Vec<NamedMetric>,
        focus_users: Option<BTreeSet<UserId>>,
        limits: UnitLimits,
    ) -> ExperimentUnit {
        ExperimentUnit { round, algorithm, cost, recommender, training, test, metrics, focus_users, limits }
    }

    /// Trains the recommender on the training store.
    pub fn initialize(&mut self) -> Result<(), EvalError> {
        let start = Instant::now();
        self.recommender.init(&self.training).map_err(|e| EvalError::Init {
            algorithm: self.algorithm.clone(),
            round: self.round,
            reason: e.to_string(),
        })?;
        debug!("{} (round {}) initialized in {:.2?}", self.algorithm, self.round, start.elapsed());
        Ok(())
    }

    /// Feeds predictions and recommendation lists to the metrics and returns one result per metric.
    pub fn execute(mut self) -> Vec<EvaluationResult> {
        let start = Instant::now();
        if let Some(focus) = self.focus_users.take() {
            let outside: Vec<UserId> = self.test.users().filter(|u| !focus.contains(u)).collect();
            for user in outside {
                self.test.remove_user_and_ratings(user);
            }
            debug!("{} (round {}) restricted to {} given-N test users", self.algorithm, self.round, self.test.user_count());
        }
        self.test.recalculate_averages();

        let test = Arc::new(std::mem::take(&mut self.test));
        let context = MetricContext { training: Arc::clone(&self.training), test: Arc::clone(&test) };
        for named in self.metrics.iter_mut() {
            named.metric.initialize(&context);
        }

        let has_prediction_metrics = self.metrics.iter().any(|m| matches!(m.metric, Metric::Prediction(_)));
        let has_list_metrics = self.metrics.iter().any(|m| matches!(m.metric, Metric::List(_)));

        if has_prediction_metrics {
            let cap = if self.limits.max_rating_predictions > 0 { self.limits.max_rating_predictions } else { usize::MAX };
            for rating in test.ratings().iter().take(cap) {
                let prediction = self.recommender
                    .predict_rating(rating.user, rating.item)
                    .map(|p| bound_value(p, self.limits.min_rating, self.limits.max_rating));
                for named in self.metrics.iter_mut() {
                    if let Metric::Prediction(m) = &mut named.metric {
                        m.add_test_prediction(rating, prediction);
                    }
                }
            }
        }

        if has_list_metrics {
            let cap = if self.limits.max_recommendations > 0 { self.limits.max_recommendations } else { usize::MAX };
            for user in test.users().take(cap) {
                let list = self.recommender.recommend_items(user);
                for named in self.metrics.iter_mut() {
                    if let Metric::List(m) = &mut named.metric {
                        m.add_recommendations(user, &list);
                    }
                }
            }
        }

        debug!("{} (round {}) evaluated in {:.2?}", self.algorithm, self.round, start.elapsed());
        self.metrics.iter()
            .map(|named| EvaluationResult::new(&self.algorithm, &named.label, named.metric.result(), self.round))
            .collect()
    }
}
