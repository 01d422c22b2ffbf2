use crate::data::{RatingStore, RatingSubset, UserId};
use crate::error::EvalError;
use crate::param::{EvaluationType, GivenN, Param};
use crate::split::{fold_fingerprint, DataSplitter};
use log::{debug, info};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Training/test pair of one cross-validation round.
pub struct Round {
    /// 1-based
    pub round: usize,
    pub training: Arc<RatingStore>,
    pub test: RatingStore,
    /// Users truncated by given-N, the only ones list metrics should see
    pub focus_users: Option<BTreeSet<UserId>>,
}

/// The folds of a store and the rules to turn them into rounds.
#[derive(Debug, Clone)]
pub struct CrossValidation {
    pub folds: Vec<RatingSubset>,
    pub special_test_splits: Option<Vec<RatingSubset>>,
    pub additional_training: RatingSubset,
    pub given_training_test: bool,
    pub splitter_name: String,
}

impl CrossValidation {
    pub fn new(store: &RatingStore, splitter: &mut dyn DataSplitter, rng: &mut ChaCha8Rng) -> Result<CrossValidation, EvalError> {
        let folds = splitter.split_data(store, rng)?;
        let cv = CrossValidation {
            folds,
            special_test_splits: splitter.special_test_splits().map(|s| s.to_vec()),
            additional_training: splitter.additional_training_data(),
            given_training_test: splitter.given_training_test(),
            splitter_name: splitter.name(),
        };
        info!("Data split with {}: {} test sets", cv.splitter_name, cv.test_splits().len());
        Ok(cv)
    }

    /// Held-out sets, one per potential round.
    pub fn test_splits(&self) -> &[RatingSubset] {
        self.special_test_splits.as_deref().unwrap_or(&self.folds)
    }

    /// Number of rounds to run: one per test set, capped by `max_validation_rounds`,
    /// or exactly one for a given training/test split.
    pub fn round_count(&self, param: &Param) -> usize {
        if self.given_training_test || param.general.evaluation_type == EvaluationType::giventrainingtestsplit {
            return 1.min(self.test_splits().len());
        }
        let available = self.test_splits().len();
        if param.general.max_validation_rounds > 0 {
            available.min(param.general.max_validation_rounds)
        } else {
            available
        }
    }

    /// Builds the round using test set `index` (0-based): training is the store minus
    /// that test set plus the additional training data, test is the store minus training.
    pub fn build_round(&self, store: &RatingStore, index: usize, given_n: Option<GivenN>, rng: &mut ChaCha8Rng) -> Result<Round, EvalError> {
        let held_out = self.test_splits().get(index).ok_or_else(|| {
            EvalError::Config(format!("round {} requested but only {} test sets exist", index + 1, self.test_splits().len()))
        })?;

        let mut training = store.copy_and_remove_ratings(held_out);
        for r in &self.additional_training {
            training.add(*r);
            training.add_implicit_rating(*r);
        }
        let mut test = store.copy_and_remove_ratings(training.ratings());

        let focus_users = given_n.map(|g| apply_given_n(&mut training, g, rng));

        training.recalculate_averages();
        test.recalculate_averages();
        debug!("Round {}: {} training ratings, {} test ratings", index + 1, training.len(), test.len());

        Ok(Round { round: index + 1, training: Arc::new(training), test, focus_users })
    }

    pub fn fingerprint(&self) -> String {
        fold_fingerprint(self.test_splits())
    }
}

/// Truncates a random `percentage` of the training users to `n` random ratings each and
/// returns the selected users.
pub fn apply_given_n(training: &mut RatingStore, given_n: GivenN, rng: &mut ChaCha8Rng) -> BTreeSet<UserId> {
    let mut users: Vec<UserId> = training.users().collect();
    users.shuffle(rng);
    let selected = ((given_n.percentage / 100.0) * users.len() as f64).round() as usize;

    let mut focus = BTreeSet::new();
    for user in users.into_iter().take(selected) {
        if let Some(bucket) = training.ratings_of_user(user) {
            let mut ratings: Vec<_> = bucket.iter().copied().collect();
            ratings.shuffle(rng);
            for r in ratings.iter().skip(given_n.n) {
                training.remove_rating(r);
            }
        }
        focus.insert(user);
    }
    debug!("Given-{}: truncated {} training users", given_n.n, focus.len());
    focus
}
