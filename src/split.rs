use crate::data::{Rating, RatingStore, RatingSubset};
use crate::error::EvalError;
use crate::param::{MinRatingsConstraint, Param, SplitMethod};
use crate::utils;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::cmp::Reverse;

/// Partitions a rating store into folds.
///
/// The folds returned by `split_data` are pairwise disjoint. Ratings listed by
/// `additional_training_data` are added to every training set.
pub trait DataSplitter: Send {
    fn split_data(&mut self, store: &RatingStore, rng: &mut ChaCha8Rng) -> Result<Vec<RatingSubset>, EvalError>;

    /// Test sets that replace the folds as held-out data, if this splitter produces them.
    fn special_test_splits(&self) -> Option<&[RatingSubset]> {
        None
    }

    fn additional_training_data(&self) -> RatingSubset {
        RatingSubset::new()
    }

    fn nb_folds(&self) -> usize;

    /// True when the split yields exactly one test set (fold 0) and one training set.
    fn given_training_test(&self) -> bool {
        false
    }

    fn name(&self) -> String;
}

/// Random splitter: global shuffle, per-user stratified, or condensed per-user.
#[derive(Debug, Clone)]
pub struct DefaultSplitter {
    pub nb_folds: usize,
    pub global_random_split: bool,
    pub constraint: Option<MinRatingsConstraint>,
    special_splits: Option<Vec<RatingSubset>>,
}

impl DefaultSplitter {
    pub fn new(nb_folds: usize, global_random_split: bool, constraint: Option<MinRatingsConstraint>) -> DefaultSplitter {
        DefaultSplitter { nb_folds, global_random_split, constraint, special_splits: None }
    }

    fn condensed_split(&mut self, store: &RatingStore, constraint: MinRatingsConstraint, rng: &mut ChaCha8Rng) -> Result<Vec<RatingSubset>, EvalError> {
        let mut condensed = store.clone();
        let passes = condensed.condense(constraint.per_user, constraint.per_item);
        if condensed.is_empty() {
            return Err(EvalError::EmptyCondensedData {
                min_per_user: constraint.per_user,
                min_per_item: constraint.per_item,
            });
        }
        info!(
            "Condensed data after {} passes: {} users, {} items, {} ratings",
            passes, condensed.user_count(), condensed.item_count(), condensed.len()
        );

        self.special_splits = Some(per_user_split(&condensed, self.nb_folds, rng));

        let mut full: RatingSubset = store.ratings().clone();
        full.extend(condensed.implicit_ratings().iter().copied());
        Ok(vec![full])
    }
}

impl DataSplitter for DefaultSplitter {
    fn split_data(&mut self, store: &RatingStore, rng: &mut ChaCha8Rng) -> Result<Vec<RatingSubset>, EvalError> {
        self.special_splits = None;
        if let Some(constraint) = self.constraint {
            return self.condensed_split(store, constraint, rng);
        }
        let folds = if self.global_random_split {
            global_split(store, self.nb_folds, rng)
        } else {
            per_user_split(store, self.nb_folds, rng)
        };
        debug!("Fold sizes: {:?}", folds.iter().map(|f| f.len()).collect::<Vec<_>>());
        Ok(folds)
    }

    fn special_test_splits(&self) -> Option<&[RatingSubset]> {
        self.special_splits.as_deref()
    }

    fn nb_folds(&self) -> usize {
        self.nb_folds
    }

    fn name(&self) -> String {
        match (self.constraint, self.global_random_split) {
            (Some(c), _) => format!("condensed per-user split ({} folds, {}/{} min ratings)", self.nb_folds, c.per_user, c.per_item),
            (None, true) => format!("global random split ({} folds)", self.nb_folds),
            (None, false) => format!("per-user random split ({} folds)", self.nb_folds),
        }
    }
}

/// Shuffles all ratings and deals them round-robin into `nb_folds` folds.
pub fn global_split(store: &RatingStore, nb_folds: usize, rng: &mut ChaCha8Rng) -> Vec<RatingSubset> {
    let mut ratings: Vec<Rating> = store.ratings().iter().copied().collect();
    ratings.shuffle(rng);
    utils::deal_round_robin(ratings, nb_folds, 0)
        .into_iter()
        .map(|bin| bin.into_iter().collect())
        .collect()
}

/// Shuffles each user's ratings and deals them round-robin into `nb_folds` folds,
/// starting at a random fold per user.
pub fn per_user_split(store: &RatingStore, nb_folds: usize, rng: &mut ChaCha8Rng) -> Vec<RatingSubset> {
    let mut folds: Vec<RatingSubset> = (0..nb_folds).map(|_| RatingSubset::new()).collect();
    if nb_folds == 0 {
        return folds;
    }
    for bucket in store.ratings_by_user().values() {
        let mut ratings: Vec<Rating> = bucket.iter().copied().collect();
        ratings.shuffle(rng);
        let offset = rng.gen_range(0..nb_folds);
        for (fold, bin) in folds.iter_mut().zip(utils::deal_round_robin(ratings, nb_folds, offset)) {
            fold.extend(bin);
        }
    }
    folds
}

/// Holds out the newest ratings of every user.
///
/// Yields two folds: the test set (fold 0) and the training set (fold 1).
#[derive(Debug, Clone)]
pub struct TimeBasedSplitter {
    pub test_percentage: f64,
}

impl TimeBasedSplitter {
    pub fn new(test_percentage: f64) -> TimeBasedSplitter {
        TimeBasedSplitter { test_percentage }
    }

    /// Number of a user's ratings held out for testing.
    pub fn test_count(&self, user_ratings: usize) -> usize {
        ((user_ratings as f64 * self.test_percentage / 100.0).ceil() as usize).min(user_ratings)
    }
}

impl DataSplitter for TimeBasedSplitter {
    fn split_data(&mut self, store: &RatingStore, _rng: &mut ChaCha8Rng) -> Result<Vec<RatingSubset>, EvalError> {
        let timestamps = store.timestamps().ok_or(EvalError::MissingTimestamps)?;
        let mut test = RatingSubset::new();
        let mut training = RatingSubset::new();
        let mut undated = 0;

        for bucket in store.ratings_by_user().values() {
            let mut dated: Vec<(i64, Rating)> = bucket.iter()
                .map(|r| {
                    let ts = timestamps.get(&r.id()).copied().unwrap_or_else(|| {
                        undated += 1;
                        i64::MIN
                    });
                    (ts, *r)
                })
                .collect();
            // newest first, ties by item
            dated.sort_by_key(|(ts, r)| (Reverse(*ts), r.item));

            let n_test = self.test_count(dated.len());
            for (position, (_, r)) in dated.into_iter().enumerate() {
                if position < n_test { test.insert(r); } else { training.insert(r); }
            }
        }

        if undated > 0 {
            warn!("{} ratings carry no timestamp and are treated as the oldest", undated);
        }
        info!("Time-based split: {} test ratings, {} training ratings", test.len(), training.len());
        Ok(vec![test, training])
    }

    fn nb_folds(&self) -> usize {
        2
    }

    fn given_training_test(&self) -> bool {
        true
    }

    fn name(&self) -> String {
        format!("time-based split ({}% newest per user)", self.test_percentage)
    }
}

/// Builds the splitter selected by the configuration.
pub fn build_splitter(param: &Param) -> Result<Box<dyn DataSplitter>, EvalError> {
    match param.split.method {
        SplitMethod::random => Ok(Box::new(DefaultSplitter::new(
            param.split.nb_folds,
            param.split.global_random_split,
            param.min_ratings_constraint()?,
        ))),
        SplitMethod::time_based => Ok(Box::new(TimeBasedSplitter::new(param.split.test_percentage))),
    }
}

/// SHA-256 over the fold assignment of every rating, used to recognise identical partitions.
pub fn fold_fingerprint(folds: &[RatingSubset]) -> String {
    utils::fingerprint(
        folds.iter()
            .enumerate()
            .flat_map(|(i, fold)| fold.iter().map(move |r| format!("{} {} {}", i, r.user, r.item))),
    )
}
