use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};
use log::debug;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

pub type UserId = u32;
pub type ItemId = u32;

/// Extra-information key under which loaders store per-rating timestamps.
pub const TIMESTAMPS_KEY: &str = "RatingTimeStamps";

/// Upper bound on condensing passes (users then items) before giving up.
pub const MAX_CONDENSE_ITERATIONS: usize = 100;

/// A single rating.
///
/// Identity is the `(user, item)` pair only: two ratings that differ only by value are
/// equal, hash identically and order identically. Storing a rating whose key is already
/// present therefore replaces the previous value (last write wins).
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Rating {
    pub user: UserId,
    pub item: ItemId,
    pub value: i8,
}

impl Rating {
    pub fn new(user: UserId, item: ItemId, value: i8) -> Rating {
        Rating { user, item, value }
    }

    /// A value-less rating usable as a lookup key in rating sets.
    pub fn key(user: UserId, item: ItemId) -> Rating {
        Rating { user, item, value: 0 }
    }

    pub fn id(&self) -> (UserId, ItemId) {
        (self.user, self.item)
    }
}

impl PartialEq for Rating {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Rating {}

impl Hash for Rating {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl PartialOrd for Rating {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rating {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id().cmp(&other.id())
    }
}

impl fmt::Debug for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Rating: u: {} i: {} v: {}]", self.user, self.item, self.value)
    }
}

/// An ordered set of ratings, e.g. one fold.
pub type RatingSubset = BTreeSet<Rating>;

/// Loader-specific metadata attached to a store.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtraInfo {
    /// Unix timestamp of each rating, keyed by `(user, item)`.
    Timestamps(HashMap<(UserId, ItemId), i64>),
    Text(String),
}

/// In-memory rating store with per-user and per-item indices.
///
/// Users and items are exactly the ids present in at least one rating: they are the
/// keys of the two indices. Averages are computed lazily; every mutation resets the
/// cached maps, so the next accessor call recomputes them.
#[derive(Clone, Default)]
pub struct RatingStore {
    ratings: RatingSubset,
    ratings_by_user: BTreeMap<UserId, RatingSubset>,
    ratings_by_item: BTreeMap<ItemId, RatingSubset>,
    implicit_ratings: RatingSubset,
    // Cloning a store copies the map but shares the values
    extra_info: HashMap<String, Arc<ExtraInfo>>,
    user_averages: OnceLock<HashMap<UserId, f32>>,
    item_averages: OnceLock<HashMap<ItemId, f32>>,
    min_rating: i8,
    max_rating: i8,
}

impl RatingStore {
    pub fn new() -> RatingStore {
        RatingStore::default()
    }

    pub fn with_bounds(min_rating: i8, max_rating: i8) -> RatingStore {
        RatingStore { min_rating, max_rating, ..RatingStore::default() }
    }

    /// Builds a store holding exactly `ratings`, with the bounds and extra information of `self`.
    pub fn subset<'a, I>(&self, ratings: I) -> RatingStore
        where I: IntoIterator<Item = &'a Rating>
    {
        let mut store = RatingStore::with_bounds(self.min_rating, self.max_rating);
        store.extra_info = self.extra_info.clone();
        for r in ratings {
            store.insert(*r);
        }
        store
    }

    /// Copies the store and removes the given ratings from the copy.
    pub fn copy_and_remove_ratings<'a, I>(&self, to_remove: I) -> RatingStore
        where I: IntoIterator<Item = &'a Rating>
    {
        let mut copy = self.clone();
        for r in to_remove {
            copy.remove_rating(r);
        }
        copy
    }

    fn mark_dirty(&mut self) {
        self.user_averages = OnceLock::new();
        self.item_averages = OnceLock::new();
    }

    fn insert(&mut self, rating: Rating) -> Rating {
        self.ratings.replace(rating);
        self.ratings_by_user.entry(rating.user).or_default().replace(rating);
        self.ratings_by_item.entry(rating.item).or_default().replace(rating);
        self.mark_dirty();
        rating
    }

    /// Stores a rating, replacing any previous value for the same user and item.
    pub fn add_rating(&mut self, user: UserId, item: ItemId, value: i8) -> Rating {
        self.insert(Rating::new(user, item, value))
    }

    pub fn add(&mut self, rating: Rating) -> Rating {
        self.insert(rating)
    }

    pub fn add_implicit_rating(&mut self, rating: Rating) {
        self.implicit_ratings.replace(rating);
    }

    /// Removes a rating (matched by user and item). Returns false if it was absent.
    pub fn remove_rating(&mut self, rating: &Rating) -> bool {
        if !self.ratings.remove(rating) {
            return false;
        }
        if let Some(bucket) = self.ratings_by_user.get_mut(&rating.user) {
            bucket.remove(rating);
            if bucket.is_empty() {
                self.ratings_by_user.remove(&rating.user);
            }
        }
        if let Some(bucket) = self.ratings_by_item.get_mut(&rating.item) {
            bucket.remove(rating);
            if bucket.is_empty() {
                self.ratings_by_item.remove(&rating.item);
            }
        }
        self.mark_dirty();
        true
    }

    /// Removes a user with all of their ratings and returns how many ratings went away.
    pub fn remove_user_and_ratings(&mut self, user: UserId) -> usize {
        let Some(bucket) = self.ratings_by_user.remove(&user) else {
            return 0;
        };
        for r in &bucket {
            self.ratings.remove(r);
            if let Some(item_bucket) = self.ratings_by_item.get_mut(&r.item) {
                item_bucket.remove(r);
                if item_bucket.is_empty() {
                    self.ratings_by_item.remove(&r.item);
                }
            }
        }
        self.mark_dirty();
        bucket.len()
    }

    pub fn get_rating(&self, user: UserId, item: ItemId) -> Option<i8> {
        self.ratings_by_user
            .get(&user)
            .and_then(|bucket| bucket.get(&Rating::key(user, item)))
            .map(|r| r.value)
    }

    pub fn ratings(&self) -> &RatingSubset {
        &self.ratings
    }

    pub fn implicit_ratings(&self) -> &RatingSubset {
        &self.implicit_ratings
    }

    pub fn ratings_of_user(&self, user: UserId) -> Option<&RatingSubset> {
        self.ratings_by_user.get(&user)
    }

    pub fn ratings_of_item(&self, item: ItemId) -> Option<&RatingSubset> {
        self.ratings_by_item.get(&item)
    }

    pub fn ratings_by_user(&self) -> &BTreeMap<UserId, RatingSubset> {
        &self.ratings_by_user
    }

    pub fn users(&self) -> impl Iterator<Item = UserId> + '_ {
        self.ratings_by_user.keys().copied()
    }

    pub fn items(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.ratings_by_item.keys().copied()
    }

    pub fn contains_user(&self, user: UserId) -> bool {
        self.ratings_by_user.contains_key(&user)
    }

    pub fn user_count(&self) -> usize {
        self.ratings_by_user.len()
    }

    pub fn item_count(&self) -> usize {
        self.ratings_by_item.len()
    }

    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }

    /// Average rating of every user, recomputed on first access after a mutation.
    pub fn user_averages(&self) -> &HashMap<UserId, f32> {
        self.user_averages.get_or_init(|| averages_of(&self.ratings_by_user))
    }

    pub fn item_averages(&self) -> &HashMap<ItemId, f32> {
        self.item_averages.get_or_init(|| averages_of(&self.ratings_by_item))
    }

    pub fn user_average(&self, user: UserId) -> Option<f32> {
        self.user_averages().get(&user).copied()
    }

    pub fn item_average(&self, item: ItemId) -> Option<f32> {
        self.item_averages().get(&item).copied()
    }

    /// Eagerly recomputes the cached averages after a batch of mutations.
    pub fn recalculate_averages(&mut self) {
        self.mark_dirty();
        let _ = self.user_averages();
        let _ = self.item_averages();
    }

    pub fn global_average(&self) -> Option<f64> {
        if self.ratings.is_empty() {
            return None;
        }
        let total: i64 = self.ratings.iter().map(|r| r.value as i64).sum();
        Some(total as f64 / self.ratings.len() as f64)
    }

    pub fn extra_information(&self, key: &str) -> Option<&Arc<ExtraInfo>> {
        self.extra_info.get(key)
    }

    pub fn add_extra_information(&mut self, key: &str, info: ExtraInfo) {
        self.extra_info.insert(key.to_string(), Arc::new(info));
    }

    /// Timestamps registered by a loader, if any.
    pub fn timestamps(&self) -> Option<&HashMap<(UserId, ItemId), i64>> {
        match self.extra_info.get(TIMESTAMPS_KEY).map(|info| info.as_ref()) {
            Some(ExtraInfo::Timestamps(map)) => Some(map),
            _ => None,
        }
    }

    pub fn min_rating(&self) -> i8 {
        self.min_rating
    }

    pub fn max_rating(&self) -> i8 {
        self.max_rating
    }

    pub fn set_rating_bounds(&mut self, min_rating: i8, max_rating: i8) {
        self.min_rating = min_rating;
        self.max_rating = max_rating;
    }

    pub fn density(&self) -> f64 {
        let cells = self.user_count() as f64 * self.item_count() as f64;
        if cells == 0.0 { 0.0 } else { self.len() as f64 / cells }
    }

    //-----------------------------------------------------------------------------
    // Bulk transforms
    //-----------------------------------------------------------------------------

    /// Removes every user with fewer than `min_per_user` ratings. Returns the number of removed users.
    pub fn remove_sparse_users(&mut self, min_per_user: usize) -> usize {
        let sparse: Vec<UserId> = self.ratings_by_user.iter()
            .filter(|(_, bucket)| bucket.len() < min_per_user)
            .map(|(user, _)| *user)
            .collect();
        for user in &sparse {
            self.remove_user_and_ratings(*user);
        }
        sparse.len()
    }

    /// Removes every item with fewer than `min_per_item` ratings. Returns the number of removed items.
    pub fn remove_sparse_items(&mut self, min_per_item: usize) -> usize {
        let sparse: Vec<ItemId> = self.ratings_by_item.iter()
            .filter(|(_, bucket)| bucket.len() < min_per_item)
            .map(|(item, _)| *item)
            .collect();
        for item in &sparse {
            if let Some(bucket) = self.ratings_by_item.get(item).cloned() {
                for r in &bucket {
                    self.remove_rating(r);
                }
            }
        }
        sparse.len()
    }

    pub fn constraints_hold(&self, min_per_user: usize, min_per_item: usize) -> bool {
        self.ratings_by_user.values().all(|bucket| bucket.len() >= min_per_user)
            && self.ratings_by_item.values().all(|bucket| bucket.len() >= min_per_item)
    }

    /// Alternately drops sparse users and sparse items until both thresholds hold or
    /// `MAX_CONDENSE_ITERATIONS` passes were made. Returns the number of passes.
    pub fn condense(&mut self, min_per_user: usize, min_per_item: usize) -> usize {
        let mut passes = 0;
        loop {
            passes += 1;
            let users = self.remove_sparse_users(min_per_user);
            let items = self.remove_sparse_items(min_per_item);
            debug!("Condensing pass {}: removed {} users and {} items, {} ratings remain", passes, users, items, self.len());
            if self.constraints_hold(min_per_user, min_per_item) || passes >= MAX_CONDENSE_ITERATIONS {
                break;
            }
        }
        passes
    }

    /// Keeps `n` randomly chosen users and drops the others.
    pub fn sample_users(&mut self, n: usize, rng: &mut ChaCha8Rng) {
        if n >= self.user_count() {
            return;
        }
        let mut users: Vec<UserId> = self.users().collect();
        users.shuffle(rng);
        for user in users.into_iter().skip(n) {
            self.remove_user_and_ratings(user);
        }
        debug!("Retaining {} sampled users and {} ratings", self.user_count(), self.len());
    }

    /// Randomly drops ratings so that a `density` fraction of them remains.
    pub fn reduce_density(&mut self, density: f64, rng: &mut ChaCha8Rng) {
        let keep = (self.len() as f64 * density) as usize;
        let to_remove = self.len().saturating_sub(keep);
        let mut ratings: Vec<Rating> = self.ratings.iter().copied().collect();
        ratings.shuffle(rng);
        for r in ratings.iter().take(to_remove) {
            self.remove_rating(r);
        }
        debug!("Density reduced to {:.3}: {} ratings remain", density, self.len());
    }

    /// Turns ratings into positive feedback: values at or above `level` become 1, the
    /// others are dropped (`unary`) or set to 0.
    pub fn binarize(&mut self, level: i8, unary: bool) {
        let snapshot: Vec<Rating> = self.ratings.iter().copied().collect();
        for r in snapshot {
            if r.value >= level {
                self.insert(Rating::new(r.user, r.item, 1));
            } else if unary {
                self.remove_rating(&r);
            } else {
                self.insert(Rating::new(r.user, r.item, 0));
            }
        }
        self.recalculate_averages();
    }
}

fn averages_of<K: Copy + std::hash::Hash + Eq + Ord>(index: &BTreeMap<K, RatingSubset>) -> HashMap<K, f32> {
    index.iter()
        .map(|(key, bucket)| {
            let sum: i64 = bucket.iter().map(|r| r.value as i64).sum();
            (*key, sum as f32 / bucket.len() as f32)
        })
        .collect()
}

impl fmt::Display for RatingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Users:   {}", self.user_count())?;
        writeln!(f, "Items:   {}", self.item_count())?;
        writeln!(f, "Ratings: {}", self.len())?;
        writeln!(f, "Density: {:.5}", self.density())?;
        write!(f, "Scale:   [{}, {}]", self.min_rating, self.max_rating)
    }
}

impl fmt::Debug for RatingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}
