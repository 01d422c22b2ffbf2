use crate::data::{ItemId, RatingStore, UserId};
use crate::error::EvalError;
use crate::param::{Param, PluginSpec};
use log::debug;
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

/// A predicted rating, `None` when the recommender cannot score the pair.
pub type Prediction = Option<f32>;

pub type InitError = Box<dyn Error + Send + Sync>;

/// A rating predictor and item ranker trained on one training store.
pub trait Recommender: Send {
    /// Builds the model. Called once, before any prediction.
    fn init(&mut self, training: &Arc<RatingStore>) -> Result<(), InitError>;

    fn predict_rating(&self, user: UserId, item: ItemId) -> Prediction;

    /// Items for `user`, best first. May be empty.
    fn recommend_items(&self, user: UserId) -> Vec<ItemId>;

    /// Relative cost hint for scheduling, lower runs first.
    fn duration_estimate(&self) -> u8 {
        5
    }
}

pub type RecommenderFactory = fn(&PluginSpec, &Param) -> Result<Box<dyn Recommender>, EvalError>;

/// Maps algorithm identifiers to factories.
pub struct RecommenderRegistry {
    factories: BTreeMap<String, RecommenderFactory>,
}

impl RecommenderRegistry {
    /// An empty registry.
    pub fn new() -> RecommenderRegistry {
        RecommenderRegistry { factories: BTreeMap::new() }
    }

    pub fn with_builtins() -> RecommenderRegistry {
        let mut registry = RecommenderRegistry::new();
        registry.factories.insert("PopularityAndAverage".to_string(), PopularityAndAverage::create);
        registry.factories.insert("ConstantRating".to_string(), ConstantRating::create);
        registry
    }

    pub fn register(&mut self, name: &str, factory: RecommenderFactory) -> Result<(), EvalError> {
        if self.factories.contains_key(name) {
            return Err(EvalError::Config(format!("algorithm {} is already registered", name)));
        }
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn create(&self, spec: &PluginSpec, param: &Param) -> Result<Box<dyn Recommender>, EvalError> {
        let factory = self.factories.get(&spec.name).ok_or_else(|| {
            EvalError::Config(format!(
                "unknown algorithm {} (known: {})",
                spec.name,
                self.names().join(", ")
            ))
        })?;
        factory(spec, param)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for RecommenderRegistry {
    fn default() -> Self {
        RecommenderRegistry::with_builtins()
    }
}

//-----------------------------------------------------------------------------
// Built-in baselines
//-----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct PopularityAndAverageConfig {
    #[serde(default)]
    user_average: bool,
    #[serde(default)]
    use_item_average_for_recommendation: bool,
    #[serde(default = "hide_known_items_default")]
    hide_known_items: bool,
}

fn hide_known_items_default() -> bool {
    true
}

/// Predicts item (or user) averages and recommends the most popular items.
pub struct PopularityAndAverage {
    user_average: bool,
    use_item_average_for_recommendation: bool,
    hide_known_items: bool,
    list_length: usize,
    training: Option<Arc<RatingStore>>,
    ranking: Vec<ItemId>,
}

impl PopularityAndAverage {
    fn create(spec: &PluginSpec, param: &Param) -> Result<Box<dyn Recommender>, EvalError> {
        let config: PopularityAndAverageConfig = spec.config()?;
        Ok(Box::new(PopularityAndAverage {
            user_average: config.user_average,
            use_item_average_for_recommendation: config.use_item_average_for_recommendation,
            hide_known_items: config.hide_known_items,
            list_length: param.relevance.top_n,
            training: None,
            ranking: Vec::new(),
        }))
    }
}

impl Recommender for PopularityAndAverage {
    fn init(&mut self, training: &Arc<RatingStore>) -> Result<(), InitError> {
        let mut scored: Vec<(ItemId, f64)> = training.items()
            .map(|item| {
                let score = if self.use_item_average_for_recommendation {
                    training.item_average(item).unwrap_or(0.0) as f64
                } else {
                    training.ratings_of_item(item).map_or(0, |r| r.len()) as f64
                };
                (item, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
        self.ranking = scored.into_iter().map(|(item, _)| item).collect();
        self.training = Some(Arc::clone(training));
        debug!("PopularityAndAverage ranked {} items", self.ranking.len());
        Ok(())
    }

    fn predict_rating(&self, user: UserId, item: ItemId) -> Prediction {
        let training = self.training.as_ref()?;
        let own = if self.user_average { training.user_average(user) } else { training.item_average(item) };
        own.or_else(|| training.global_average().map(|g| g as f32))
    }

    fn recommend_items(&self, user: UserId) -> Vec<ItemId> {
        let Some(training) = self.training.as_ref() else {
            return Vec::new();
        };
        self.ranking.iter()
            .copied()
            .filter(|item| !self.hide_known_items || training.get_rating(user, *item).is_none())
            .take(self.list_length)
            .collect()
    }

    fn duration_estimate(&self) -> u8 {
        1
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConstantRatingConfig {
    #[serde(default = "constant_default")]
    value: f32,
}

fn constant_default() -> f32 {
    3.0
}

/// Predicts the same value for every pair and recommends nothing.
pub struct ConstantRating {
    value: f32,
}

impl ConstantRating {
    pub fn new(value: f32) -> ConstantRating {
        ConstantRating { value }
    }

    fn create(spec: &PluginSpec, _param: &Param) -> Result<Box<dyn Recommender>, EvalError> {
        let config: ConstantRatingConfig = spec.config()?;
        Ok(Box::new(ConstantRating::new(config.value)))
    }
}

impl Recommender for ConstantRating {
    fn init(&mut self, _training: &Arc<RatingStore>) -> Result<(), InitError> {
        if self.value.is_finite() {
            Ok(())
        } else {
            Err(format!("constant prediction {} is not a finite number", self.value).into())
        }
    }

    fn predict_rating(&self, _user: UserId, _item: ItemId) -> Prediction {
        Some(self.value)
    }

    fn recommend_items(&self, _user: UserId) -> Vec<ItemId> {
        Vec::new()
    }

    fn duration_estimate(&self) -> u8 {
        1
    }
}
