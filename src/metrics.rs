use crate::data::{ItemId, Rating, RatingStore, UserId};
use crate::error::EvalError;
use crate::param::{Param, PluginSpec};
use crate::recommender::Prediction;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stores a metric sees before its first input.
#[derive(Clone)]
pub struct MetricContext {
    pub training: Arc<RatingStore>,
    pub test: Arc<RatingStore>,
}

/// Consumes one `(rating, prediction)` pair per test rating.
pub trait PredictionMetric: Send {
    fn initialize(&mut self, _context: &MetricContext) {}

    /// `None` predictions must not count as errors.
    fn add_test_prediction(&mut self, rating: &Rating, prediction: Prediction);

    fn result(&self) -> f64;
}

/// Consumes one ranked list per test user.
pub trait ListMetric: Send {
    fn initialize(&mut self, context: &MetricContext);

    fn add_recommendations(&mut self, user: UserId, list: &[ItemId]);

    fn result(&self) -> f64;
}

pub enum Metric {
    Prediction(Box<dyn PredictionMetric>),
    List(Box<dyn ListMetric>),
}

impl Metric {
    pub fn result(&self) -> f64 {
        match self {
            Metric::Prediction(m) => m.result(),
            Metric::List(m) => m.result(),
        }
    }

    pub fn initialize(&mut self, context: &MetricContext) {
        match self {
            Metric::Prediction(m) => m.initialize(context),
            Metric::List(m) => m.initialize(context),
        }
    }
}

/// A metric instance together with the label its results are reported under.
pub struct NamedMetric {
    pub label: String,
    pub metric: Metric,
}

/// Decides whether a test rating counts as a hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelevanceRule {
    /// Absolute threshold, used when positive
    pub min_rating: f32,
    pub min_percentage_above_average: f64,
}

impl RelevanceRule {
    pub fn new(param: &Param) -> RelevanceRule {
        RelevanceRule {
            min_rating: param.relevance.min_rating_for_relevance,
            min_percentage_above_average: param.relevance.min_percentage_above_average,
        }
    }

    /// Relevance of `user`'s rating of `item` in `store`. Unrated items are never relevant.
    pub fn is_relevant(&self, store: &RatingStore, user: UserId, item: ItemId) -> bool {
        let Some(rating) = store.get_rating(user, item) else {
            return false;
        };
        if self.min_rating > 0.0 {
            return rating as f32 >= self.min_rating;
        }
        let Some(average) = store.user_average(user) else {
            return false;
        };
        let mut threshold = average as f64;
        if self.min_percentage_above_average > 0.0 {
            threshold += threshold * self.min_percentage_above_average / 100.0;
        }
        rating as f64 >= threshold
    }
}

pub type MetricFactory = fn(&PluginSpec, &Param) -> Result<Metric, EvalError>;

/// Maps metric identifiers to factories.
pub struct MetricRegistry {
    factories: BTreeMap<String, MetricFactory>,
}

impl MetricRegistry {
    pub fn new() -> MetricRegistry {
        MetricRegistry { factories: BTreeMap::new() }
    }

    pub fn with_builtins() -> MetricRegistry {
        let mut registry = MetricRegistry::new();
        let builtins: [(&str, MetricFactory); 7] = [
            ("MAE", Mae::create),
            ("RMSE", Rmse::create),
            ("PredictionCoverage", PredictionCoverage::create),
            ("Precision", PrecisionRecall::create_precision),
            ("Recall", PrecisionRecall::create_recall),
            ("NDCG", Ndcg::create),
            ("UserCoverage", UserCoverage::create),
        ];
        for (name, factory) in builtins {
            registry.factories.insert(name.to_string(), factory);
        }
        registry
    }

    pub fn register(&mut self, name: &str, factory: MetricFactory) -> Result<(), EvalError> {
        if self.factories.contains_key(name) {
            return Err(EvalError::Config(format!("metric {} is already registered", name)));
        }
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn create(&self, spec: &PluginSpec, param: &Param) -> Result<NamedMetric, EvalError> {
        let factory = self.factories.get(&spec.name).ok_or_else(|| {
            EvalError::Config(format!("unknown metric {} (known: {})", spec.name, self.names().join(", ")))
        })?;
        Ok(NamedMetric { label: spec.label(), metric: factory(spec, param)? })
    }

    /// Instantiates every declared metric, for one experiment unit.
    pub fn create_all(&self, specs: &[PluginSpec], param: &Param) -> Result<Vec<NamedMetric>, EvalError> {
        specs.iter().map(|spec| self.create(spec, param)).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        MetricRegistry::with_builtins()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoConfig {}

//-----------------------------------------------------------------------------
// Prediction metrics
//-----------------------------------------------------------------------------

/// Mean absolute error over the available predictions.
#[derive(Default)]
pub struct Mae {
    error_sum: f64,
    count: usize,
}

impl Mae {
    fn create(spec: &PluginSpec, _param: &Param) -> Result<Metric, EvalError> {
        let _: NoConfig = spec.config()?;
        Ok(Metric::Prediction(Box::new(Mae::default())))
    }
}

impl PredictionMetric for Mae {
    fn add_test_prediction(&mut self, rating: &Rating, prediction: Prediction) {
        if let Some(p) = prediction.filter(|p| !p.is_nan()) {
            self.error_sum += (rating.value as f64 - p as f64).abs();
            self.count += 1;
        }
    }

    fn result(&self) -> f64 {
        self.error_sum / self.count as f64
    }
}

/// Root mean squared error over the available predictions.
#[derive(Default)]
pub struct Rmse {
    squared_sum: f64,
    count: usize,
}

impl Rmse {
    fn create(spec: &PluginSpec, _param: &Param) -> Result<Metric, EvalError> {
        let _: NoConfig = spec.config()?;
        Ok(Metric::Prediction(Box::new(Rmse::default())))
    }
}

impl PredictionMetric for Rmse {
    fn add_test_prediction(&mut self, rating: &Rating, prediction: Prediction) {
        if let Some(p) = prediction.filter(|p| !p.is_nan()) {
            self.squared_sum += (rating.value as f64 - p as f64).powi(2);
            self.count += 1;
        }
    }

    fn result(&self) -> f64 {
        (self.squared_sum / self.count as f64).sqrt()
    }
}

/// Share of test ratings the recommender could score.
#[derive(Default)]
pub struct PredictionCoverage {
    predicted: usize,
    total: usize,
}

impl PredictionCoverage {
    fn create(spec: &PluginSpec, _param: &Param) -> Result<Metric, EvalError> {
        let _: NoConfig = spec.config()?;
        Ok(Metric::Prediction(Box::new(PredictionCoverage::default())))
    }
}

impl PredictionMetric for PredictionCoverage {
    fn add_test_prediction(&mut self, _rating: &Rating, prediction: Prediction) {
        self.total += 1;
        if prediction.is_some_and(|p| !p.is_nan()) {
            self.predicted += 1;
        }
    }

    fn result(&self) -> f64 {
        self.predicted as f64 / self.total as f64
    }
}

//-----------------------------------------------------------------------------
// List metrics
//-----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[allow(non_camel_case_types)]
pub enum TargetSet {
    /// Only items the user rated in the test set count as recommended
    allrelevantintestset,
    allintestset,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ListConfig {
    #[serde(default)]
    top_n: Option<usize>,
    #[serde(default = "target_set_default")]
    targetset: TargetSet,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct TopNConfig {
    #[serde(default)]
    top_n: Option<usize>,
}

fn target_set_default() -> TargetSet {
    TargetSet::allrelevantintestset
}

fn list_length(top_n: Option<usize>, param: &Param) -> Result<usize, EvalError> {
    match top_n {
        Some(0) => Err(EvalError::Config("topN must be at least 1".to_string())),
        Some(n) => Ok(n),
        None => Ok(param.relevance.top_n),
    }
}

/// Per-user mean of precision or recall at `top_n`.
pub struct PrecisionRecall {
    recall: bool,
    top_n: usize,
    target_set: TargetSet,
    relevance: RelevanceRule,
    test: Option<Arc<RatingStore>>,
    sum: f64,
    users: usize,
}

impl PrecisionRecall {
    fn build(spec: &PluginSpec, param: &Param, recall: bool) -> Result<Metric, EvalError> {
        let config: ListConfig = spec.config()?;
        Ok(Metric::List(Box::new(PrecisionRecall {
            recall,
            top_n: list_length(config.top_n, param)?,
            target_set: config.targetset,
            relevance: RelevanceRule::new(param),
            test: None,
            sum: 0.0,
            users: 0,
        })))
    }

    fn create_precision(spec: &PluginSpec, param: &Param) -> Result<Metric, EvalError> {
        PrecisionRecall::build(spec, param, false)
    }

    fn create_recall(spec: &PluginSpec, param: &Param) -> Result<Metric, EvalError> {
        PrecisionRecall::build(spec, param, true)
    }
}

impl ListMetric for PrecisionRecall {
    fn initialize(&mut self, context: &MetricContext) {
        self.test = Some(Arc::clone(&context.test));
    }

    fn add_recommendations(&mut self, user: UserId, list: &[ItemId]) {
        let Some(test) = self.test.as_ref() else {
            return;
        };
        if !self.recall && list.is_empty() {
            return;
        }
        let true_positives = test.ratings_of_user(user)
            .map_or(0, |ratings| ratings.iter().filter(|r| self.relevance.is_relevant(test, user, r.item)).count());
        if true_positives == 0 {
            return;
        }

        let mut hits = 0;
        let mut recommended = 0;
        for item in list {
            let rated = test.get_rating(user, *item).is_some();
            if self.target_set == TargetSet::allintestset || rated {
                recommended += 1;
                if self.relevance.is_relevant(test, user, *item) {
                    hits += 1;
                }
            }
            if recommended >= self.top_n {
                break;
            }
        }

        let value = if self.recall {
            hits as f64 / true_positives as f64
        } else {
            let divisor = recommended.min(self.top_n);
            if divisor == 0 { 0.0 } else { hits as f64 / divisor as f64 }
        };
        self.sum += value;
        self.users += 1;
    }

    fn result(&self) -> f64 {
        self.sum / self.users as f64
    }
}

/// Normalized discounted cumulative gain with exponential gain `2^rating`.
pub struct Ndcg {
    top_n: usize,
    test: Option<Arc<RatingStore>>,
    sum: f64,
    users: usize,
}

impl Ndcg {
    fn create(spec: &PluginSpec, param: &Param) -> Result<Metric, EvalError> {
        let config: TopNConfig = spec.config()?;
        Ok(Metric::List(Box::new(Ndcg { top_n: list_length(config.top_n, param)?, test: None, sum: 0.0, users: 0 })))
    }
}

fn discounted_gain(rating: i8, position: usize) -> f64 {
    2f64.powi(rating as i32) / (2.0 + position as f64).log2()
}

impl ListMetric for Ndcg {
    fn initialize(&mut self, context: &MetricContext) {
        self.test = Some(Arc::clone(&context.test));
    }

    fn add_recommendations(&mut self, user: UserId, list: &[ItemId]) {
        let Some(test) = self.test.as_ref() else {
            return;
        };
        let depth = self.top_n.min(list.len());

        // positions advance over rated items only
        let mut dcg = 0.0;
        let mut position = 0;
        for item in list {
            if position >= depth {
                break;
            }
            if let Some(rating) = test.get_rating(user, *item) {
                dcg += discounted_gain(rating, position);
                position += 1;
            }
        }

        let mut ideal: Vec<i8> = test.ratings_of_user(user)
            .map(|ratings| ratings.iter().map(|r| r.value).collect())
            .unwrap_or_default();
        ideal.sort_by(|a, b| b.cmp(a));
        let ideal_dcg: f64 = ideal.iter()
            .take(position)
            .enumerate()
            .map(|(i, rating)| discounted_gain(*rating, i))
            .sum();

        let ndcg = dcg / ideal_dcg;
        if !ndcg.is_nan() {
            self.sum += ndcg;
            self.users += 1;
        }
    }

    fn result(&self) -> f64 {
        self.sum / self.users as f64
    }
}

/// Share of test users that received a non-empty list.
#[derive(Default)]
pub struct UserCoverage {
    covered: usize,
    users: usize,
}

impl UserCoverage {
    fn create(spec: &PluginSpec, _param: &Param) -> Result<Metric, EvalError> {
        let _: NoConfig = spec.config()?;
        Ok(Metric::List(Box::new(UserCoverage::default())))
    }
}

impl ListMetric for UserCoverage {
    fn initialize(&mut self, _context: &MetricContext) {}

    fn add_recommendations(&mut self, _user: UserId, list: &[ItemId]) {
        self.users += 1;
        if !list.is_empty() {
            self.covered += 1;
        }
    }

    fn result(&self) -> f64 {
        self.covered as f64 / self.users as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(test: RatingStore) -> MetricContext {
        MetricContext { training: Arc::new(RatingStore::new()), test: Arc::new(test) }
    }

    fn metric(spec: PluginSpec, param: &Param, test: RatingStore) -> Metric {
        let mut named = MetricRegistry::with_builtins().create(&spec, param).unwrap();
        named.metric.initialize(&context(test));
        named.metric
    }

    fn feed_list(metric: &mut Metric, user: UserId, list: &[ItemId]) {
        match metric {
            Metric::List(m) => m.add_recommendations(user, list),
            Metric::Prediction(_) => panic!("expected a list metric"),
        }
    }

    fn feed_prediction(metric: &mut Metric, rating: Rating, prediction: Prediction) {
        match metric {
            Metric::Prediction(m) => m.add_test_prediction(&rating, prediction),
            Metric::List(_) => panic!("expected a prediction metric"),
        }
    }

    #[test]
    fn test_error_metrics_skip_unavailable_predictions() {
        let param = Param::test();
        let mut mae = metric(PluginSpec::new("MAE"), &param, RatingStore::new());
        let mut rmse = metric(PluginSpec::new("RMSE"), &param, RatingStore::new());
        let mut coverage = metric(PluginSpec::new("PredictionCoverage"), &param, RatingStore::new());
        for m in [&mut mae, &mut rmse, &mut coverage] {
            feed_prediction(m, Rating::new(1, 1, 5), Some(3.0));
            feed_prediction(m, Rating::new(1, 2, 1), Some(2.0));
            feed_prediction(m, Rating::new(1, 3, 4), None);
            feed_prediction(m, Rating::new(1, 4, 4), Some(f32::NAN));
        }
        assert_eq!(mae.result(), 1.5);
        assert_eq!(rmse.result(), 2.5f64.sqrt());
        assert_eq!(coverage.result(), 0.5);
    }

    #[test]
    fn test_no_input_gives_nan() {
        let mae = metric(PluginSpec::new("MAE"), &Param::test(), RatingStore::new());
        assert!(mae.result().is_nan());
    }

    fn test_store() -> RatingStore {
        // user 1 average 3.0: items 1 and 2 are relevant
        let mut store = RatingStore::new();
        store.add_rating(1, 1, 5);
        store.add_rating(1, 2, 4);
        store.add_rating(1, 3, 1);
        store.add_rating(1, 4, 2);
        store
    }

    #[test]
    fn test_relevance_rule() {
        let store = test_store();
        let mut param = Param::test();
        let by_average = RelevanceRule::new(&param);
        assert!(by_average.is_relevant(&store, 1, 1));
        assert!(!by_average.is_relevant(&store, 1, 4));
        assert!(!by_average.is_relevant(&store, 1, 99));

        param.relevance.min_percentage_above_average = 50.0;
        assert!(!RelevanceRule::new(&param).is_relevant(&store, 1, 2));

        param.relevance.min_rating_for_relevance = 2.0;
        assert!(RelevanceRule::new(&param).is_relevant(&store, 1, 4));
    }

    #[test]
    fn test_precision_on_rated_items_only() {
        let mut param = Param::test();
        param.relevance.top_n = 2;
        let mut precision = metric(PluginSpec::new("Precision"), &param, test_store());
        // unrated items 8 and 9 are skipped; counted are 3 (miss) and 1 (hit)
        feed_list(&mut precision, 1, &[8, 3, 9, 1, 2]);
        assert_eq!(precision.result(), 0.5);
    }

    #[test]
    fn test_precision_all_in_test_set_and_recall() {
        let mut param = Param::test();
        param.relevance.top_n = 4;
        let spec = PluginSpec::new("Precision").with("targetset", "allintestset");
        let mut precision = metric(spec, &param, test_store());
        feed_list(&mut precision, 1, &[8, 1, 9, 2]);
        assert_eq!(precision.result(), 0.5);

        let spec = PluginSpec::new("Recall").with("targetset", "allintestset").with("topN", 2);
        let mut recall = metric(spec, &param, test_store());
        feed_list(&mut recall, 1, &[1, 9, 2]);
        assert_eq!(recall.result(), 0.5);
    }

    #[test]
    fn test_precision_skips_unmeasurable_users() {
        let mut precision = metric(PluginSpec::new("Precision"), &Param::test(), test_store());
        feed_list(&mut precision, 1, &[]);
        feed_list(&mut precision, 77, &[1, 2]);
        assert!(precision.result().is_nan());
        feed_list(&mut precision, 1, &[1]);
        assert_eq!(precision.result(), 1.0);
    }

    #[test]
    fn test_ndcg() {
        let mut ndcg = metric(PluginSpec::new("NDCG"), &Param::test(), test_store());
        // ideal order gives 1.0
        feed_list(&mut ndcg, 1, &[1, 2, 4, 3]);
        assert!((ndcg.result() - 1.0).abs() < 1e-12);

        let mut reversed = metric(PluginSpec::new("NDCG"), &Param::test(), test_store());
        feed_list(&mut reversed, 1, &[3, 1]);
        let dcg = 2.0 + 32.0 / 3f64.log2();
        let ideal = 32.0 + 16.0 / 3f64.log2();
        assert!((reversed.result() - dcg / ideal).abs() < 1e-12);

        // a list with no rated items yields 0/0 and is skipped
        feed_list(&mut reversed, 1, &[50]);
        assert!((reversed.result() - dcg / ideal).abs() < 1e-12);
    }

    #[test]
    fn test_user_coverage() {
        let mut coverage = metric(PluginSpec::new("UserCoverage"), &Param::test(), test_store());
        feed_list(&mut coverage, 1, &[1]);
        feed_list(&mut coverage, 2, &[]);
        assert_eq!(coverage.result(), 0.5);
    }

    #[test]
    fn test_registry_rejects_unknown_and_misconfigured() {
        let registry = MetricRegistry::with_builtins();
        let param = Param::test();
        assert!(registry.create(&PluginSpec::new("Gini"), &param).is_err());
        assert!(registry.create(&PluginSpec::new("MAE").with("topN", 3), &param).is_err());
        assert!(registry.create(&PluginSpec::new("Precision").with("targetset", "positioninrandomset"), &param).is_err());
        assert!(registry.create(&PluginSpec::new("NDCG").with("topN", 0), &param).is_err());

        let named = registry.create(&PluginSpec::new("Recall").with("topN", 5), &param).unwrap();
        assert_eq!(named.label, "Recall(topN=5)");
        assert!(matches!(named.metric, Metric::List(_)));

        let expected: Vec<String> = crate::string_vec!["MAE", "NDCG", "Precision", "PredictionCoverage", "RMSE", "Recall", "UserCoverage"];
        assert_eq!(registry.names(), expected);

        let mut registry = MetricRegistry::new();
        registry.register("MAE", Mae::create).unwrap();
        assert!(registry.register("MAE", Mae::create).is_err());
    }
}
