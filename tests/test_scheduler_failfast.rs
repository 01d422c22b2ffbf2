/// Integration tests of the run-level error handling with custom plug-ins
///
/// A recommender that fails to initialize must abort the whole run before
/// the remaining queued experiments execute, and no partial results are returned.
///
/// Run with: cargo test --test test_scheduler_failfast -- --nocapture
use recoxval::data::{ItemId, RatingStore, UserId};
use recoxval::error::EvalError;
use recoxval::metrics::MetricRegistry;
use recoxval::param::{Param, PluginSpec};
use recoxval::recommender::{InitError, Prediction, Recommender, RecommenderRegistry};
use recoxval::run_with_registries;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

static COUNTED_INITS: AtomicUsize = AtomicUsize::new(0);
static SLOW_FAILURE_SEEN: AtomicBool = AtomicBool::new(false);
static INITS_AFTER_FAILURE: AtomicUsize = AtomicUsize::new(0);

struct NeverConverges;

impl Recommender for NeverConverges {
    fn init(&mut self, _training: &Arc<RatingStore>) -> Result<(), InitError> {
        Err("model did not converge".into())
    }
    fn predict_rating(&self, _user: UserId, _item: ItemId) -> Prediction {
        None
    }
    fn recommend_items(&self, _user: UserId) -> Vec<ItemId> {
        Vec::new()
    }
}

struct Counted;

impl Recommender for Counted {
    fn init(&mut self, _training: &Arc<RatingStore>) -> Result<(), InitError> {
        COUNTED_INITS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn predict_rating(&self, _user: UserId, _item: ItemId) -> Prediction {
        Some(3.0)
    }
    fn recommend_items(&self, _user: UserId) -> Vec<ItemId> {
        Vec::new()
    }
}

/// Fails a few milliseconds into its initialization.
struct FailsLater;

impl Recommender for FailsLater {
    fn init(&mut self, _training: &Arc<RatingStore>) -> Result<(), InitError> {
        thread::sleep(Duration::from_millis(5));
        SLOW_FAILURE_SEEN.store(true, Ordering::SeqCst);
        Err("lost the training set".into())
    }
    fn predict_rating(&self, _user: UserId, _item: ItemId) -> Prediction {
        None
    }
    fn recommend_items(&self, _user: UserId) -> Vec<ItemId> {
        Vec::new()
    }
    fn duration_estimate(&self) -> u8 {
        0
    }
}

/// Takes longer to initialize than `FailsLater` and records whether it started after the failure.
struct Watcher;

impl Recommender for Watcher {
    fn init(&mut self, _training: &Arc<RatingStore>) -> Result<(), InitError> {
        if SLOW_FAILURE_SEEN.load(Ordering::SeqCst) {
            INITS_AFTER_FAILURE.fetch_add(1, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_millis(40));
        Ok(())
    }
    fn predict_rating(&self, _user: UserId, _item: ItemId) -> Prediction {
        Some(3.0)
    }
    fn recommend_items(&self, _user: UserId) -> Vec<ItemId> {
        Vec::new()
    }
}

fn registry() -> RecommenderRegistry {
    let mut registry = RecommenderRegistry::with_builtins();
    registry.register("NeverConverges", |_, _| Ok(Box::new(NeverConverges))).unwrap();
    registry.register("Counted", |_, _| Ok(Box::new(Counted))).unwrap();
    registry.register("FailsLater", |_, _| Ok(Box::new(FailsLater))).unwrap();
    registry.register("Watcher", |_, _| Ok(Box::new(Watcher))).unwrap();
    registry
}

fn store() -> RatingStore {
    let mut store = RatingStore::with_bounds(1, 5);
    for u in 1..=4u32 {
        for i in 1..=5u32 {
            store.add_rating(u, i, (((u + i) % 5) + 1) as i8);
        }
    }
    store
}

fn params() -> Param {
    let mut param = Param::default();
    param.general.thread_number = 1;
    param.general.display_colorful = false;
    param.split.nb_folds = 3;
    param.metrics.push(PluginSpec::new("MAE"));
    param
}

#[test]
fn test_init_failure_aborts_before_other_units_run() {
    let mut param = params();
    // queued first and cheapest, so the single worker picks it up before anything else
    let mut failing = PluginSpec::new("NeverConverges");
    failing.duration_estimate = Some(0);
    param.algorithms.push(failing);
    param.algorithms.push(PluginSpec::new("Counted"));

    let outcome = run_with_registries(&store(), &param, &registry(), &MetricRegistry::with_builtins(), Arc::new(AtomicBool::new(true)));
    match outcome {
        Err(EvalError::Init { algorithm, round, reason }) => {
            assert_eq!(algorithm, "NeverConverges");
            assert_eq!(round, 1);
            assert!(reason.contains("converge"));
        }
        other => panic!("unexpected outcome {:?}", other.map(|e| e.results)),
    }
    assert_eq!(COUNTED_INITS.load(Ordering::SeqCst), 0);
}

#[test]
fn test_init_failure_stops_the_other_workers() {
    let mut param = params();
    param.general.thread_number = 2;
    param.general.max_validation_rounds = 1;
    param.algorithms.push(PluginSpec::new("FailsLater"));
    for id in 1..=4 {
        param.algorithms.push(PluginSpec::new("Watcher").with("id", id));
    }

    // one worker fails while the other is still initializing its first watcher
    let outcome = run_with_registries(&store(), &param, &registry(), &MetricRegistry::with_builtins(), Arc::new(AtomicBool::new(true)));
    match outcome {
        Err(EvalError::Init { algorithm, round, .. }) => {
            assert_eq!(algorithm, "FailsLater");
            assert_eq!(round, 1);
        }
        other => panic!("unexpected outcome {:?}", other.map(|e| e.results)),
    }
    assert!(SLOW_FAILURE_SEEN.load(Ordering::SeqCst));
    assert_eq!(INITS_AFTER_FAILURE.load(Ordering::SeqCst), 0);
}

#[test]
fn test_unknown_algorithm_is_a_configuration_error() {
    let mut param = params();
    param.algorithms.push(PluginSpec::new("MatrixFactorization"));
    let outcome = run_with_registries(&store(), &param, &registry(), &MetricRegistry::with_builtins(), Arc::new(AtomicBool::new(true)));
    match outcome {
        Err(e) => {
            assert!(e.is_configuration());
            assert!(e.to_string().contains("MatrixFactorization"));
        }
        Ok(_) => panic!("an unknown algorithm must abort the run"),
    }
}

#[test]
fn test_cleared_running_flag_interrupts_the_run() {
    let mut param = params();
    param.algorithms.push(PluginSpec::new("ConstantRating"));
    let outcome = run_with_registries(&store(), &param, &registry(), &MetricRegistry::with_builtins(), Arc::new(AtomicBool::new(false)));
    assert!(matches!(outcome, Err(EvalError::Interrupted)));
}

#[test]
fn test_empty_declarations_are_rejected() {
    let param = params();
    let outcome = run_with_registries(&store(), &param, &registry(), &MetricRegistry::with_builtins(), Arc::new(AtomicBool::new(true)));
    assert!(matches!(outcome, Err(EvalError::Config(_))));
}
