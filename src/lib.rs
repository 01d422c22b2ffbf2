pub mod utils;
pub mod error;
pub mod data;
pub mod param;
pub mod loader;
pub mod split;
pub mod recommender;
pub mod metrics;
pub mod unit;
pub mod cv;
pub mod scheduler;
pub mod aggregate;
pub mod experiment;

use crate::aggregate::{aggregate, dispersion};
use crate::cv::CrossValidation;
use crate::data::RatingStore;
use crate::error::EvalError;
use crate::experiment::{DatasetSummary, Experiment};
use crate::loader::{DataLoader, DefaultDataLoader};
use crate::metrics::MetricRegistry;
use crate::param::Param;
use crate::recommender::RecommenderRegistry;
use crate::scheduler::Scheduler;
use crate::split::build_splitter;
use chrono::Local;
use log::debug;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Version string stored in experiments: crate version and short git revision.
pub fn recoxval_version() -> String {
    format!("{}#{}", env!("CARGO_PKG_VERSION"), option_env!("RECOXVAL_GIT_SHA").unwrap_or("unknown"))
}

/// Loads the ratings declared in `param` and evaluates every algorithm on them.
pub fn run(param: &Param, running: Arc<AtomicBool>) -> Result<Experiment, EvalError> {
    let mut rng = ChaCha8Rng::seed_from_u64(param.general.seed);
    let mut store = RatingStore::new();
    DefaultDataLoader::new(param).load_data(&mut store, &mut rng)?;
    cinfo!(param.general.display_colorful, "\x1b[2;97m{:?}\x1b[0m", store);

    run_with_rng(&store, param, &RecommenderRegistry::with_builtins(), &MetricRegistry::with_builtins(), running, &mut rng)
}

/// Evaluates the built-in algorithms and metrics on an already loaded store.
pub fn run_on_store(store: &RatingStore, param: &Param, running: Arc<AtomicBool>) -> Result<Experiment, EvalError> {
    run_with_registries(store, param, &RecommenderRegistry::with_builtins(), &MetricRegistry::with_builtins(), running)
}

/// Evaluates on `store` with caller-supplied plug-in registries.
pub fn run_with_registries(
    store: &RatingStore,
    param: &Param,
    recommenders: &RecommenderRegistry,
    metrics: &MetricRegistry,
    running: Arc<AtomicBool>,
) -> Result<Experiment, EvalError> {
    let mut rng = ChaCha8Rng::seed_from_u64(param.general.seed);
    run_with_rng(store, param, recommenders, metrics, running, &mut rng)
}

fn run_with_rng(
    store: &RatingStore,
    param: &Param,
    recommenders: &RecommenderRegistry,
    metrics: &MetricRegistry,
    running: Arc<AtomicBool>,
    rng: &mut ChaCha8Rng,
) -> Result<Experiment, EvalError> {
    let start = std::time::Instant::now();
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();

    if param.algorithms.is_empty() {
        return Err(EvalError::Config("no algorithm declared".to_string()));
    }
    if param.metrics.is_empty() {
        return Err(EvalError::Config("no metric declared".to_string()));
    }

    // A store built without rating bounds takes the configured ones
    let bounded;
    let store = if store.min_rating() == 0 && store.max_rating() == 0 {
        debug!("Store has no rating bounds, using [{}, {}]", param.data.min_rating, param.data.max_rating);
        let mut copy = store.clone();
        copy.set_rating_bounds(param.data.min_rating, param.data.max_rating);
        bounded = copy;
        &bounded
    } else {
        store
    };

    // Split
    let mut splitter = build_splitter(param)?;
    let cv = CrossValidation::new(store, splitter.as_mut(), rng)?;
    let fold_fingerprint = cv.fingerprint();
    debug!("Fold fingerprint {}", fold_fingerprint);

    // Evaluate
    cinfo!(param.general.display_colorful, "Evaluating {} algorithms\n-----------------------------------------------------", param.algorithms.len());
    let mut scheduler = Scheduler::new(param, recommenders, metrics, running);
    let round_results = scheduler.run(store, &cv, rng)?;

    // Aggregate
    let results = aggregate(&round_results)?;
    let dispersion = dispersion(&round_results);

    let name = param.general.save_exp.split('.').next().filter(|s| !s.is_empty()).unwrap_or("recoxval");
    Ok(Experiment {
        id: format!("{}_{}", name, timestamp),
        timestamp,
        recoxval_version: recoxval_version(),
        parameters: param.clone(),
        dataset: DatasetSummary::new(store),
        splitter: cv.splitter_name.clone(),
        fold_fingerprint,
        rounds: round_results.len(),
        round_results,
        results,
        dispersion,
        execution_time: start.elapsed().as_secs_f64(),
    })
}
