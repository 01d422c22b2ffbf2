use crate::aggregate::EvaluationResult;
use crate::cinfo;
use crate::cv::CrossValidation;
use crate::data::RatingStore;
use crate::error::EvalError;
use crate::metrics::MetricRegistry;
use crate::param::Param;
use crate::recommender::{Recommender, RecommenderRegistry};
use crate::unit::{ExperimentUnit, UnitLimits};
use log::{debug, error, info, warn};
use rand_chacha::ChaCha8Rng;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{self, AtomicBool};
use std::sync::mpsc::{self, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lifecycle of one cross-validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    RoundsPlanned,
    Dispatching,
    Draining,
    Done,
}

//-----------------------------------------------------------------------------
// Work queue
//-----------------------------------------------------------------------------

struct QueuedUnit {
    cost: u8,
    seq: u64,
    unit: ExperimentUnit,
}

// BinaryHeap pops the greatest element: cheapest first, then oldest
impl Ord for QueuedUnit {
    fn cmp(&self, other: &Self) -> Ordering {
        other.cost.cmp(&self.cost).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedUnit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedUnit {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.seq == other.seq
    }
}

impl Eq for QueuedUnit {}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedUnit>,
    closed: bool,
    next_seq: u64,
}

pub enum Pop {
    Unit(ExperimentUnit),
    /// Nothing arrived before the timeout
    Empty,
    /// Closed and drained: no unit will ever arrive
    Closed,
}

/// Priority work queue shared by the coordinator and the workers.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl WorkQueue {
    pub fn new() -> WorkQueue {
        WorkQueue::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `unit`. Once the queue is closed units are dropped; returns whether it was queued.
    pub fn push(&self, unit: ExperimentUnit) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(QueuedUnit { cost: unit.cost, seq, unit });
        self.available.notify_one();
        true
    }

    /// Waits up to `timeout` for a unit.
    pub fn pop(&self, timeout: Duration) -> Pop {
        let mut state = self.lock();
        if state.heap.is_empty() && !state.closed {
            state = self.available
                .wait_timeout_while(state, timeout, |s| s.heap.is_empty() && !s.closed)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        match state.heap.pop() {
            Some(queued) => Pop::Unit(queued.unit),
            None if state.closed => Pop::Closed,
            None => Pop::Empty,
        }
    }

    /// No more units will be pushed; workers exit once the queue is drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    /// Drops every pending unit and closes the queue. Returns the number of dropped units.
    pub fn abort(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.heap.len();
        state.heap.clear();
        state.closed = true;
        self.available.notify_all();
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//-----------------------------------------------------------------------------
// Workers
//-----------------------------------------------------------------------------

/// Messages from workers to the coordinator.
pub enum WorkerEvent {
    Results { round: usize, results: Vec<EvaluationResult> },
    Fatal(EvalError),
    Finished { worker: usize },
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

/// Initializes and executes one unit, turning panics into execution errors.
pub fn run_unit(mut unit: ExperimentUnit) -> Result<Vec<EvaluationResult>, EvalError> {
    let algorithm = unit.algorithm.clone();
    let round = unit.round;
    catch_unwind(AssertUnwindSafe(move || {
        unit.initialize()?;
        Ok(unit.execute())
    }))
    .unwrap_or_else(|payload| Err(EvalError::Execution { algorithm, round, reason: panic_message(&payload) }))
}

fn worker_loop(worker: usize, queue: &WorkQueue, events: Sender<WorkerEvent>, running: &AtomicBool, poll: Duration) {
    while running.load(atomic::Ordering::Relaxed) {
        let unit = match queue.pop(poll) {
            Pop::Unit(unit) => unit,
            Pop::Empty => continue,
            Pop::Closed => break,
        };
        let (round, algorithm) = (unit.round, unit.algorithm.clone());
        debug!("Worker {} runs {} (round {})", worker, algorithm, round);

        let event = match run_unit(unit) {
            Ok(results) => WorkerEvent::Results { round, results },
            Err(e) => {
                error!("Worker {}: {}", worker, e);
                // the other workers must not take another unit
                let dropped = queue.abort();
                debug!("Worker {} dropped {} queued units", worker, dropped);
                let _ = events.send(WorkerEvent::Fatal(e));
                break;
            }
        };
        if events.send(event).is_err() {
            break;
        }
    }
    let _ = events.send(WorkerEvent::Finished { worker });
}

//-----------------------------------------------------------------------------
// Coordinator
//-----------------------------------------------------------------------------

struct AlgorithmInstance {
    label: String,
    cost: u8,
    recommender: Box<dyn Recommender>,
}

/// Fans (algorithm x round) units out to a fixed worker pool and collects their results.
pub struct Scheduler<'a> {
    param: &'a Param,
    recommenders: &'a RecommenderRegistry,
    metrics: &'a MetricRegistry,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    state: SchedulerState,
}

impl<'a> Scheduler<'a> {
    pub fn new(param: &'a Param, recommenders: &'a RecommenderRegistry, metrics: &'a MetricRegistry, running: Arc<AtomicBool>) -> Scheduler<'a> {
        Scheduler {
            param,
            recommenders,
            metrics,
            running,
            poll_interval: Duration::from_millis(250),
            state: SchedulerState::Idle,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Scheduler<'a> {
        self.poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Number of workers: one per declared algorithm, at most `thread_number`.
    pub fn worker_count(&self) -> usize {
        self.param.algorithms.len().min(self.param.general.thread_number).max(1)
    }

    /// One instance per (round, algorithm), created before any unit runs so that
    /// configuration errors surface first.
    fn instantiate_algorithms(&self, rounds: usize) -> Result<VecDeque<AlgorithmInstance>, EvalError> {
        let mut pool = VecDeque::with_capacity(rounds * self.param.algorithms.len());
        for _ in 0..rounds {
            for spec in &self.param.algorithms {
                let recommender = self.recommenders.create(spec, self.param)?;
                let cost = spec.duration_estimate.unwrap_or_else(|| recommender.duration_estimate());
                pool.push_back(AlgorithmInstance { label: spec.label(), cost, recommender });
            }
        }
        Ok(pool)
    }

    fn limits(&self, store: &RatingStore) -> UnitLimits {
        UnitLimits {
            min_rating: store.min_rating(),
            max_rating: store.max_rating(),
            max_rating_predictions: self.param.general.max_rating_predictions,
            max_recommendations: self.param.general.max_recommendations,
        }
    }

    /// Runs every round and returns the results keyed by round (1-based).
    ///
    /// The first fatal error aborts the run: pending units are dropped and the error is
    /// returned without partial results. A cleared `running` flag yields `Interrupted`.
    pub fn run(&mut self, store: &RatingStore, cv: &CrossValidation, rng: &mut ChaCha8Rng) -> Result<BTreeMap<usize, Vec<EvaluationResult>>, EvalError> {
        let start = Instant::now();
        let rounds = cv.round_count(self.param);
        if rounds == 0 {
            return Err(EvalError::Config("the split produced no test set".to_string()));
        }

        let mut algorithms = self.instantiate_algorithms(rounds)?;
        // a metric that cannot be built must fail before any round starts
        self.metrics.create_all(&self.param.metrics, self.param)?;
        let given_n = self.param.given_n()?;
        let limits = self.limits(store);
        let expected_units = algorithms.len();
        let workers = self.worker_count();

        self.state = SchedulerState::RoundsPlanned;
        info!(
            "Planned {} rounds x {} algorithms = {} units on {} workers",
            rounds, self.param.algorithms.len(), expected_units, workers
        );

        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("recoxval-worker-{}", i))
            .build()
            .map_err(|e| EvalError::Config(format!("cannot start the worker pool: {}", e)))?;

        let queue = WorkQueue::new();
        let (tx, rx) = mpsc::channel::<WorkerEvent>();
        let mut per_round: BTreeMap<usize, Vec<EvaluationResult>> = (1..=rounds).map(|r| (r, Vec::new())).collect();
        let mut fatal: Option<EvalError> = None;
        let mut completed = 0;
        let poll = self.poll_interval;
        let colorful = self.param.general.display_colorful;

        let mut handle_event = |event: WorkerEvent, fatal: &mut Option<EvalError>, queue: &WorkQueue| match event {
            WorkerEvent::Results { round, results } => {
                completed += 1;
                cinfo!(colorful, "\x1b[1;93mUnit done\x1b[0m | round {} | {} results | {}/{} units", round, results.len(), completed, expected_units);
                per_round.entry(round).or_default().extend(results);
            }
            WorkerEvent::Fatal(e) => {
                let dropped = queue.abort();
                if dropped > 0 {
                    warn!("Aborting run: {} queued units dropped", dropped);
                }
                fatal.get_or_insert(e);
            }
            WorkerEvent::Finished { worker } => debug!("Worker {} stopped", worker),
        };

        let running = Arc::clone(&self.running);
        let state = &mut self.state;
        thread_pool.in_place_scope(|scope| {
            for worker in 0..workers {
                let (queue, events, running) = (&queue, tx.clone(), &running);
                scope.spawn(move |_| worker_loop(worker, queue, events, running, poll));
            }
            drop(tx);

            *state = SchedulerState::Dispatching;
            for index in 0..rounds {
                loop {
                    match rx.try_recv() {
                        Ok(event) => handle_event(event, &mut fatal, &queue),
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                }
                if fatal.is_some() {
                    break;
                }
                if !running.load(atomic::Ordering::Relaxed) {
                    warn!("Stop requested: no further rounds are dispatched");
                    queue.abort();
                    break;
                }

                cinfo!(colorful, "\x1b[1;93mPreparing round #{}...\x1b[0m", index + 1);
                let round = match cv.build_round(store, index, given_n, rng) {
                    Ok(round) => round,
                    Err(e) => {
                        queue.abort();
                        fatal.get_or_insert(e);
                        break;
                    }
                };
                for _ in 0..self.param.algorithms.len() {
                    let Some(instance) = algorithms.pop_front() else { break };
                    let metrics = match self.metrics.create_all(&self.param.metrics, self.param) {
                        Ok(metrics) => metrics,
                        Err(e) => {
                            fatal.get_or_insert(e);
                            break;
                        }
                    };
                    let queued = queue.push(ExperimentUnit::new(
                        round.round,
                        instance.label,
                        instance.cost,
                        instance.recommender,
                        Arc::clone(&round.training),
                        round.test.clone(),
                        metrics,
                        round.focus_users.clone(),
                        limits,
                    ));
                    if !queued {
                        debug!("Queue closed while dispatching round {}", round.round);
                        break;
                    }
                }
                if fatal.is_some() {
                    queue.abort();
                    break;
                }
            }
            queue.close();

            *state = SchedulerState::Draining;
            loop {
                match rx.recv_timeout(poll) {
                    Ok(event) => handle_event(event, &mut fatal, &queue),
                    Err(RecvTimeoutError::Timeout) => {
                        if !running.load(atomic::Ordering::Relaxed) {
                            queue.abort();
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        self.state = SchedulerState::Done;

        if let Some(e) = fatal {
            return Err(e);
        }
        if completed < expected_units {
            warn!("Only {}/{} units completed", completed, expected_units);
            return Err(EvalError::Interrupted);
        }

        for results in per_round.values_mut() {
            results.sort_by(|a, b| a.identity().cmp(&b.identity()));
        }
        info!("All {} units completed in {:.2?}", expected_units, start.elapsed());
        Ok(per_round)
    }
}
