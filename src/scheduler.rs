//! Fan-out of alignment tasks and dependency-counted fan-in of integration tasks.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::anyhow;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info};

use crate::{
    error::PipelineError,
    progress_reporter,
    structures::{
        ChromosomePair, ScheduleOutcome, TargetGroup, TaskFailure, TaskGraph, TaskId, TaskState,
    },
};

/// The work behind each task of a pairwise job
pub trait PairRunner: Send + Sync + 'static {
    /// Aligns one chromosome pair; returns its chain file
    fn align(&self, pair: &ChromosomePair) -> anyhow::Result<PathBuf>;
    /// Integrates the chain files of one target chromosome; returns its alignment file
    fn integrate(&self, group: &TargetGroup, chains: &[PathBuf]) -> anyhow::Result<PathBuf>;
}

/// The alignment pool and the integration pool, built once per run.
pub struct WorkerPools {
    jobs: usize,
    align: Arc<ThreadPool>,
    integrate: Arc<ThreadPool>,
}

impl WorkerPools {
    pub fn new(jobs: usize) -> anyhow::Result<Self> {
        let jobs = jobs.max(1);
        let align = ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("align-{}", i))
            .build()?;
        let integrate = ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("integrate-{}", i))
            .build()?;
        debug!(jobs, "built worker pools");
        Ok(Self {
            jobs,
            align: Arc::new(align),
            integrate: Arc::new(integrate),
        })
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Pools cannot change size once built; asking for the current size is a no-op.
    pub fn resize(&self, jobs: usize) -> anyhow::Result<()> {
        if jobs.max(1) == self.jobs {
            return Ok(());
        }
        Err(PipelineError::config(format!(
            "worker pools already hold {} threads; cannot resize to {}",
            self.jobs, jobs
        ))
        .into())
    }
}

enum Event {
    AlignFailed(TaskFailure),
    Integrated(String, anyhow::Result<PathBuf>),
}

/// Countdown of one target chromosome's outstanding alignment tasks
struct FanIn {
    group: TargetGroup,
    remaining: AtomicUsize,
    states: Mutex<Vec<TaskState>>,
}

impl FanIn {
    fn new(group: TargetGroup) -> Self {
        let n = group.pairs.len();
        Self {
            group,
            remaining: AtomicUsize::new(n),
            states: Mutex::new(vec![TaskState::Pending; n]),
        }
    }

    fn states(&self) -> MutexGuard<'_, Vec<TaskState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start(&self, i: usize) {
        self.states()[i] = TaskState::Running;
    }

    /// Records a resolved task; true for the last one of the group.
    fn resolve(&self, i: usize, state: TaskState) -> bool {
        let previous = std::mem::replace(&mut self.states()[i], state);
        debug_assert_eq!(previous, TaskState::Running);
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// (chain files of the aligned tasks, number of failed tasks)
    fn chains(&self) -> (Vec<PathBuf>, usize) {
        let states = self.states();
        let chains = states
            .iter()
            .filter_map(|s| match s {
                TaskState::Done(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        let failed = states.iter().filter(|s| **s == TaskState::Failed).count();
        (chains, failed)
    }
}

fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(_) => Err(anyhow!("task panicked")),
    }
}

/// Runs every task of `graph` and waits for all of them.
///
/// Alignment tasks go to the alignment pool in no particular order. The
/// integration task of a target chromosome is submitted to the integration
/// pool by whichever alignment task of that chromosome resolves last, failed
/// or not, so it never starts before its whole group is resolved.
pub fn run_graph<R>(
    pools: &WorkerPools,
    graph: TaskGraph,
    runner: Arc<R>,
    show_progress: bool,
) -> ScheduleOutcome
where
    R: PairRunner,
{
    let total = graph.num_alignments();
    let num_groups = graph.groups.len();
    let resolved = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel::<Event>();
    let (stop_tx, stop_rx) = mpsc::channel();
    let reporter = show_progress.then(|| {
        let counter = resolved.clone();
        std::thread::spawn(move || {
            progress_reporter::progress_reporter(
                &counter,
                total,
                Duration::from_secs(10),
                "align",
                stop_rx,
            )
        })
    });

    for group in graph.groups {
        let fan_in = Arc::new(FanIn::new(group));
        for i in 0..fan_in.group.pairs.len() {
            let fan_in = fan_in.clone();
            let runner = runner.clone();
            let tx: Sender<Event> = tx.clone();
            let integrate_pool = pools.integrate.clone();
            let resolved = resolved.clone();
            pools.align.spawn(move || {
                let pair = &fan_in.group.pairs[i];
                fan_in.start(i);
                let state = match guarded(|| runner.align(pair)) {
                    Ok(chain) => TaskState::Done(chain),
                    Err(e) => {
                        let failure = TaskFailure {
                            task: TaskId::Align {
                                target: pair.target_label.clone(),
                                query: pair.query_label.clone(),
                            },
                            error: format!("{:#}", e),
                        };
                        error!("{}: {}", failure.task, failure.error);
                        let _ = tx.send(Event::AlignFailed(failure));
                        TaskState::Failed
                    }
                };
                resolved.fetch_add(1, Ordering::Relaxed);
                if !fan_in.resolve(i, state) {
                    return;
                }
                let (chains, failed) = fan_in.chains();
                debug!(
                    "{}: {}/{} chains, {} failed",
                    fan_in.group.label,
                    chains.len(),
                    fan_in.group.pairs.len(),
                    failed
                );
                integrate_pool.spawn(move || {
                    let result = guarded(|| runner.integrate(&fan_in.group, &chains));
                    let _ = tx.send(Event::Integrated(fan_in.group.label.clone(), result));
                });
            });
        }
    }
    drop(tx);

    let mut outcome = ScheduleOutcome::default();
    let mut pending = num_groups;
    while pending > 0 {
        match rx.recv() {
            Ok(Event::AlignFailed(failure)) => outcome.failures.push(failure),
            Ok(Event::Integrated(label, result)) => {
                pending -= 1;
                match result {
                    Ok(product) => {
                        info!("{} done: {}", label, product.display());
                        outcome.integrated.push(product);
                    }
                    Err(e) => {
                        let failure = TaskFailure {
                            task: TaskId::Integrate { target: label },
                            error: format!("{:#}", e),
                        };
                        error!("{}: {}", failure.task, failure.error);
                        outcome.failures.push(failure);
                    }
                }
            }
            Err(_) => break,
        }
    }
    // alignment failures sent after the last integration was received
    outcome.failures.extend(rx.try_iter().filter_map(|e| match e {
        Event::AlignFailed(f) => Some(f),
        Event::Integrated(..) => None,
    }));
    let _ = stop_tx.send(true);
    if let Some(handle) = reporter {
        let _ = handle.join();
    }
    outcome
}
