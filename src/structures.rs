use std::{fmt, path::PathBuf};

use ahash::AHashSet;
use anyhow::bail;
use itertools::Itertools;

use crate::{error::PipelineError, species::chromosome_label};

/// (target chromosome, query chromosome), both two-bit sequence files
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChromosomePair {
    pub target: PathBuf,
    pub query: PathBuf,
    pub target_label: String,
    pub query_label: String,
}

/// All alignment tasks sharing one target chromosome; the unit of fan-in
#[derive(Debug, Clone)]
pub struct TargetGroup {
    pub label: String,
    pub pairs: Vec<ChromosomePair>,
}

/// The pairwise task graph: target chromosomes x query chromosomes, grouped by target
#[derive(Debug, Clone)]
pub struct TaskGraph {
    pub groups: Vec<TargetGroup>,
}

impl TaskGraph {
    pub fn build(target_chromosomes: &[PathBuf], query_chromosomes: &[PathBuf]) -> anyhow::Result<Self> {
        if target_chromosomes.is_empty() || query_chromosomes.is_empty() {
            bail!(PipelineError::config("no chromosomes to align"));
        }
        let target_labels = unique_labels(target_chromosomes)?;
        let query_labels = unique_labels(query_chromosomes)?;
        let groups = target_chromosomes
            .iter()
            .zip(target_labels)
            .map(|(target, label)| TargetGroup {
                pairs: query_chromosomes
                    .iter()
                    .zip(query_labels.iter())
                    .map(|(query, query_label)| ChromosomePair {
                        target: target.clone(),
                        query: query.clone(),
                        target_label: label.clone(),
                        query_label: query_label.clone(),
                    })
                    .collect(),
                label,
            })
            .collect();
        Ok(Self { groups })
    }

    pub fn num_alignments(&self) -> usize {
        self.groups.iter().map(|g| g.pairs.len()).sum()
    }
}

fn unique_labels(chromosomes: &[PathBuf]) -> anyhow::Result<Vec<String>> {
    let labels = chromosomes.iter().map(|c| chromosome_label(c)).collect_vec();
    let mut seen = AHashSet::new();
    for l in &labels {
        if !seen.insert(l) {
            bail!(PipelineError::config(format!(
                "chromosome label {} is not unique",
                l
            )));
        }
    }
    Ok(labels)
}

/// Lifecycle of one scheduled task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Done(PathBuf),
    /// the error itself travels in a `TaskFailure`
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskId {
    /// locating genome files and building the graph of a pair
    Plan,
    Align { target: String, query: String },
    Integrate { target: String },
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Plan => write!(f, "plan"),
            TaskId::Align { target, query } => write!(f, "align {} x {}", target, query),
            TaskId::Integrate { target } => write!(f, "integrate {}", target),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task: TaskId,
    pub error: String,
}

/// What the scheduler hands back for one pairwise job
#[derive(Debug, Default)]
pub struct ScheduleOutcome {
    /// integration artifacts in completion order
    pub integrated: Vec<PathBuf>,
    pub failures: Vec<TaskFailure>,
}

#[derive(Debug)]
pub struct PairReport {
    pub target: String,
    pub query: String,
    pub products: Vec<PathBuf>,
    pub failures: Vec<TaskFailure>,
}
