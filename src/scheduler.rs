use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{FetchedGroup, IsolationMode, SelectionKey, TimeInterval, group_traces};
use crate::error::WavefetchError;
use crate::fdsn::{ClientFactory, WaveformClient};
use crate::preprocess::{self, StepReport};
use crate::restrictions::PreprocessSpec;
use crate::sink::{ArtifactWriter, Sink};

/// One independently fetchable (selection, window) pair. Immutable; consumed
/// exactly once by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub selection: SelectionKey,
    pub window: TimeInterval,
    pub group_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Preprocess,
    Store,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredArtifact {
    pub path: String,
    pub already_existed: bool,
    pub steps: StepReport,
}

/// `Failed` keeps the artifacts stored before the failing group, so the
/// manifest never understates what is on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UnitStatus {
    Done {
        stored: Vec<StoredArtifact>,
    },
    Failed {
        stage: Stage,
        error: String,
        stored: Vec<StoredArtifact>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitOutcome {
    pub seed_id: String,
    pub starttime: String,
    pub endtime: String,
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub status: UnitStatus,
}

impl UnitOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self.status, UnitStatus::Done { .. })
    }
}

/// Manifest of a whole run: one outcome per unit, in unit order, plus the
/// total wall-clock span. Always produced, even when units failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub outcomes: Vec<UnitOutcome>,
    pub total_elapsed_ms: u64,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_done()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Bounded fan-out over independent work units. One unit's failure is
/// absorbed into its outcome and never aborts siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchScheduler {
    workers: usize,
    mode: IsolationMode,
}

impl FetchScheduler {
    pub fn new(workers: usize, mode: IsolationMode) -> Result<Self, WavefetchError> {
        if workers == 0 {
            return Err(WavefetchError::InvalidConcurrency);
        }
        Ok(Self { workers, mode })
    }

    pub fn run<F: ClientFactory>(
        &self,
        factory: &F,
        units: &[WorkUnit],
        spec: Option<&PreprocessSpec>,
        sink: &Sink,
        writer: &dyn ArtifactWriter,
    ) -> Result<RunReport, WavefetchError> {
        let total = Instant::now();

        let outcomes = if self.workers == 1 {
            // Sequential on the caller's thread, no pool machinery.
            let client = factory.connect()?;
            units
                .iter()
                .map(|unit| process_unit(&client, unit, spec, sink, writer))
                .collect()
        } else {
            let threads = self.workers.min(units.len().max(1));
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|err| WavefetchError::WorkerPool(err.to_string()))?;
            match self.mode {
                IsolationMode::Cooperative => {
                    let client = factory.connect()?;
                    pool.install(|| {
                        units
                            .par_iter()
                            .map(|unit| process_unit(&client, unit, spec, sink, writer))
                            .collect()
                    })
                }
                IsolationMode::Isolated => pool.install(|| {
                    units
                        .par_iter()
                        .map(|unit| match factory.connect() {
                            Ok(client) => process_unit(&client, unit, spec, sink, writer),
                            Err(err) => failed_outcome(
                                unit,
                                Stage::Fetch,
                                &err,
                                Instant::now(),
                                Vec::new(),
                            ),
                        })
                        .collect()
                }),
            }
        };

        let report = RunReport {
            outcomes,
            total_elapsed_ms: total.elapsed().as_millis() as u64,
        };
        info!(
            units = units.len(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            total_elapsed_ms = report.total_elapsed_ms,
            "run finished"
        );
        Ok(report)
    }
}

/// Fetch -> preprocess -> store for one unit. Every failure ends up in the
/// returned outcome; nothing propagates.
fn process_unit<C: WaveformClient>(
    client: &C,
    unit: &WorkUnit,
    spec: Option<&PreprocessSpec>,
    sink: &Sink,
    writer: &dyn ArtifactWriter,
) -> UnitOutcome {
    let started = Instant::now();
    info!(id = %unit.selection, window = %unit.window, "fetching");

    let traces = match client.fetch_waveforms(&unit.selection, &unit.window) {
        Ok(traces) => traces,
        Err(err) => {
            warn!(id = %unit.selection, window = %unit.window, error = %err, "fetch failed");
            return failed_outcome(unit, Stage::Fetch, &err, started, Vec::new());
        }
    };

    let groups = group_traces(traces, &unit.group_by);
    let mut stored = Vec::with_capacity(groups.len());
    for mut group in groups {
        let report = store_group(&mut group, unit, spec, sink, writer);
        match report {
            Ok(artifact) => stored.push(artifact),
            Err(err) => {
                // A group emptied by preprocessing is a pipeline casualty,
                // anything else failed at the sink.
                let stage = match &err {
                    WavefetchError::EmptyGroup(_) => Stage::Preprocess,
                    _ => Stage::Store,
                };
                warn!(id = %unit.selection, key = %group.key, error = %err, "store failed");
                return failed_outcome(unit, stage, &err, started, stored);
            }
        }
    }

    let elapsed = started.elapsed();
    info!(
        id = %unit.selection,
        window = %unit.window,
        artifacts = stored.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "done"
    );
    UnitOutcome {
        seed_id: unit.selection.seed_id(),
        starttime: unit.window.start.to_rfc3339(),
        endtime: unit.window.end.to_rfc3339(),
        elapsed_ms: elapsed.as_millis() as u64,
        status: UnitStatus::Done { stored },
    }
}

fn store_group(
    group: &mut FetchedGroup,
    unit: &WorkUnit,
    spec: Option<&PreprocessSpec>,
    sink: &Sink,
    writer: &dyn ArtifactWriter,
) -> Result<StoredArtifact, WavefetchError> {
    let steps = preprocess::apply(group, spec);
    if !steps.steps.is_empty() {
        info!(id = %unit.selection, key = %group.key, report = %steps.render(), "preprocessed");
    }
    let outcome = sink.write(group, steps.applied, writer)?;
    Ok(StoredArtifact {
        path: outcome.path.to_string(),
        already_existed: outcome.already_existed,
        steps,
    })
}

fn failed_outcome(
    unit: &WorkUnit,
    stage: Stage,
    err: &WavefetchError,
    started: Instant,
    stored: Vec<StoredArtifact>,
) -> UnitOutcome {
    UnitOutcome {
        seed_id: unit.selection.seed_id(),
        starttime: unit.window.start.to_rfc3339(),
        endtime: unit.window.end.to_rfc3339(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        status: UnitStatus::Failed {
            stage,
            error: err.to_string(),
            stored,
        },
    }
}
