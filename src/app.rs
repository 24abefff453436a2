use std::fs;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::chunk::chunk_interval;
use crate::domain::{IsolationMode, StationEntry};
use crate::error::WavefetchError;
use crate::expand::{self, check_storage_granularity};
use crate::fdsn::{ClientFactory, StationLookup};
use crate::restrictions::{DownloadRestrictions, PreprocessSpec};
use crate::scheduler::{FetchScheduler, RunReport, WorkUnit};
use crate::sink::{ArtifactWriter, Sink, resolve_metadata_path};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Bulk-mode result: the resolved stations plus the per-unit manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkReport {
    pub stations: Vec<String>,
    pub metadata_written: usize,
    #[serde(flatten)]
    pub report: RunReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedUnit {
    pub seed_id: String,
    pub starttime: String,
    pub endtime: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanResult {
    pub units: Vec<PlannedUnit>,
}

impl From<&[WorkUnit]> for PlanResult {
    fn from(units: &[WorkUnit]) -> Self {
        Self {
            units: units
                .iter()
                .map(|unit| PlannedUnit {
                    seed_id: unit.selection.seed_id(),
                    starttime: unit.window.start.to_rfc3339(),
                    endtime: unit.window.end.to_rfc3339(),
                })
                .collect(),
        }
    }
}

/// Chunk one restriction's window into work units, one per chunk.
pub fn plan_units(restrictions: &DownloadRestrictions) -> Result<Vec<WorkUnit>, WavefetchError> {
    let chunks = chunk_interval(restrictions.window, restrictions.chunking)?;
    Ok(chunks
        .into_iter()
        .map(|window| WorkUnit {
            selection: restrictions.selection.clone(),
            window,
            group_by: restrictions.group_by.clone(),
        })
        .collect())
}

/// Wires expansion, chunking, the scheduler and the sink together.
pub struct App<F: ClientFactory, W: ArtifactWriter> {
    factory: F,
    writer: W,
    scheduler: FetchScheduler,
    sink: Sink,
    metadata_storage: Option<String>,
}

impl<F: ClientFactory, W: ArtifactWriter> App<F, W> {
    pub fn new(
        factory: F,
        writer: W,
        storage: &str,
        metadata_storage: Option<String>,
        workers: usize,
        mode: IsolationMode,
    ) -> Result<Self, WavefetchError> {
        let scheduler = FetchScheduler::new(workers, mode)?;
        let sink = Sink::new(storage, writer.extension());
        Ok(Self {
            factory,
            writer,
            scheduler,
            sink,
            metadata_storage,
        })
    }

    /// Single-selection chunked download: split the window into chunks and
    /// fan the chunks out over the worker budget.
    pub fn download_chunked(
        &self,
        restrictions: &DownloadRestrictions,
        preprocess: Option<&PreprocessSpec>,
        progress: &dyn ProgressSink,
    ) -> Result<RunReport, WavefetchError> {
        check_storage_granularity(self.sink.layout(), restrictions)?;
        let units = plan_units(restrictions)?;
        progress.event(ProgressEvent {
            message: format!(
                "phase=Plan; {} chunks for {}",
                units.len(),
                restrictions.selection
            ),
            elapsed: None,
        });

        let report = self
            .scheduler
            .run(&self.factory, &units, preprocess, &self.sink, &self.writer)?;
        progress.event(ProgressEvent {
            message: format!(
                "phase=Done; {} succeeded, {} failed",
                report.succeeded(),
                report.failed()
            ),
            elapsed: Some(Duration::from_millis(report.total_elapsed_ms)),
        });
        Ok(report)
    }

    /// Bulk download: expand the coarse restriction into per-station
    /// restrictions, chunk each station's window, run everything as one
    /// fan-out.
    pub fn download_by_station(
        &self,
        coarse: &DownloadRestrictions,
        preprocess: Option<&PreprocessSpec>,
        progress: &dyn ProgressSink,
    ) -> Result<BulkReport, WavefetchError>
    where
        F::Client: StationLookup,
    {
        check_storage_granularity(self.sink.layout(), coarse)?;

        progress.event(ProgressEvent {
            message: format!("phase=Resolve; expanding {}", coarse.selection),
            elapsed: None,
        });
        let lookup = self.factory.connect()?;
        let expansion = expand::expand(&lookup, coarse)?;

        let metadata_written = match &self.metadata_storage {
            Some(template) => self.write_station_metadata(template, &expansion.stations)?,
            None => 0,
        };

        let mut units = Vec::new();
        for concrete in &expansion.restrictions {
            units.extend(plan_units(concrete)?);
        }
        progress.event(ProgressEvent {
            message: format!(
                "phase=Plan; {} stations, {} units",
                expansion.stations.len(),
                units.len()
            ),
            elapsed: None,
        });

        let report = self
            .scheduler
            .run(&self.factory, &units, preprocess, &self.sink, &self.writer)?;
        progress.event(ProgressEvent {
            message: format!(
                "phase=Done; {} succeeded, {} failed",
                report.succeeded(),
                report.failed()
            ),
            elapsed: Some(Duration::from_millis(report.total_elapsed_ms)),
        });

        Ok(BulkReport {
            stations: expansion
                .stations
                .iter()
                .map(|entry| format!("{}.{}", entry.network, entry.station))
                .collect(),
            metadata_written,
            report,
        })
    }

    /// Plan without fetching: the chunked units for one restriction.
    pub fn plan(&self, restrictions: &DownloadRestrictions) -> Result<PlanResult, WavefetchError> {
        check_storage_granularity(self.sink.layout(), restrictions)?;
        let units = plan_units(restrictions)?;
        Ok(PlanResult::from(units.as_slice()))
    }

    /// One JSON inventory record per station, skip-if-exists like the
    /// waveform sink.
    fn write_station_metadata(
        &self,
        template: &str,
        stations: &[StationEntry],
    ) -> Result<usize, WavefetchError> {
        let mut written = 0;
        for entry in stations {
            let path = resolve_metadata_path(template, &entry.network, &entry.station);
            if path.as_std_path().is_file() {
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent.as_std_path())
                    .map_err(|err| WavefetchError::Filesystem(err.to_string()))?;
            }
            let content = serde_json::to_vec_pretty(entry)
                .map_err(|err| WavefetchError::Filesystem(err.to_string()))?;
            fs::write(path.as_std_path(), content)
                .map_err(|err| WavefetchError::Filesystem(err.to_string()))?;
            info!(%path, "wrote station metadata");
            written += 1;
        }
        Ok(written)
    }
}
