use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Datelike;
use tracing::{debug, info};

use crate::domain::{FetchedGroup, TraceStats};
use crate::error::WavefetchError;

/// Lexicographically sortable timestamp used in artifact names.
pub const PATH_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Prefix selecting the SDS daily-file layout.
pub const SDS_PREFIX: &str = "sds:";

const TEMPLATE_KEYS: [&str; 6] = [
    "{network}",
    "{station}",
    "{location}",
    "{channel}",
    "{starttime}",
    "{endtime}",
];

/// How a storage string is interpreted: a full per-chunk template, a plain
/// directory that gets canonical filenames appended, or an SDS tree of
/// day-long files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLayout {
    Template(String),
    Directory(Utf8PathBuf),
    Sds(Utf8PathBuf),
}

impl StorageLayout {
    pub fn parse(raw: &str) -> Self {
        if let Some(root) = raw.strip_prefix(SDS_PREFIX) {
            return StorageLayout::Sds(Utf8PathBuf::from(root));
        }
        if TEMPLATE_KEYS.iter().all(|key| raw.contains(key)) {
            return StorageLayout::Template(raw.to_string());
        }
        StorageLayout::Directory(Utf8PathBuf::from(raw))
    }

    /// SDS names one file per calendar day; sub-day chunks would collide.
    pub fn requires_daily_files(&self) -> bool {
        matches!(self, StorageLayout::Sds(_))
    }
}

/// Serializes one fetched group at a resolved path. Implementations own the
/// on-disk format; the sink owns naming and idempotence.
pub trait ArtifactWriter: Send + Sync {
    fn extension(&self) -> &str;
    fn persist(&self, group: &FetchedGroup, path: &Utf8Path) -> Result<(), WavefetchError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub path: Utf8PathBuf,
    pub already_existed: bool,
}

/// Deterministic, idempotent persistence of fetched groups. The path is a
/// pure function of the trace identity, the chunk window and the
/// preprocessing marker, so reruns skip finished work for free.
#[derive(Debug, Clone)]
pub struct Sink {
    layout: StorageLayout,
    extension: String,
}

impl Sink {
    pub fn new(storage: &str, extension: &str) -> Self {
        Self {
            layout: StorageLayout::parse(storage),
            extension: extension.to_string(),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn resolve_path(&self, stats: &TraceStats, preprocessed: bool) -> Utf8PathBuf {
        let start = stats.starttime.format(PATH_TIMESTAMP_FORMAT).to_string();
        let end = stats.endtime.format(PATH_TIMESTAMP_FORMAT).to_string();
        let ppc = if preprocessed { ".ppc" } else { "" };
        match &self.layout {
            StorageLayout::Template(template) => Utf8PathBuf::from(
                template
                    .replace("{network}", &stats.network)
                    .replace("{station}", &stats.station)
                    .replace("{location}", &stats.location)
                    .replace("{channel}", &stats.channel)
                    .replace("{starttime}", &start)
                    .replace("{endtime}", &end)
                    .replace("{ppc}", ppc),
            ),
            StorageLayout::Directory(dir) => dir.join(format!(
                "{}__{start}__{end}{ppc}.{}",
                stats.seed_id(),
                self.extension
            )),
            StorageLayout::Sds(root) => {
                let year = stats.starttime.year();
                let day = stats.starttime.ordinal();
                root.join(year.to_string())
                    .join(&stats.network)
                    .join(&stats.station)
                    .join(format!("{}.D", stats.channel))
                    .join(format!(
                        "{}.{}.{}.{}.D.{year}.{day:03}",
                        stats.network, stats.station, stats.location, stats.channel
                    ))
            }
        }
    }

    /// Persist `group` unless its artifact already exists. The existence
    /// check is the system's only resume mechanism.
    pub fn write(
        &self,
        group: &FetchedGroup,
        preprocessed: bool,
        writer: &dyn ArtifactWriter,
    ) -> Result<WriteOutcome, WavefetchError> {
        let stats = group
            .traces
            .first()
            .map(|trace| &trace.stats)
            .ok_or_else(|| WavefetchError::EmptyGroup(group.key.clone()))?;
        let path = self.resolve_path(stats, preprocessed);

        if path.as_std_path().is_file() {
            debug!(%path, "artifact exists, skipping");
            return Ok(WriteOutcome {
                path,
                already_existed: true,
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| WavefetchError::Filesystem(err.to_string()))?;
        }
        writer.persist(group, &path)?;
        info!(%path, key = %group.key, "stored artifact");
        Ok(WriteOutcome {
            path,
            already_existed: false,
        })
    }
}

/// Resolve the metadata artifact path for one station. Templates may use
/// `{network}` and `{station}`; anything else is treated as a directory.
pub fn resolve_metadata_path(template: &str, network: &str, station: &str) -> Utf8PathBuf {
    if template.contains("{network}") && template.contains("{station}") {
        return Utf8PathBuf::from(
            template
                .replace("{network}", network)
                .replace("{station}", station),
        );
    }
    Utf8PathBuf::from(template).join(format!("{network}.{station}.json"))
}

/// Default artifact format: one sample-list block per trace, the same ASCII
/// form the service returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsciiArtifactWriter;

impl ArtifactWriter for AsciiArtifactWriter {
    fn extension(&self) -> &str {
        "slist"
    }

    fn persist(&self, group: &FetchedGroup, path: &Utf8Path) -> Result<(), WavefetchError> {
        let parent = path
            .parent()
            .ok_or_else(|| WavefetchError::Filesystem("artifact path has no parent".to_string()))?;

        let mut body = String::new();
        for trace in &group.traces {
            let stats = &trace.stats;
            body.push_str(&format!(
                "TIMESERIES {}_{}_{}_{}, {} samples, {} sps, {}, SLIST, FLOAT64, Counts\n",
                stats.network,
                stats.station,
                stats.location,
                stats.channel,
                trace.data.len(),
                stats.sampling_rate,
                stats.starttime.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            ));
            for sample in &trace.data {
                body.push_str(&format!("{sample}\n"));
            }
        }

        let mut temp = tempfile::Builder::new()
            .prefix(".wavefetch")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| WavefetchError::Filesystem(err.to_string()))?;
        temp.write_all(body.as_bytes())
            .map_err(|err| WavefetchError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| WavefetchError::Filesystem(err.to_string()))?;
        Ok(())
    }
}
