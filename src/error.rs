use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum WavefetchError {
    #[error("chunk length must be non-zero")]
    InvalidChunkLength,

    #[error("chunk overlap {overlap_in_sec}s must be shorter than chunk length {length_in_sec}s")]
    NonAdvancingChunk {
        length_in_sec: u64,
        overlap_in_sec: u64,
    },

    #[error("invalid time window: start {start} is not before end {end}")]
    InvalidTimeWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("invalid spatial domain: {0}")]
    InvalidDomain(String),

    #[error("worker count must be at least 1")]
    InvalidConcurrency,

    #[error("storage layout needs daily files: {0}")]
    IncompatibleStorageGranularity(String),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),

    #[error("station service request failed: {0}")]
    StationHttp(String),

    #[error("station service returned status {status}: {message}")]
    StationStatus { status: u16, message: String },

    #[error("waveform request failed: {0}")]
    WaveformHttp(String),

    #[error("waveform service returned status {status}: {message}")]
    WaveformStatus { status: u16, message: String },

    #[error("no data available for {0}")]
    NoDataAvailable(String),

    #[error("unparsable time-series payload: {0}")]
    PayloadParse(String),

    #[error("refusing to store empty trace group: {0}")]
    EmptyGroup(String),

    #[error("missing config file wavefetch.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
