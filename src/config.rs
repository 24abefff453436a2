use std::fs;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::chunk::ChunkSpec;
use crate::domain::{IsolationMode, RectangularDomain, SelectionKey, TimeInterval, parse_instant};
use crate::error::WavefetchError;
use crate::fdsn::Credentials;
use crate::restrictions::{DownloadRestrictions, PreprocessSpec};

pub const DEFAULT_CONFIG_FILE: &str = "wavefetch.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub service: ServiceConfig,
    pub selection: SelectionConfig,
    #[serde(default)]
    pub chunk: ChunkSpec,
    #[serde(default)]
    pub group_by: Option<String>,
    pub storage: StorageConfig,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub mode: Option<IsolationMode>,
    #[serde(default)]
    pub preprocess: Option<PreprocessSpec>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub base_url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SelectionConfig {
    pub network: String,
    pub station: String,
    #[serde(default = "wildcard")]
    pub location: String,
    #[serde(default = "wildcard")]
    pub channel: String,
    pub starttime: String,
    pub endtime: String,
    #[serde(default)]
    pub domain: Option<DomainConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DomainConfig {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

fn wildcard() -> String {
    "*".to_string()
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StorageConfig {
    pub waveforms: String,
    #[serde(default)]
    pub metadata: Option<String>,
}

/// Fully validated job parameters, ready to hand to the app.
#[derive(Debug, Clone)]
pub struct ResolvedJob {
    pub schema_version: u32,
    pub base_url: String,
    pub credentials: Option<Credentials>,
    pub restrictions: DownloadRestrictions,
    pub storage: String,
    pub metadata_storage: Option<String>,
    pub workers: usize,
    pub mode: IsolationMode,
    pub preprocess: Option<PreprocessSpec>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedJob, WavefetchError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            return Err(WavefetchError::MissingConfig);
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| WavefetchError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| WavefetchError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedJob, WavefetchError> {
        let selection = SelectionKey::new(
            &config.selection.network,
            &config.selection.station,
            &config.selection.location,
            &config.selection.channel,
        )?;
        let window = TimeInterval::new(
            parse_instant(&config.selection.starttime)?,
            parse_instant(&config.selection.endtime)?,
        )?;
        let domain = config
            .selection
            .domain
            .map(|d| {
                RectangularDomain::new(
                    d.min_latitude,
                    d.max_latitude,
                    d.min_longitude,
                    d.max_longitude,
                )
            })
            .transpose()?;
        let restrictions =
            DownloadRestrictions::new(selection, window, config.chunk, config.group_by)
                .with_domain(domain);

        let credentials = match (config.service.user, config.service.password) {
            (Some(user), Some(password)) => Some(Credentials { user, password }),
            (None, None) => None,
            _ => {
                return Err(WavefetchError::ConfigParse(
                    "service user and password must be set together".to_string(),
                ));
            }
        };

        Ok(ResolvedJob {
            schema_version: config.schema_version.unwrap_or(1),
            base_url: config.service.base_url,
            credentials,
            restrictions,
            storage: config.storage.waveforms,
            metadata_storage: config.storage.metadata,
            workers: config.workers.unwrap_or(1),
            mode: config.mode.unwrap_or(IsolationMode::Cooperative),
            preprocess: config.preprocess,
        })
    }
}
