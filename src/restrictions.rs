use serde::{Deserialize, Serialize};

use crate::chunk::ChunkSpec;
use crate::domain::{RectangularDomain, SelectionKey, TimeInterval};
use crate::error::WavefetchError;

pub const DEFAULT_GROUP_BY: &str = "{network}.{station}.{channel}";

/// Everything one download run needs besides the service endpoint: the
/// (possibly wildcarded) selection, an optional spatial domain bounding the
/// expansion, the request window, chunking and how fetched traces are
/// grouped into stored artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRestrictions {
    pub selection: SelectionKey,
    pub window: TimeInterval,
    pub chunking: ChunkSpec,
    pub group_by: String,
    pub domain: Option<RectangularDomain>,
}

impl DownloadRestrictions {
    pub fn new(
        selection: SelectionKey,
        window: TimeInterval,
        chunking: ChunkSpec,
        group_by: Option<String>,
    ) -> Self {
        Self {
            selection,
            window,
            chunking,
            group_by: group_by.unwrap_or_else(|| DEFAULT_GROUP_BY.to_string()),
            domain: None,
        }
    }

    pub fn with_domain(mut self, domain: Option<RectangularDomain>) -> Self {
        self.domain = domain;
        self
    }

    /// Derive the concrete restriction for one resolved station, keeping
    /// every other field as-is.
    pub fn for_station(&self, network: &str, station: &str) -> Result<Self, WavefetchError> {
        Ok(Self {
            selection: self.selection.with_station(network, station)?,
            window: self.window,
            chunking: self.chunking,
            group_by: self.group_by.clone(),
            domain: self.domain,
        })
    }
}

/// One named preprocessing step with its parameter map, e.g.
/// `{"name": "taper", "params": {"max_percentage": 0.05}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessStep {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl PreprocessStep {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: serde_json::Map::new(),
        }
    }
}

/// Ordered preprocessing applied to groups whose `NET.STA` identity is
/// listed in `station_ids`. Shared read-only across workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessSpec {
    pub station_ids: Vec<String>,
    pub steps: Vec<PreprocessStep>,
}

impl PreprocessSpec {
    pub fn applies_to(&self, station_id: &str) -> bool {
        self.station_ids.iter().any(|id| id == station_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::parse_instant;

    fn coarse() -> DownloadRestrictions {
        let selection = SelectionKey::new("CM", "BAR2,RUS", "*", "HH*").unwrap();
        let window = TimeInterval::new(
            parse_instant("2019-04-23T00:00:00").unwrap(),
            parse_instant("2019-04-24T00:00:00").unwrap(),
        )
        .unwrap();
        DownloadRestrictions::new(selection, window, ChunkSpec::new(Some(3600), 60), None)
            .with_domain(Some(RectangularDomain::new(2.0, 12.0, -80.0, -66.0).unwrap()))
    }

    #[test]
    fn default_group_by_applies() {
        assert_eq!(coarse().group_by, DEFAULT_GROUP_BY);
    }

    #[test]
    fn for_station_overrides_codes_and_keeps_the_rest() {
        let coarse = coarse();
        let concrete = coarse.for_station("CM", "RUS").unwrap();
        assert_eq!(concrete.selection.network, "CM");
        assert_eq!(concrete.selection.station, "RUS");
        assert_eq!(concrete.selection.location, coarse.selection.location);
        assert_eq!(concrete.selection.channel, coarse.selection.channel);
        assert_eq!(concrete.window, coarse.window);
        assert_eq!(concrete.chunking, coarse.chunking);
        assert_eq!(concrete.group_by, coarse.group_by);
        assert_eq!(concrete.domain, coarse.domain);
    }

    #[test]
    fn preprocess_spec_matches_station_ids() {
        let spec = PreprocessSpec {
            station_ids: vec!["CM.BAR2".to_string()],
            steps: vec![PreprocessStep::named("demean")],
        };
        assert!(spec.applies_to("CM.BAR2"));
        assert!(!spec.applies_to("CM.RUS"));
    }
}
