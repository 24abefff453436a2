use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::WavefetchError;

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, WavefetchError> {
        if start >= end {
            return Err(WavefetchError::InvalidTimeWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Parse an instant from RFC 3339 or the bare `2019-04-23T00:00:00` form
/// FDSN services accept.
pub fn parse_instant(value: &str) -> Result<DateTime<Utc>, WavefetchError> {
    let trimmed = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| WavefetchError::InvalidTimestamp(value.to_string()))
}

/// One network/station/location/channel selection. Codes may carry FDSN
/// wildcards (`*`, `?`) and comma-separated lists until resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectionKey {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl SelectionKey {
    pub fn new(
        network: &str,
        station: &str,
        location: &str,
        channel: &str,
    ) -> Result<Self, WavefetchError> {
        for code in [network, station, channel] {
            validate_code(code, false)?;
        }
        validate_code(location, true)?;
        Ok(Self {
            network: network.to_string(),
            station: station.to_string(),
            location: location.to_string(),
            channel: channel.to_string(),
        })
    }

    /// `NET.STA.LOC.CHA` identifier, location left empty when blank.
    pub fn seed_id(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }

    /// `NET.STA` identity used by preprocessing applicability checks.
    pub fn station_id(&self) -> String {
        format!("{}.{}", self.network, self.station)
    }

    pub fn is_concrete(&self) -> bool {
        [&self.network, &self.station, &self.location, &self.channel]
            .iter()
            .all(|code| !code.contains(['*', '?', ',']))
    }

    /// Same selection with the network and station codes pinned to one
    /// resolved inventory entry.
    pub fn with_station(&self, network: &str, station: &str) -> Result<Self, WavefetchError> {
        let next = Self::new(network, station, &self.location, &self.channel)?;
        if next.network.contains(['*', '?', ',']) || next.station.contains(['*', '?', ',']) {
            return Err(WavefetchError::InvalidSelection(format!(
                "resolved station code still carries wildcards: {}.{}",
                network, station
            )));
        }
        Ok(next)
    }
}

impl fmt::Display for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.seed_id())
    }
}

impl FromStr for SelectionKey {
    type Err = WavefetchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value.trim().split('.').collect::<Vec<_>>();
        let &[network, station, location, channel] = parts.as_slice() else {
            return Err(WavefetchError::InvalidSelection(value.to_string()));
        };
        Self::new(network, station, location, channel)
    }
}

fn validate_code(code: &str, allow_empty: bool) -> Result<(), WavefetchError> {
    if code.is_empty() && !allow_empty {
        return Err(WavefetchError::InvalidSelection("empty code".to_string()));
    }
    let ok = code
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '*' | '?' | ',' | '-' | '_'));
    if !ok {
        return Err(WavefetchError::InvalidSelection(code.to_string()));
    }
    Ok(())
}

/// Rectangular latitude/longitude bounds constraining which stations a
/// wildcarded selection expands to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectangularDomain {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

impl RectangularDomain {
    pub fn new(
        min_latitude: f64,
        max_latitude: f64,
        min_longitude: f64,
        max_longitude: f64,
    ) -> Result<Self, WavefetchError> {
        let latitudes_ok = (-90.0..=90.0).contains(&min_latitude)
            && (-90.0..=90.0).contains(&max_latitude)
            && min_latitude < max_latitude;
        if !latitudes_ok {
            return Err(WavefetchError::InvalidDomain(format!(
                "latitude bounds {min_latitude}..{max_latitude}"
            )));
        }
        let longitudes_ok = (-180.0..=180.0).contains(&min_longitude)
            && (-180.0..=180.0).contains(&max_longitude)
            && min_longitude < max_longitude;
        if !longitudes_ok {
            return Err(WavefetchError::InvalidDomain(format!(
                "longitude bounds {min_longitude}..{max_longitude}"
            )));
        }
        Ok(Self {
            min_latitude,
            max_latitude,
            min_longitude,
            max_longitude,
        })
    }
}

/// How concurrent workers obtain their service handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// All workers share one long-lived client handle. Keep the worker
    /// count low; many endpoints rate-limit per client identity.
    Cooperative,
    /// Every unit connects its own client handle, no shared state.
    Isolated,
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationMode::Cooperative => write!(f, "cooperative"),
            IsolationMode::Isolated => write!(f, "isolated"),
        }
    }
}

/// One resolved station inventory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationEntry {
    pub network: String,
    pub station: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub elevation_m: Option<f64>,
    #[serde(default)]
    pub site: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceStats {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub starttime: DateTime<Utc>,
    pub endtime: DateTime<Utc>,
    pub sampling_rate: f64,
}

impl TraceStats {
    pub fn seed_id(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }

    pub fn station_id(&self) -> String {
        format!("{}.{}", self.network, self.station)
    }
}

/// One contiguous run of samples for a single channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub stats: TraceStats,
    pub data: Vec<f64>,
}

/// Traces sharing one rendered group key; the unit of preprocessing and
/// storage.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedGroup {
    pub key: String,
    pub traces: Vec<Trace>,
}

impl FetchedGroup {
    pub fn station_id(&self) -> Option<String> {
        self.traces.first().map(|trace| trace.stats.station_id())
    }
}

/// Render a group-by template such as `{network}.{station}.{channel}` for
/// one trace.
pub fn render_group_key(template: &str, stats: &TraceStats) -> String {
    template
        .replace("{network}", &stats.network)
        .replace("{station}", &stats.station)
        .replace("{location}", &stats.location)
        .replace("{channel}", &stats.channel)
}

/// Partition fetched traces into groups by rendered key, preserving
/// first-seen order.
pub fn group_traces(traces: Vec<Trace>, template: &str) -> Vec<FetchedGroup> {
    let mut order = Vec::new();
    let mut buckets: HashMap<String, Vec<Trace>> = HashMap::new();
    for trace in traces {
        let key = render_group_key(template, &trace.stats);
        if !buckets.contains_key(&key) {
            order.push(key.clone());
        }
        buckets.entry(key).or_default().push(trace);
    }
    order
        .into_iter()
        .map(|key| {
            let traces = buckets.remove(&key).unwrap_or_default();
            FetchedGroup { key, traces }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn stats(channel: &str) -> TraceStats {
        TraceStats {
            network: "CM".to_string(),
            station: "BAR2".to_string(),
            location: "00".to_string(),
            channel: channel.to_string(),
            starttime: parse_instant("2019-04-23T00:00:00").unwrap(),
            endtime: parse_instant("2019-04-23T01:00:00").unwrap(),
            sampling_rate: 100.0,
        }
    }

    #[test]
    fn parse_selection() {
        let key: SelectionKey = "CM.BAR2.00.HHZ".parse().unwrap();
        assert_eq!(key.seed_id(), "CM.BAR2.00.HHZ");
        assert_eq!(key.station_id(), "CM.BAR2");
        assert!(key.is_concrete());
    }

    #[test]
    fn parse_selection_with_empty_location() {
        let key: SelectionKey = "CM.BAR2..HHZ".parse().unwrap();
        assert_eq!(key.location, "");
        assert_eq!(key.seed_id(), "CM.BAR2..HHZ");
    }

    #[test]
    fn wildcard_selection_is_not_concrete() {
        let key = SelectionKey::new("CM", "BAR*", "*", "HH?").unwrap();
        assert!(!key.is_concrete());
    }

    #[test]
    fn reject_bad_code() {
        let err = SelectionKey::new("CM", "BAR 2", "*", "HHZ").unwrap_err();
        assert_matches!(err, WavefetchError::InvalidSelection(_));
    }

    #[test]
    fn pinning_station_rejects_wildcards() {
        let key = SelectionKey::new("C*", "*", "*", "*").unwrap();
        let err = key.with_station("CM", "BAR*").unwrap_err();
        assert_matches!(err, WavefetchError::InvalidSelection(_));
    }

    #[test]
    fn interval_requires_ordered_endpoints() {
        let start = parse_instant("2019-04-23T02:00:00").unwrap();
        let end = parse_instant("2019-04-23T00:00:00").unwrap();
        let err = TimeInterval::new(start, end).unwrap_err();
        assert_matches!(err, WavefetchError::InvalidTimeWindow { .. });
    }

    #[test]
    fn parse_instant_accepts_bare_and_rfc3339() {
        let bare = parse_instant("2019-04-23T00:00:00").unwrap();
        let zoned = parse_instant("2019-04-23T00:00:00Z").unwrap();
        let fractional = parse_instant("2019-04-23T00:00:00.500").unwrap();
        assert_eq!(bare, zoned);
        assert!(fractional > bare);
    }

    #[test]
    fn rectangular_domain_requires_ordered_bounds_in_range() {
        RectangularDomain::new(2.0, 12.0, -80.0, -66.0).unwrap();
        let inverted = RectangularDomain::new(12.0, 2.0, -80.0, -66.0).unwrap_err();
        assert_matches!(inverted, WavefetchError::InvalidDomain(_));
        let out_of_range = RectangularDomain::new(2.0, 12.0, -80.0, 190.0).unwrap_err();
        assert_matches!(out_of_range, WavefetchError::InvalidDomain(_));
    }

    #[test]
    fn group_traces_preserves_first_seen_order() {
        let traces = vec![
            Trace {
                stats: stats("HHZ"),
                data: vec![1.0],
            },
            Trace {
                stats: stats("HHN"),
                data: vec![2.0],
            },
            Trace {
                stats: stats("HHZ"),
                data: vec![3.0],
            },
        ];
        let groups = group_traces(traces, "{network}.{station}.{channel}");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key, "CM.BAR2.HHZ");
        assert_eq!(groups[0].traces.len(), 2);
        assert_eq!(groups[1].key, "CM.BAR2.HHN");
    }
}
