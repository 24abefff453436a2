use std::thread;
use std::time::Duration;

use chrono::Duration as TimeDelta;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::domain::{
    RectangularDomain, SelectionKey, StationEntry, TimeInterval, Trace, TraceStats, parse_instant,
};
use crate::error::WavefetchError;

const QUERY_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Resolves a coarse selection into concrete station inventory entries.
/// A failure here aborts the whole expansion, not a single unit.
pub trait StationLookup: Send + Sync {
    fn resolve_stations(
        &self,
        selection: &SelectionKey,
        window: &TimeInterval,
        domain: Option<&RectangularDomain>,
    ) -> Result<Vec<StationEntry>, WavefetchError>;
}

/// Fetches raw traces for one selection and window. Must tolerate concurrent
/// calls when shared across cooperative workers.
pub trait WaveformClient: Send + Sync {
    fn fetch_waveforms(
        &self,
        selection: &SelectionKey,
        window: &TimeInterval,
    ) -> Result<Vec<Trace>, WavefetchError>;
}

/// Creates service handles. Cooperative runs connect once and share the
/// handle; isolated runs connect per unit.
pub trait ClientFactory: Send + Sync {
    type Client: WaveformClient;

    fn connect(&self) -> Result<Self::Client, WavefetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Blocking client for FDSN-style station and time-series services.
#[derive(Clone)]
pub struct FdsnHttpClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl FdsnHttpClient {
    pub fn new(base_url: &str, credentials: Option<Credentials>) -> Result<Self, WavefetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("wavefetch/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| WavefetchError::WaveformHttp(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| WavefetchError::WaveformHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn get(&self, url: &str, query: &[(&str, String)]) -> reqwest::blocking::RequestBuilder {
        let mut request = self.client.get(url).query(query);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.user, Some(&credentials.password));
        }
        request
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, reqwest::Error>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(status, attempt, "retrying request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl StationLookup for FdsnHttpClient {
    fn resolve_stations(
        &self,
        selection: &SelectionKey,
        window: &TimeInterval,
        domain: Option<&RectangularDomain>,
    ) -> Result<Vec<StationEntry>, WavefetchError> {
        let url = format!("{}/fdsnws/station/1/query", self.base_url);
        let mut query =
            selection_query(selection, window, &[("level", "station"), ("format", "text")]);
        if let Some(domain) = domain {
            push_domain_query(&mut query, domain);
        }
        let response = self
            .send_with_retries(|| self.get(&url, &query))
            .map_err(|err| WavefetchError::StationHttp(err.to_string()))?;

        let status = response.status();
        if status.as_u16() == 204 {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "station request failed".to_string());
            return Err(WavefetchError::StationStatus {
                status: status.as_u16(),
                message,
            });
        }
        let body = response
            .text()
            .map_err(|err| WavefetchError::StationHttp(err.to_string()))?;
        parse_station_text(&body)
    }
}

impl WaveformClient for FdsnHttpClient {
    fn fetch_waveforms(
        &self,
        selection: &SelectionKey,
        window: &TimeInterval,
    ) -> Result<Vec<Trace>, WavefetchError> {
        let url = format!("{}/fdsnws/dataselect/1/query", self.base_url);
        let query = selection_query(selection, window, &[("format", "ascii")]);
        let response = self
            .send_with_retries(|| self.get(&url, &query))
            .map_err(|err| WavefetchError::WaveformHttp(err.to_string()))?;

        let status = response.status();
        if matches!(status.as_u16(), 204 | 404) {
            return Err(WavefetchError::NoDataAvailable(format!(
                "{} {}",
                selection.seed_id(),
                window
            )));
        }
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "waveform request failed".to_string());
            return Err(WavefetchError::WaveformStatus {
                status: status.as_u16(),
                message,
            });
        }
        let body = response
            .text()
            .map_err(|err| WavefetchError::WaveformHttp(err.to_string()))?;
        let traces = parse_slist(&body)?;
        if traces.is_empty() {
            return Err(WavefetchError::NoDataAvailable(format!(
                "{} {}",
                selection.seed_id(),
                window
            )));
        }
        Ok(traces)
    }
}

/// Hands out independent `FdsnHttpClient` connections for isolated runs.
#[derive(Debug, Clone)]
pub struct FdsnClientFactory {
    base_url: String,
    credentials: Option<Credentials>,
}

impl FdsnClientFactory {
    pub fn new(base_url: &str, credentials: Option<Credentials>) -> Self {
        Self {
            base_url: base_url.to_string(),
            credentials,
        }
    }
}

impl ClientFactory for FdsnClientFactory {
    type Client = FdsnHttpClient;

    fn connect(&self) -> Result<FdsnHttpClient, WavefetchError> {
        FdsnHttpClient::new(&self.base_url, self.credentials.clone())
    }
}

fn selection_query(
    selection: &SelectionKey,
    window: &TimeInterval,
    extra: &[(&'static str, &'static str)],
) -> Vec<(&'static str, String)> {
    let location = if selection.location.is_empty() {
        "--".to_string()
    } else {
        selection.location.clone()
    };
    let mut query = vec![
        ("net", selection.network.clone()),
        ("sta", selection.station.clone()),
        ("loc", location),
        ("cha", selection.channel.clone()),
        ("starttime", window.start.format(QUERY_TIME_FORMAT).to_string()),
        ("endtime", window.end.format(QUERY_TIME_FORMAT).to_string()),
    ];
    for (key, value) in extra {
        query.push((key, (*value).to_string()));
    }
    query
}

fn push_domain_query(query: &mut Vec<(&'static str, String)>, domain: &RectangularDomain) {
    query.push(("minlatitude", domain.min_latitude.to_string()));
    query.push(("maxlatitude", domain.max_latitude.to_string()));
    query.push(("minlongitude", domain.min_longitude.to_string()));
    query.push(("maxlongitude", domain.max_longitude.to_string()));
}

/// Parse the FDSN station text format:
/// `#Network|Station|Latitude|Longitude|Elevation|SiteName|StartTime|EndTime`
fn parse_station_text(body: &str) -> Result<Vec<StationEntry>, WavefetchError> {
    let mut entries = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields = line.split('|').map(str::trim).collect::<Vec<_>>();
        if fields.len() < 2 {
            return Err(WavefetchError::PayloadParse(format!(
                "station line has too few fields: {line}"
            )));
        }
        entries.push(StationEntry {
            network: fields[0].to_string(),
            station: fields[1].to_string(),
            latitude: fields.get(2).and_then(|v| v.parse().ok()),
            longitude: fields.get(3).and_then(|v| v.parse().ok()),
            elevation_m: fields.get(4).and_then(|v| v.parse().ok()),
            site: fields.get(5).map(|v| v.to_string()).filter(|v| !v.is_empty()),
        });
    }
    Ok(entries)
}

/// Parse the sample-list ASCII time-series format. Each block starts with a
/// `TIMESERIES NET_STA_LOC_CHA, N samples, RATE sps, START, SLIST, ...`
/// header followed by whitespace-separated samples.
pub fn parse_slist(body: &str) -> Result<Vec<Trace>, WavefetchError> {
    let mut traces: Vec<Trace> = Vec::new();
    let mut current: Option<(TraceStats, usize, Vec<f64>)> = None;

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix("TIMESERIES ") {
            if let Some(trace) = current.take() {
                traces.push(finish_trace(trace)?);
            }
            current = Some(parse_slist_header(header)?);
            continue;
        }
        let Some((_, _, samples)) = current.as_mut() else {
            return Err(WavefetchError::PayloadParse(
                "samples before TIMESERIES header".to_string(),
            ));
        };
        for token in line.split_whitespace() {
            let sample = token.parse::<f64>().map_err(|_| {
                WavefetchError::PayloadParse(format!("bad sample value: {token}"))
            })?;
            samples.push(sample);
        }
    }
    if let Some(trace) = current.take() {
        traces.push(finish_trace(trace)?);
    }
    Ok(traces)
}

fn parse_slist_header(header: &str) -> Result<(TraceStats, usize, Vec<f64>), WavefetchError> {
    let fields = header.split(',').map(str::trim).collect::<Vec<_>>();
    if fields.len() < 4 {
        return Err(WavefetchError::PayloadParse(format!(
            "short TIMESERIES header: {header}"
        )));
    }

    let mut id_parts = fields[0].split('_');
    let network = id_parts.next().unwrap_or_default().to_string();
    let station = id_parts.next().unwrap_or_default().to_string();
    let location = id_parts.next().unwrap_or_default().to_string();
    let channel = id_parts.next().unwrap_or_default().to_string();
    if network.is_empty() || station.is_empty() || channel.is_empty() {
        return Err(WavefetchError::PayloadParse(format!(
            "bad channel id: {}",
            fields[0]
        )));
    }

    let expected = fields[1]
        .strip_suffix("samples")
        .map(str::trim)
        .and_then(|v| v.parse::<usize>().ok())
        .ok_or_else(|| {
            WavefetchError::PayloadParse(format!("bad sample count: {}", fields[1]))
        })?;
    let sampling_rate = fields[2]
        .strip_suffix("sps")
        .map(str::trim)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|rate| *rate > 0.0)
        .ok_or_else(|| {
            WavefetchError::PayloadParse(format!("bad sampling rate: {}", fields[2]))
        })?;
    let starttime = parse_instant(fields[3])?;

    let stats = TraceStats {
        network,
        station,
        location,
        channel,
        starttime,
        // Fixed up once the samples are counted.
        endtime: starttime,
        sampling_rate,
    };
    Ok((stats, expected, Vec::with_capacity(expected)))
}

fn finish_trace(
    (mut stats, expected, data): (TraceStats, usize, Vec<f64>),
) -> Result<Trace, WavefetchError> {
    if data.is_empty() {
        return Err(WavefetchError::PayloadParse(format!(
            "empty trace block for {}",
            stats.seed_id()
        )));
    }
    if data.len() != expected {
        warn!(
            id = %stats.seed_id(),
            expected,
            actual = data.len(),
            "sample count differs from header"
        );
    }
    let span_ns = ((data.len() - 1) as f64 / stats.sampling_rate * 1e9).round() as i64;
    stats.endtime = stats.starttime + TimeDelta::nanoseconds(span_ns);
    Ok(Trace { stats, data })
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_station_text_flattens_entries_in_order() {
        let body = "\
#Network|Station|Latitude|Longitude|Elevation|SiteName|StartTime|EndTime
CM|BAR2|6.54|-75.21|2800.0|Barbosa|2010-01-01T00:00:00|
CM|RUS|5.89|-73.08|3697.0|Rusia|2012-01-01T00:00:00|
";
        let entries = parse_station_text(body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].network, "CM");
        assert_eq!(entries[0].station, "BAR2");
        assert_eq!(entries[0].latitude, Some(6.54));
        assert_eq!(entries[1].station, "RUS");
        assert_eq!(entries[1].site.as_deref(), Some("Rusia"));
    }

    #[test]
    fn domain_bounds_become_station_query_parameters() {
        let selection = SelectionKey::new("CM", "*", "*", "HH*").unwrap();
        let window = TimeInterval::new(
            parse_instant("2019-04-23T00:00:00").unwrap(),
            parse_instant("2019-04-24T00:00:00").unwrap(),
        )
        .unwrap();
        let domain = RectangularDomain::new(2.0, 12.0, -80.0, -66.0).unwrap();

        let mut query = selection_query(&selection, &window, &[("level", "station")]);
        push_domain_query(&mut query, &domain);

        let find = |key: &str| {
            query
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(find("minlatitude"), Some("2"));
        assert_eq!(find("maxlatitude"), Some("12"));
        assert_eq!(find("minlongitude"), Some("-80"));
        assert_eq!(find("maxlongitude"), Some("-66"));
    }

    #[test]
    fn parse_slist_builds_traces_per_block() {
        let body = "\
TIMESERIES CM_BAR2_00_HHZ, 4 samples, 2 sps, 2019-04-23T00:00:00.000000Z, SLIST, FLOAT64, Counts
1.0 2.0
3.0
4.0
TIMESERIES CM_BAR2_00_HHN, 2 samples, 2 sps, 2019-04-23T00:00:00.000000Z, SLIST, FLOAT64, Counts
5.0 6.0
";
        let traces = parse_slist(body).unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].stats.seed_id(), "CM.BAR2.00.HHZ");
        assert_eq!(traces[0].data, vec![1.0, 2.0, 3.0, 4.0]);
        // 4 samples at 2 sps span 1.5 seconds.
        assert_eq!(
            traces[0].stats.endtime,
            parse_instant("2019-04-23T00:00:01.500").unwrap()
        );
        assert_eq!(traces[1].data, vec![5.0, 6.0]);
    }

    #[test]
    fn parse_slist_rejects_header_without_rate() {
        let body = "TIMESERIES CM_BAR2_00_HHZ, 4 samples, 0 sps, 2019-04-23T00:00:00Z, SLIST\n1.0\n";
        let err = parse_slist(body).unwrap_err();
        assert_matches!(err, WavefetchError::PayloadParse(_));
    }

    #[test]
    fn parse_slist_rejects_orphan_samples() {
        let err = parse_slist("1.0 2.0\n").unwrap_err();
        assert_matches!(err, WavefetchError::PayloadParse(_));
    }
}
