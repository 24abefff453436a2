use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use wavefetch::domain::{
    IsolationMode, SelectionKey, TimeInterval, Trace, TraceStats, parse_instant,
};
use wavefetch::error::WavefetchError;
use wavefetch::domain::FetchedGroup;
use wavefetch::fdsn::{ClientFactory, WaveformClient};
use wavefetch::scheduler::{FetchScheduler, Stage, UnitStatus, WorkUnit};
use wavefetch::sink::{ArtifactWriter, AsciiArtifactWriter, Sink};

#[derive(Clone)]
struct MockClient {
    failing_station: Option<&'static str>,
    fetches: Arc<AtomicUsize>,
}

impl WaveformClient for MockClient {
    fn fetch_waveforms(
        &self,
        selection: &SelectionKey,
        window: &TimeInterval,
    ) -> Result<Vec<Trace>, WavefetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if Some(selection.station.as_str()) == self.failing_station {
            return Err(WavefetchError::NoDataAvailable(selection.seed_id()));
        }
        Ok(vec![Trace {
            stats: TraceStats {
                network: selection.network.clone(),
                station: selection.station.clone(),
                location: "00".to_string(),
                channel: "HHZ".to_string(),
                starttime: window.start,
                endtime: window.end,
                sampling_rate: 100.0,
            },
            data: vec![1.0, 2.0, 3.0],
        }])
    }
}

struct MockFactory {
    connects: AtomicUsize,
    fetches: Arc<AtomicUsize>,
    failing_station: Option<&'static str>,
}

impl MockFactory {
    fn new(failing_station: Option<&'static str>) -> Self {
        Self {
            connects: AtomicUsize::new(0),
            fetches: Arc::new(AtomicUsize::new(0)),
            failing_station,
        }
    }
}

impl ClientFactory for MockFactory {
    type Client = MockClient;

    fn connect(&self) -> Result<MockClient, WavefetchError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockClient {
            failing_station: self.failing_station,
            fetches: Arc::clone(&self.fetches),
        })
    }
}

fn units(stations: &[&str]) -> Vec<WorkUnit> {
    let window = TimeInterval::new(
        parse_instant("2019-04-23T00:00:00").unwrap(),
        parse_instant("2019-04-23T01:00:00").unwrap(),
    )
    .unwrap();
    stations
        .iter()
        .map(|station| WorkUnit {
            selection: SelectionKey::new("CM", station, "00", "HHZ").unwrap(),
            window,
            group_by: "{network}.{station}.{channel}".to_string(),
        })
        .collect()
}

fn sink_in(temp: &tempfile::TempDir) -> Sink {
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    Sink::new(root.as_str(), "slist")
}

#[test]
fn zero_workers_is_a_configuration_error() {
    let err = FetchScheduler::new(0, IsolationMode::Cooperative).unwrap_err();
    assert_matches!(err, WavefetchError::InvalidConcurrency);
}

#[test]
fn one_failing_unit_never_aborts_siblings() {
    let temp = tempfile::tempdir().unwrap();
    let factory = MockFactory::new(Some("RUS"));
    let scheduler = FetchScheduler::new(2, IsolationMode::Cooperative).unwrap();
    let units = units(&["BAR2", "RUS", "URMC", "DBB", "PTB"]);

    let report = scheduler
        .run(&factory, &units, None, &sink_in(&temp), &AsciiArtifactWriter)
        .unwrap();

    assert_eq!(report.outcomes.len(), 5);
    assert_eq!(report.succeeded(), 4);
    assert_eq!(report.failed(), 1);

    let failed = report
        .outcomes
        .iter()
        .find(|outcome| !outcome.is_done())
        .unwrap();
    assert_eq!(failed.seed_id, "CM.RUS.00.HHZ");
    assert_matches!(
        &failed.status,
        UnitStatus::Failed {
            stage: Stage::Fetch,
            ..
        }
    );

    // The four healthy units left artifacts behind.
    let stored = std::fs::read_dir(temp.path()).unwrap().count();
    assert_eq!(stored, 4);
}

#[test]
fn outcomes_come_back_in_unit_order() {
    let temp = tempfile::tempdir().unwrap();
    let factory = MockFactory::new(None);
    let scheduler = FetchScheduler::new(3, IsolationMode::Cooperative).unwrap();
    let units = units(&["AAA", "BBB", "CCC", "DDD"]);

    let report = scheduler
        .run(&factory, &units, None, &sink_in(&temp), &AsciiArtifactWriter)
        .unwrap();

    let ids = report
        .outcomes
        .iter()
        .map(|outcome| outcome.seed_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        ids,
        vec![
            "CM.AAA.00.HHZ",
            "CM.BBB.00.HHZ",
            "CM.CCC.00.HHZ",
            "CM.DDD.00.HHZ"
        ]
    );
}

#[test]
fn cooperative_mode_shares_one_client_handle() {
    let temp = tempfile::tempdir().unwrap();
    let factory = MockFactory::new(None);
    let scheduler = FetchScheduler::new(3, IsolationMode::Cooperative).unwrap();
    let units = units(&["AAA", "BBB", "CCC", "DDD", "EEE"]);

    scheduler
        .run(&factory, &units, None, &sink_in(&temp), &AsciiArtifactWriter)
        .unwrap();

    assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    assert_eq!(factory.fetches.load(Ordering::SeqCst), 5);
}

#[test]
fn isolated_mode_connects_once_per_unit() {
    let temp = tempfile::tempdir().unwrap();
    let factory = MockFactory::new(None);
    let scheduler = FetchScheduler::new(3, IsolationMode::Isolated).unwrap();
    let units = units(&["AAA", "BBB", "CCC", "DDD", "EEE"]);

    scheduler
        .run(&factory, &units, None, &sink_in(&temp), &AsciiArtifactWriter)
        .unwrap();

    assert_eq!(factory.connects.load(Ordering::SeqCst), 5);
    assert_eq!(factory.fetches.load(Ordering::SeqCst), 5);
}

struct TwoChannelClient;

impl WaveformClient for TwoChannelClient {
    fn fetch_waveforms(
        &self,
        selection: &SelectionKey,
        window: &TimeInterval,
    ) -> Result<Vec<Trace>, WavefetchError> {
        let trace = |channel: &str| Trace {
            stats: TraceStats {
                network: selection.network.clone(),
                station: selection.station.clone(),
                location: "00".to_string(),
                channel: channel.to_string(),
                starttime: window.start,
                endtime: window.end,
                sampling_rate: 100.0,
            },
            data: vec![1.0, 2.0],
        };
        Ok(vec![trace("HHZ"), trace("HHN")])
    }
}

struct TwoChannelFactory;

impl ClientFactory for TwoChannelFactory {
    type Client = TwoChannelClient;

    fn connect(&self) -> Result<TwoChannelClient, WavefetchError> {
        Ok(TwoChannelClient)
    }
}

/// Refuses to persist one channel, so a multi-group unit fails mid-way.
struct ChannelFailingWriter {
    inner: AsciiArtifactWriter,
    failing_channel: &'static str,
}

impl ArtifactWriter for ChannelFailingWriter {
    fn extension(&self) -> &str {
        self.inner.extension()
    }

    fn persist(&self, group: &FetchedGroup, path: &Utf8Path) -> Result<(), WavefetchError> {
        if path.as_str().contains(self.failing_channel) {
            return Err(WavefetchError::Filesystem("disk full".to_string()));
        }
        self.inner.persist(group, path)
    }
}

#[test]
fn failed_unit_reports_artifacts_stored_before_the_failure() {
    let temp = tempfile::tempdir().unwrap();
    let scheduler = FetchScheduler::new(1, IsolationMode::Cooperative).unwrap();
    let units = units(&["BAR2"]);
    let writer = ChannelFailingWriter {
        inner: AsciiArtifactWriter,
        failing_channel: "HHN",
    };

    let report = scheduler
        .run(&TwoChannelFactory, &units, None, &sink_in(&temp), &writer)
        .unwrap();

    assert_eq!(report.failed(), 1);
    let UnitStatus::Failed { stage, stored, .. } = &report.outcomes[0].status else {
        panic!("expected a failed unit, got {:?}", report.outcomes[0].status);
    };
    assert_eq!(*stage, Stage::Store);
    // The first group landed before the second one failed, and the manifest
    // says so.
    assert_eq!(stored.len(), 1);
    assert!(stored[0].path.contains("HHZ"));
    assert!(std::path::Path::new(&stored[0].path).is_file());
}

#[test]
fn sequential_run_uses_a_single_connection() {
    let temp = tempfile::tempdir().unwrap();
    let factory = MockFactory::new(None);
    let scheduler = FetchScheduler::new(1, IsolationMode::Isolated).unwrap();
    let units = units(&["AAA", "BBB"]);

    let report = scheduler
        .run(&factory, &units, None, &sink_in(&temp), &AsciiArtifactWriter)
        .unwrap();

    assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    assert_eq!(report.succeeded(), 2);
}
