use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::domain::TimeInterval;
use crate::error::WavefetchError;

/// How a request window is split into fetchable chunks. `length_in_sec = None`
/// disables chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkSpec {
    #[serde(default)]
    pub length_in_sec: Option<u64>,
    #[serde(default)]
    pub overlap_in_sec: u64,
}

impl ChunkSpec {
    pub fn new(length_in_sec: Option<u64>, overlap_in_sec: u64) -> Self {
        Self {
            length_in_sec,
            overlap_in_sec,
        }
    }
}

/// Split `window` into consecutive chunks of `length_in_sec`, each starting
/// `length - overlap` after the previous one. A remainder shorter than one
/// full chunk is emitted as a final partial interval, so the chunks always
/// cover `[start, end)` exactly.
pub fn chunk_interval(
    window: TimeInterval,
    spec: ChunkSpec,
) -> Result<Vec<TimeInterval>, WavefetchError> {
    let Some(length_in_sec) = spec.length_in_sec else {
        return Ok(vec![window]);
    };
    if length_in_sec == 0 {
        return Err(WavefetchError::InvalidChunkLength);
    }
    // An overlap at least as long as the chunk would keep the cursor from
    // advancing.
    if spec.overlap_in_sec >= length_in_sec {
        return Err(WavefetchError::NonAdvancingChunk {
            length_in_sec,
            overlap_in_sec: spec.overlap_in_sec,
        });
    }

    let length = duration_secs(length_in_sec)?;
    let step = duration_secs(length_in_sec - spec.overlap_in_sec)?;

    let mut chunks = Vec::new();
    let mut cursor = window.start;
    while cursor + length <= window.end {
        chunks.push(TimeInterval {
            start: cursor,
            end: cursor + length,
        });
        cursor += step;
    }
    if cursor < window.end {
        chunks.push(TimeInterval {
            start: cursor,
            end: window.end,
        });
    }
    Ok(chunks)
}

fn duration_secs(secs: u64) -> Result<Duration, WavefetchError> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or(WavefetchError::InvalidChunkLength)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::domain::parse_instant;

    fn at(value: &str) -> DateTime<Utc> {
        parse_instant(value).unwrap()
    }

    fn two_hours() -> TimeInterval {
        TimeInterval::new(at("2019-04-23T00:00:00"), at("2019-04-23T02:00:00")).unwrap()
    }

    #[test]
    fn no_length_yields_single_interval() {
        let chunks = chunk_interval(two_hours(), ChunkSpec::default()).unwrap();
        assert_eq!(chunks, vec![two_hours()]);
    }

    #[test]
    fn zero_length_is_rejected() {
        let err = chunk_interval(two_hours(), ChunkSpec::new(Some(0), 0)).unwrap_err();
        assert_matches!(err, WavefetchError::InvalidChunkLength);
    }

    #[test]
    fn overlap_reaching_length_is_rejected() {
        let err = chunk_interval(two_hours(), ChunkSpec::new(Some(3600), 3600)).unwrap_err();
        assert_matches!(
            err,
            WavefetchError::NonAdvancingChunk {
                length_in_sec: 3600,
                overlap_in_sec: 3600,
            }
        );
    }

    #[test]
    fn hourly_chunks_without_overlap() {
        let chunks = chunk_interval(two_hours(), ChunkSpec::new(Some(3600), 0)).unwrap();
        assert_eq!(
            chunks,
            vec![
                TimeInterval::new(at("2019-04-23T00:00:00"), at("2019-04-23T01:00:00")).unwrap(),
                TimeInterval::new(at("2019-04-23T01:00:00"), at("2019-04-23T02:00:00")).unwrap(),
            ]
        );
    }

    #[test]
    fn overlapping_chunks_cover_remainder() {
        let chunks = chunk_interval(two_hours(), ChunkSpec::new(Some(3600), 900)).unwrap();
        assert_eq!(
            chunks,
            vec![
                TimeInterval::new(at("2019-04-23T00:00:00"), at("2019-04-23T01:00:00")).unwrap(),
                TimeInterval::new(at("2019-04-23T00:45:00"), at("2019-04-23T01:45:00")).unwrap(),
                TimeInterval::new(at("2019-04-23T01:30:00"), at("2019-04-23T02:00:00")).unwrap(),
            ]
        );
    }

    #[test]
    fn length_beyond_window_degenerates_to_full_interval() {
        let chunks = chunk_interval(two_hours(), ChunkSpec::new(Some(86_400), 0)).unwrap();
        assert_eq!(chunks, vec![two_hours()]);
    }

    #[test]
    fn chunks_are_contiguous_and_cover_the_window() {
        let window = two_hours();
        let chunks = chunk_interval(window, ChunkSpec::new(Some(1700), 0)).unwrap();
        assert_eq!(chunks.first().unwrap().start, window.start);
        assert_eq!(chunks.last().unwrap().end, window.end);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }
}
