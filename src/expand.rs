use tracing::info;

use crate::domain::StationEntry;
use crate::error::WavefetchError;
use crate::fdsn::StationLookup;
use crate::restrictions::DownloadRestrictions;
use crate::sink::StorageLayout;

pub const SECONDS_PER_DAY: u64 = 86_400;

/// The result of expanding one coarse restriction: the resolved inventory
/// and one concrete per-station restriction per entry, in inventory order.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub stations: Vec<StationEntry>,
    pub restrictions: Vec<DownloadRestrictions>,
}

/// Resolve the coarse selection against the station service and derive one
/// concrete restriction per station. A lookup failure aborts the whole
/// expansion.
pub fn expand(
    lookup: &dyn StationLookup,
    coarse: &DownloadRestrictions,
) -> Result<Expansion, WavefetchError> {
    let stations =
        lookup.resolve_stations(&coarse.selection, &coarse.window, coarse.domain.as_ref())?;
    info!(
        selection = %coarse.selection,
        stations = stations.len(),
        "resolved station inventory"
    );
    let restrictions = stations
        .iter()
        .map(|entry| coarse.for_station(&entry.network, &entry.station))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Expansion {
        stations,
        restrictions,
    })
}

/// Daily storage layouts name one file per calendar day, so a window or
/// chunk shorter than a day would write two chunks to the same path. Checked
/// before any fetch begins.
pub fn check_storage_granularity(
    layout: &StorageLayout,
    restrictions: &DownloadRestrictions,
) -> Result<(), WavefetchError> {
    if !layout.requires_daily_files() {
        return Ok(());
    }
    let span = restrictions.window.span().num_seconds();
    if span < SECONDS_PER_DAY as i64 {
        return Err(WavefetchError::IncompatibleStorageGranularity(format!(
            "window span {span}s is shorter than one day"
        )));
    }
    if let Some(length) = restrictions.chunking.length_in_sec {
        if length < SECONDS_PER_DAY {
            return Err(WavefetchError::IncompatibleStorageGranularity(format!(
                "chunk length {length}s is shorter than one day"
            )));
        }
    }
    Ok(())
}
