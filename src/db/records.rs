//! Read path for stored records.

use super::{keys, Store};
use crate::model::DoodleRecord;
use anyhow::Result;
use tracing::{instrument, warn};

/// Records of `filter` in append (chronological) order. Entries that fail to
/// parse are skipped with a warning.
#[instrument(skip_all)]
pub async fn read_records(
    store: &dyn Store,
    filter: &str,
    start: i64,
    stop: i64,
) -> Result<Vec<DoodleRecord>> {
    let key = keys::records(filter);
    let raw = store.range(&key, start, stop).await?;
    let records = raw
        .iter()
        .enumerate()
        .filter_map(|(i, body)| match serde_json::from_str::<DoodleRecord>(body) {
            Ok(rec) => Some(rec),
            Err(err) => {
                warn!(%key, position = i, %err, "skipping malformed stored record");
                None
            }
        })
        .collect();
    Ok(records)
}
