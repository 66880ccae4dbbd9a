//! Newline-delimited JSON monitor feed

use std::io::BufRead;

use eyre::{Context, Result};
use tracing::{debug, warn};

use crate::dispatch::DispatchHandle;
use crate::value::Payload;

/// Counters from one pass over a feed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub lines: u64,
    pub delivered: u64,
    pub malformed: u64,
}

/// Deliver every `{"path": ..., "value": ...}` line of `reader`
///
/// Blank lines are skipped and malformed lines are logged and counted.
/// Fails only on a read error or once the dispatcher has gone away.
pub fn read_feed<R: BufRead>(reader: R, handle: &DispatchHandle) -> Result<FeedStats> {
    let mut stats = FeedStats::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read feed")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        stats.lines += 1;

        let payload: Payload = match serde_json::from_str(line) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping malformed feed line");
                stats.malformed += 1;
                continue;
            }
        };

        if payload.is_status() && !payload.value.is_object() {
            warn!(line = index + 1, "Skipping status payload that is not a mapping");
            stats.malformed += 1;
            continue;
        }

        handle.deliver(payload)?;
        stats.delivered += 1;
    }

    debug!(?stats, "read_feed: input exhausted");
    Ok(stats)
}
