use std::fmt::Write;

use anyhow::Result;
use rotary_lib::ThrottleStatsMap;
use serde::Serialize;

use crate::options::StatsFormat;

/// Counters of one run, printed after all requests are done
#[derive(Debug, Default, Serialize)]
pub(crate) struct RunSummary {
    pub(crate) requests: usize,
    pub(crate) succeeded: usize,
    pub(crate) failed: usize,
    /// Identities in the pool at the end of the run
    pub(crate) clients: usize,
    /// Pool generation at the end of the run
    pub(crate) generation: u64,
    pub(crate) throttles: ThrottleStatsMap,
}

pub(crate) fn format(summary: &RunSummary, format: StatsFormat) -> Result<String> {
    match format {
        StatsFormat::Json => Ok(serde_json::to_string_pretty(summary)?),
        StatsFormat::Compact => Ok(compact(summary)),
    }
}

fn compact(summary: &RunSummary) -> String {
    let mut out = format!(
        "{} requests ({} ok, {} failed) through {} clients, generation {}\n",
        summary.requests, summary.succeeded, summary.failed, summary.clients, summary.generation
    );
    if summary.throttles.is_empty() {
        return out;
    }
    out.push_str("\nThrottles:\n");
    for (key, stats) in summary.throttles.sorted() {
        // Writing to a String can't fail
        let _ = writeln!(out, "  {key}: {}", stats.summary());
    }
    out
}
