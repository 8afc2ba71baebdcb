use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use serde::ser::SerializeStruct;

use super::ThrottleKey;

/// A [`BTreeMap`] mapping throttle keys to their [`ThrottleStats`]
#[derive(Debug, Default)]
pub struct ThrottleStatsMap(BTreeMap<ThrottleKey, ThrottleStats>);

impl ThrottleStatsMap {
    /// Sort throttles by admitted request count (descending order)
    #[must_use]
    pub fn sorted(&self) -> Vec<(&ThrottleKey, &ThrottleStats)> {
        let mut sorted: Vec<_> = self.0.iter().collect();
        sorted.sort_by_key(|(_, stats)| std::cmp::Reverse(stats.admitted));
        sorted
    }

    /// Statistics of a single throttle
    #[must_use]
    pub fn get(&self, key: &ThrottleKey) -> Option<&ThrottleStats> {
        self.0.get(key)
    }

    /// Number of live throttles
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no throttle is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(ThrottleKey, ThrottleStats)> for ThrottleStatsMap {
    fn from_iter<I: IntoIterator<Item = (ThrottleKey, ThrottleStats)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for ThrottleStatsMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_map(self.0.iter().map(|(key, stats)| (key.to_string(), stats)))
    }
}

/// Point-in-time statistics of one throttle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottleStats {
    /// Current admissions-per-second ceiling
    pub current_rps: u32,
    /// Whether the throttle is banned
    pub banned: bool,
    /// Time left until the ban ends
    pub ban_remaining: Option<Duration>,
    /// Callers currently queued for admission
    pub pending: usize,
    /// Total admitted requests
    pub admitted: u64,
    /// Reported successful requests
    pub successes: u64,
    /// Reported failed requests
    pub failures: u64,
}

impl ThrottleStats {
    /// Get the current success rate (0.0 to 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let reported = self.successes + self.failures;
        if reported == 0 {
            1.0 // Assume success until proven otherwise
        } else {
            #[allow(clippy::cast_precision_loss)]
            let success_rate = self.successes as f64 / reported as f64;
            success_rate
        }
    }

    /// Get human-readable summary of the stats
    #[must_use]
    pub fn summary(&self) -> String {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let success_pct = (self.success_rate() * 100.0) as u64;
        let ban = match (self.banned, self.ban_remaining) {
            (true, Some(remaining)) if !remaining.is_zero() => {
                format!(", banned for {}s", remaining.as_secs())
            }
            (true, _) => ", banned".to_string(),
            (false, _) => String::new(),
        };

        format!(
            "{} rps, {} admitted ({}% success){}",
            self.current_rps, self.admitted, success_pct, ban
        )
    }
}

impl Serialize for ThrottleStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let ban_remaining_ms = self.ban_remaining.map(|d| d.as_millis());

        let mut s = serializer.serialize_struct("ThrottleStats", 8)?;
        s.serialize_field("current_rps", &self.current_rps)?;
        s.serialize_field("banned", &self.banned)?;
        s.serialize_field("ban_remaining_ms", &ban_remaining_ms)?;
        s.serialize_field("pending", &self.pending)?;
        s.serialize_field("admitted", &self.admitted)?;
        s.serialize_field("successes", &self.successes)?;
        s.serialize_field("failures", &self.failures)?;
        s.serialize_field("success_rate", &self.success_rate())?;
        s.end()
    }
}
