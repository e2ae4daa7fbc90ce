//! Fixed-window interval counter.
//!
//! A window of length `interval` starts on the first increment after a reset and stays open
//! until `window_start + interval < now` (strictly), at which point the next admitted item
//! starts a brand-new window. Bursts at window boundaries are accepted behavior.
//!
//! The serialized form is the persisted counter document:
//!
//! ```json
//! {"windowStart":"2024-10-17T12:32:12Z","count":44}
//! ```
//!
//! An unset window is written as `0001-01-01T00:00:00Z`.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

pub mod store;

pub use store::{CounterStore, InMemoryCounterStore, JsonFileStore, JsonFileStoreBuilder};

/// Counts admitted items within the current window.
///
/// Invariant: `count == 0` whenever the window is unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PersistedCounter")]
pub struct IntervalCounter {
    #[serde(rename = "windowStart", serialize_with = "window_start::serialize")]
    window_start: Option<DateTime<Utc>>,
    count: u32,
}

#[derive(Deserialize)]
struct PersistedCounter {
    #[serde(rename = "windowStart", deserialize_with = "window_start::deserialize")]
    window_start: Option<DateTime<Utc>>,
    count: u32,
}

impl From<PersistedCounter> for IntervalCounter {
    fn from(raw: PersistedCounter) -> Self {
        Self::from_parts(raw.window_start, raw.count)
    }
}

impl IntervalCounter {
    /// An empty counter with an unset window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a counter from persisted parts. A `count` without a window start is dropped
    /// to keep the invariant.
    pub fn from_parts(window_start: Option<DateTime<Utc>>, count: u32) -> Self {
        match window_start {
            Some(start) => Self { window_start: Some(start), count },
            None => Self::default(),
        }
    }

    /// Start of the current window, `None` when unset.
    pub fn window_start(&self) -> Option<DateTime<Utc>> {
        self.window_start
    }

    /// Items admitted in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// End of the current window, i.e. the first instant at which a trailing action for
    /// this window may run.
    pub fn window_end(&self, interval: TimeDelta) -> Option<DateTime<Utc>> {
        self.window_start.and_then(|start| start.checked_add_signed(interval))
    }

    /// `true` iff `window_start + interval < now`. An unset window is always expired.
    pub fn check_expired(&self, interval: TimeDelta, now: DateTime<Utc>) -> bool {
        match self.window_start {
            None => true,
            // saturate: a window that cannot end never expires
            Some(_) => self.window_end(interval).is_some_and(|end| end < now),
        }
    }

    /// Clear window start and count.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Count one item, opening the window at `now` if unset.
    pub fn increment(&mut self, now: DateTime<Utc>) {
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.count = self.count.saturating_add(1);
    }

    /// Whether one more item may be admitted at `now`.
    ///
    /// An expired window always admits; otherwise `count < limit`. A `limit <= 0` never
    /// admits.
    pub fn can_increment(&self, interval: TimeDelta, now: DateTime<Utc>, limit: i64) -> bool {
        if limit <= 0 {
            return false;
        }
        if self.check_expired(interval, now) {
            return true;
        }
        i64::from(self.count) < limit
    }

    /// Reset if expired, then increment.
    pub fn increment_interval_aware(&mut self, interval: TimeDelta, now: DateTime<Utc>) {
        if self.check_expired(interval, now) {
            self.reset();
        }
        self.increment(now);
    }
}

mod window_start {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub(super) fn unset_sentinel() -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(1, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let instant = value.unwrap_or_else(unset_sentinel);
        serializer.serialize_str(&instant.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let instant = parse(&raw).ok_or_else(|| {
            de::Error::invalid_value(de::Unexpected::Str(&raw), &"an ISO-8601 timestamp")
        })?;
        Ok((instant > unset_sentinel()).then_some(instant))
    }

    // Timestamps without an offset are taken as UTC.
    fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok().map(|naive| naive.and_utc())
    }
}
