//! Lexicographically sortable event ids.
//!
//! A [`SortableUniqueId`] is 30 ASCII digits: a 19-digit tick count (100 ns
//! ticks since 0001-01-01T00:00:00Z) followed by an 11-digit distinguisher
//! taken from a UUID. Because the width is fixed, string order equals
//! (timestamp, distinguisher) order, and the id is safe to embed in URLs and
//! storage keys as-is.

use core::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{DomainError, DomainResult};

const TICK_DIGITS: usize = 19;
const DISTINGUISHER_DIGITS: usize = 11;
const DISTINGUISHER_MODULUS: u128 = 100_000_000_000;
const TICKS_PER_SECOND: i128 = 10_000_000;
const NANOS_PER_TICK: i128 = 100;
/// Ticks between 0001-01-01 and the unix epoch.
const UNIX_EPOCH_TICKS: i128 = 621_355_968_000_000_000;
const MAX_TICKS: i128 = 9_999_999_999_999_999_999;

/// Total length of the textual form.
pub const SORTABLE_ID_LENGTH: usize = TICK_DIGITS + DISTINGUISHER_DIGITS;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SortableUniqueId(String);

impl SortableUniqueId {
    /// Build an id for `timestamp`, using `distinguisher` to break ties between
    /// ids that land in the same tick.
    pub fn generate(timestamp: DateTime<Utc>, distinguisher: Uuid) -> Self {
        let ticks = to_ticks(timestamp);
        let suffix = distinguisher.as_u128() % DISTINGUISHER_MODULUS;
        Self(format!("{ticks:019}{suffix:011}"))
    }

    /// Id for "now" with a random distinguisher.
    pub fn generate_now() -> Self {
        Self::generate(Utc::now(), Uuid::new_v4())
    }

    /// The safe-window boundary for `now`.
    ///
    /// Events whose id is `<=` the returned value are old enough that no
    /// concurrent writer can still commit an event that sorts before them.
    /// The nil distinguisher makes the threshold sort before every real id of
    /// the same tick.
    pub fn safe_window_threshold(now: DateTime<Utc>, window: Duration) -> Self {
        let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        let at = now
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self::generate(at, Uuid::nil())
    }

    /// Parse and validate an id received from outside the process.
    pub fn parse(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        if value.len() != SORTABLE_ID_LENGTH {
            return Err(DomainError::invalid_id(format!(
                "sortable id must be {SORTABLE_ID_LENGTH} digits, got {} characters",
                value.len()
            )));
        }
        if !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::invalid_id(format!(
                "sortable id must contain only digits: {value}"
            )));
        }
        Ok(Self(value))
    }

    /// Lowest possible id; sorts before every generated id.
    pub fn min_value() -> Self {
        Self("0".repeat(SORTABLE_ID_LENGTH))
    }

    /// Highest possible id; sorts after every generated id.
    pub fn max_value() -> Self {
        Self("9".repeat(SORTABLE_ID_LENGTH))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn ticks(&self) -> u64 {
        self.0[..TICK_DIGITS].parse().unwrap_or(0)
    }

    /// The instant encoded in the tick part (100 ns resolution).
    pub fn timestamp(&self) -> DateTime<Utc> {
        let since_epoch = i128::from(self.ticks()) - UNIX_EPOCH_TICKS;
        let secs = since_epoch.div_euclid(TICKS_PER_SECOND);
        let nanos = since_epoch.rem_euclid(TICKS_PER_SECOND) * NANOS_PER_TICK;
        i64::try_from(secs)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, nanos as u32))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn earlier_than(&self, other: &SortableUniqueId) -> bool {
        self < other
    }

    pub fn later_than(&self, other: &SortableUniqueId) -> bool {
        self > other
    }

    pub fn is_earlier_than_or_equal(&self, threshold: &SortableUniqueId) -> bool {
        self <= threshold
    }

    pub fn is_later_than_or_equal(&self, threshold: &SortableUniqueId) -> bool {
        self >= threshold
    }

    /// The next id in sort order; saturates at [`SortableUniqueId::max_value`].
    fn successor(&self) -> Self {
        let current: u128 = self.0.parse().unwrap_or(0);
        let limit = 10u128.pow(SORTABLE_ID_LENGTH as u32) - 1;
        let next = if current >= limit { limit } else { current + 1 };
        Self(format!("{next:030}"))
    }
}

fn to_ticks(timestamp: DateTime<Utc>) -> u64 {
    let ticks = i128::from(timestamp.timestamp()) * TICKS_PER_SECOND
        + i128::from(timestamp.timestamp_subsec_nanos()) / NANOS_PER_TICK
        + UNIX_EPOCH_TICKS;
    ticks.clamp(0, MAX_TICKS) as u64
}

impl core::fmt::Display for SortableUniqueId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SortableUniqueId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SortableUniqueId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SortableUniqueId> for String {
    fn from(value: SortableUniqueId) -> Self {
        value.0
    }
}

impl AsRef<str> for SortableUniqueId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Issues strictly increasing ids for every write made by this process.
///
/// Two ids requested in the same tick (or after the clock stepped backwards)
/// would otherwise only be ordered by their random distinguisher; the
/// generator bumps such ids past the last one it handed out so that writes
/// made one after another by this process sort in the order they were made.
#[derive(Debug)]
pub struct SortableIdGenerator {
    clock: Arc<dyn Clock>,
    last: Mutex<Option<SortableUniqueId>>,
}

impl SortableIdGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: Mutex::new(None),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn next_id(&self) -> SortableUniqueId {
        let candidate = SortableUniqueId::generate(self.clock.now(), Uuid::new_v4());
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = match last.as_ref() {
            Some(previous) if candidate <= *previous => previous.successor(),
            _ => candidate,
        };
        *last = Some(id.clone());
        id
    }
}
