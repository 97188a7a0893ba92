//! Tournament week schedule and phase clock.
//!
//! A [`TournamentWeek`] owns four ordered boundary timestamps. The current
//! [`Phase`] is never stored anywhere: it is a pure function of a week's
//! boundaries and a single observed instant, so every reader that evaluates
//! the same `(week, now)` pair agrees on the phase. Boundary instants are
//! half-open on the start side: the instant equal to a boundary already
//! belongs to the new phase.
//!
//! Weeks are produced ahead of time by a [`WeekSchedule`] generator anchored
//! at a genesis instant; once written to the ledger a week's boundaries are
//! immutable.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when constructing week schedules.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ScheduleError {
    /// The boundary chain is not monotonically ordered.
    #[error(
        "week {week} has invalid bounds: {first} must not be after {second} ({first_at} > {second_at})"
    )]
    InvalidBounds {
        /// The offending week number.
        week: u64,
        /// Name of the earlier boundary.
        first: &'static str,
        /// Name of the later boundary.
        second: &'static str,
        /// Value of the earlier boundary.
        first_at: DateTime<Utc>,
        /// Value of the later boundary.
        second_at: DateTime<Utc>,
    },

    /// A configured duration does not fit in the chrono range.
    #[error("schedule duration out of range: {0}")]
    DurationOutOfRange(String),
}

/// Source of the current instant.
///
/// The scheduler and phase clock read the clock exactly once per decision
/// through this trait, which keeps phase evaluation consistent within a pass
/// and lets tests pin time.
pub trait TimeSource: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Production time source backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Temporal phase of a tournament week, derived from `(week, now)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Before registration opens.
    Upcoming,
    /// Registration window is open.
    Registration,
    /// Matches count toward the weekly standings.
    PointCollection,
    /// The week is over; standings are final once synced.
    Ended,
}

impl Phase {
    /// Returns the phase as a lowercase string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Upcoming => "upcoming",
            Self::Registration => "registration",
            Self::PointCollection => "point_collection",
            Self::Ended => "ended",
        }
    }

    /// Whether score reconciliation should run during this phase.
    ///
    /// Results only accumulate from point collection onward, so earlier
    /// phases never trigger chain writes.
    #[must_use]
    pub const fn is_syncable(&self) -> bool {
        matches!(self, Self::PointCollection | Self::Ended)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tournament week with its four boundary instants.
///
/// Invariant (checked at construction): `registration_start <=
/// registration_end <= point_collection_start <= point_collection_end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TournamentWeek {
    /// Increasing week number.
    pub week: u64,
    /// When registration opens.
    pub registration_start: DateTime<Utc>,
    /// When registration closes.
    pub registration_end: DateTime<Utc>,
    /// When match results start counting.
    pub point_collection_start: DateTime<Utc>,
    /// When the week ends.
    pub point_collection_end: DateTime<Utc>,
}

impl TournamentWeek {
    /// Creates a week, validating the boundary chain.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::InvalidBounds`] if any boundary precedes the
    /// one before it.
    pub fn new(
        week: u64,
        registration_start: DateTime<Utc>,
        registration_end: DateTime<Utc>,
        point_collection_start: DateTime<Utc>,
        point_collection_end: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let chain = [
            ("registration_start", registration_start),
            ("registration_end", registration_end),
            ("point_collection_start", point_collection_start),
            ("point_collection_end", point_collection_end),
        ];
        for pair in chain.windows(2) {
            let (first, first_at) = pair[0];
            let (second, second_at) = pair[1];
            if first_at > second_at {
                return Err(ScheduleError::InvalidBounds {
                    week,
                    first,
                    second,
                    first_at,
                    second_at,
                });
            }
        }

        Ok(Self {
            week,
            registration_start,
            registration_end,
            point_collection_start,
            point_collection_end,
        })
    }

    /// Classifies `now` into this week's phase.
    ///
    /// Total over all instants; boundaries are half-open on the start side,
    /// so `now == registration_end` is already `PointCollection`.
    ///
    /// Note the point-collection window opens at `registration_end`, not at
    /// `point_collection_start`: a gap between the two belongs to the
    /// collection phase rather than to a fifth, unnamed phase.
    #[must_use]
    pub fn phase_at(&self, now: DateTime<Utc>) -> Phase {
        if now < self.registration_start {
            Phase::Upcoming
        } else if now < self.registration_end {
            Phase::Registration
        } else if now < self.point_collection_end {
            Phase::PointCollection
        } else {
            Phase::Ended
        }
    }
}

/// Generator deriving week boundaries from a genesis instant.
///
/// Week `n` starts `n * week_length` after genesis; within a week the
/// registration window runs for `registration_length`, and point collection
/// ends when the week does. The generator is deterministic, so re-deriving a
/// week that is already persisted always yields identical boundaries.
#[derive(Debug, Clone)]
pub struct WeekSchedule {
    genesis: DateTime<Utc>,
    week_length: Duration,
    registration_length: Duration,
}

impl WeekSchedule {
    /// Creates a schedule generator.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::DurationOutOfRange`] if the registration
    /// window does not fit inside the week, or a duration overflows chrono's
    /// range.
    pub fn new(
        genesis: DateTime<Utc>,
        week_length: Duration,
        registration_length: Duration,
    ) -> Result<Self, ScheduleError> {
        if registration_length >= week_length {
            return Err(ScheduleError::DurationOutOfRange(format!(
                "registration window ({}) must be shorter than the week ({})",
                humantime::format_duration(registration_length),
                humantime::format_duration(week_length),
            )));
        }
        // Surface chrono conversion failures at construction, not per week.
        chrono::Duration::from_std(week_length)
            .and_then(|_| chrono::Duration::from_std(registration_length))
            .map_err(|e| ScheduleError::DurationOutOfRange(e.to_string()))?;

        Ok(Self {
            genesis,
            week_length,
            registration_length,
        })
    }

    /// Derives the boundaries of week `week`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::DurationOutOfRange`] if the offset from
    /// genesis overflows.
    pub fn week(&self, week: u64) -> Result<TournamentWeek, ScheduleError> {
        let week_len = chrono::Duration::from_std(self.week_length)
            .map_err(|e| ScheduleError::DurationOutOfRange(e.to_string()))?;
        let reg_len = chrono::Duration::from_std(self.registration_length)
            .map_err(|e| ScheduleError::DurationOutOfRange(e.to_string()))?;

        let offset = week_len
            .checked_mul(i32::try_from(week).map_err(|_| {
                ScheduleError::DurationOutOfRange(format!("week {week} offset overflows"))
            })?)
            .ok_or_else(|| {
                ScheduleError::DurationOutOfRange(format!("week {week} offset overflows"))
            })?;

        let start = self.genesis + offset;
        let registration_end = start + reg_len;
        let end = start + week_len;

        TournamentWeek::new(week, start, registration_end, registration_end, end)
    }

    /// The week number whose window contains `now`, if any.
    ///
    /// Returns `None` before genesis.
    #[must_use]
    pub fn week_index_at(&self, now: DateTime<Utc>) -> Option<u64> {
        if now < self.genesis {
            return None;
        }
        let elapsed = (now - self.genesis).num_seconds().max(0) as u64;
        let len = self.week_length.as_secs();
        if len == 0 { None } else { Some(elapsed / len) }
    }
}
