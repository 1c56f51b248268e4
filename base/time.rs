// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Wall-clock times and durations for the recording catalog.
//!
//! Catalog timestamps are whole seconds since the Unix epoch, UTC. Media
//! timestamps inside segment files use a 90 kHz timescale and are handled by
//! the muxer, not these types.

use crate::{bail, err, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops;
use std::str::FromStr;

/// Units per second of the media timescale used within segment files.
pub const TIME_UNITS_PER_SEC: i64 = 90_000;

/// A wall-clock time as whole seconds since 1970-01-01 00:00:00 UTC.
#[derive(Clone, Copy, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Time(pub i64);

impl Time {
    pub const MIN: Self = Time(i64::MIN);
    pub const MAX: Self = Time(i64::MAX);

    /// Parses either an integer number of seconds since epoch or an RFC
    /// 3339-ish timestamp such as `2006-01-02T15:04:05Z`. A timestamp without
    /// an offset is interpreted as UTC.
    pub fn parse(input: &str) -> Result<Self, Error> {
        if let Ok(i) = i64::from_str(input) {
            return Ok(Time(i));
        }
        if let Ok(ts) = jiff::Timestamp::from_str(input) {
            return Ok(Time(ts.as_second()));
        }
        let Ok(dt) = jiff::civil::DateTime::from_str(input) else {
            bail!(InvalidArgument, msg("unparseable time {input:?}"));
        };
        let zoned = dt
            .to_zoned(jiff::tz::TimeZone::UTC)
            .map_err(|e| err!(InvalidArgument, msg("unparseable time {input:?}"), source(e)))?;
        Ok(Time(zoned.timestamp().as_second()))
    }

    pub fn checked_sub(self, rhs: Duration) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Time)
    }
}

impl ops::Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl ops::Sub for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::Sub<Duration> for Time {
    type Output = Time;
    fn sub(self, rhs: Duration) -> Time {
        Time(self.0 - rhs.0)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match jiff::Timestamp::from_second(self.0) {
            Ok(ts) => write!(f, "{ts}"),
            Err(_) => write!(f, "{}s", self.0),
        }
    }
}

/// A span of wall-clock time in whole seconds. May be negative.
#[derive(Clone, Copy, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Duration(pub i64);

impl Duration {
    pub const fn from_secs(secs: i64) -> Self {
        Duration(secs)
    }

    pub const fn from_days(days: i64) -> Self {
        Duration(days * 86_400)
    }

    pub fn as_secs(self) -> i64 {
        self.0
    }
}

impl ops::Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl ops::AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

impl ops::Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Duration) {
        self.0 -= rhs.0
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut seconds = self.0;
        if seconds < 0 {
            write!(f, "-")?;
            seconds = -seconds;
        }
        let (days, seconds) = (seconds / 86_400, seconds % 86_400);
        let (hours, seconds) = (seconds / 3_600, seconds % 3_600);
        let (minutes, seconds) = (seconds / 60, seconds % 60);
        let mut have_written = false;
        for (value, suffix) in [(days, "d"), (hours, "h"), (minutes, "m"), (seconds, "s")] {
            if value != 0 || (suffix == "s" && !have_written) {
                write!(f, "{}{value}{suffix}", if have_written { " " } else { "" })?;
                have_written = true;
            }
        }
        Ok(())
    }
}
