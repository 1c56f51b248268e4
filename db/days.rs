// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! In-memory index of calendar days with at least one complete recording.
//!
//! Days are UTC. Catalog timestamps are UTC seconds, and a UTC day is exactly
//! 86,400 seconds, so day arithmetic here is integral; `jiff` is used only to
//! turn a day start into its `YYYY-mm-dd` key.

use base::time::{Duration, Time};
use std::collections::BTreeMap;
use std::io::Write as _;
use std::ops::Range;
use std::str;

const DAY_SECS: i64 = 86_400;

/// A calendar day in `YYYY-mm-dd` format.
#[derive(Copy, Clone, Eq, Ord, PartialEq, PartialOrd)]
pub struct Key(pub(crate) [u8; 10]);

impl Key {
    fn new(day_start: Time) -> Self {
        let ts = jiff::Timestamp::from_second(day_start.0)
            .expect("day starts are representable timestamps");
        let date = ts.to_zoned(jiff::tz::TimeZone::UTC).date();
        let mut s = Key([0u8; 10]);
        write!(
            &mut s.0[..],
            "{:04}-{:02}-{:02}",
            date.year(),
            date.month(),
            date.day()
        )
        .expect("day keys are exactly ten bytes");
        s
    }

    /// The UTC time range this day covers.
    pub fn bounds(&self) -> Range<Time> {
        let date: jiff::civil::Date = self.as_ref().parse().expect("days must be parseable");
        let start = date
            .to_zoned(jiff::tz::TimeZone::UTC)
            .expect("UTC has no gaps")
            .timestamp()
            .as_second();
        Time(start)..Time(start + DAY_SECS)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        str::from_utf8(&self.0[..]).expect("days are always UTF-8")
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.as_ref())
    }
}

/// State about one stream-day (or all-streams-day).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Value {
    /// The number of recordings that overlap with this day.
    pub recordings: i64,

    /// The total duration recorded on this day. Can be 0 for a recording that
    /// ended within the same second it started.
    pub duration: Duration,
}

fn floor_day(t: Time) -> Time {
    Time(t.0 - t.0.rem_euclid(DAY_SECS))
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Map(pub(crate) BTreeMap<Key, Value>);

impl Map {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, k: &Key) -> Option<&Value> {
        self.0.get(k)
    }

    /// The day keys in ascending order, as owned strings.
    pub fn keys(&self) -> Vec<String> {
        self.0.keys().map(|k| k.as_ref().to_owned()).collect()
    }

    /// Applies a recording spanning `r` with weight `sign` (+1 insert, -1
    /// remove). Every UTC day the span overlaps is counted once, with the
    /// overlapping portion of the duration.
    pub fn adjust(&mut self, r: Range<Time>, sign: i64) {
        assert!(r.end >= r.start, "reversed range {r:?}");
        let mut day_start = floor_day(r.start);
        loop {
            let next = day_start + Duration(DAY_SECS);
            let overlap_start = std::cmp::max(r.start, day_start);
            let overlap_end = std::cmp::min(r.end, next);
            self.adjust_day(
                Key::new(day_start),
                sign,
                Duration(sign * (overlap_end - overlap_start).0),
            );
            if r.end <= next {
                break;
            }
            day_start = next;
        }
    }

    /// Adds `delta` to the given day. Inserts a map entry if absent; removes
    /// the entry if it has no recordings left on exit.
    fn adjust_day(&mut self, day: Key, recordings: i64, duration: Duration) {
        use std::collections::btree_map::Entry;
        match self.0.entry(day) {
            Entry::Vacant(e) => {
                let v = e.insert(Value::default());
                v.recordings += recordings;
                v.duration += duration;
            }
            Entry::Occupied(mut e) => {
                let v = e.get_mut();
                v.recordings += recordings;
                v.duration += duration;
                debug_assert!(
                    v.recordings >= 0 && v.duration >= Duration(0),
                    "negative accounting for {day:?}: {v:?}"
                );
                if v.recordings <= 0 {
                    e.remove();
                }
            }
        }
    }
}
