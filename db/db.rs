// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The recording catalog: durable metadata about segment files on disk.
//!
//! The [`Database`] struct serializes all access behind a single global lock,
//! making the assumption that only one process accesses the catalog at a
//! time. Writes are individual transactions rather than batches: the
//! `is_complete` update at segment close is the commit barrier every other
//! component relies on, so it must not sit in an in-memory queue.
//!
//! Queries here feature no row callbacks held over long operations; rows are
//! materialized and the lock released. The only filesystem access under the
//! lock is the bounded existence scan in [`LockedCatalog::orphan_candidates`].

use crate::days;
use crate::raw;
use base::time::Time;
use base::{bail, err, Error, ErrorKind, ResultExt as _};
use std::ops::Range;
use std::path::Path;
use std::sync::MutexGuard;
use tracing::{info, warn};

/// Expected schema version, stored in the `meta` table.
pub const EXPECTED_SCHEMA_VERSION: i32 = 1;

pub const MAX_STREAM_NAME_LEN: usize = 64;
pub const MAX_CODEC_LEN: usize = 16;
pub const MAX_PATH_LEN: usize = 4096;

/// Why a recording exists.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TriggerKind {
    /// Continuous recording.
    Scheduled,

    /// An object-detection event.
    Detection,

    /// ONVIF motion.
    Motion,

    /// User-started.
    Manual,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Detection => "detection",
            TriggerKind::Motion => "motion",
            TriggerKind::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "scheduled" => TriggerKind::Scheduled,
            "detection" => TriggerKind::Detection,
            "motion" => TriggerKind::Motion,
            "manual" => TriggerKind::Manual,
            _ => return None,
        })
    }
}

/// Metadata for a new, incomplete recording row.
#[derive(Clone, Debug)]
pub struct RecordingToInsert {
    pub stream_name: String,
    pub file_path: String,
    pub start_time: Time,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
    pub trigger: TriggerKind,
}

/// A catalog row.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingRow {
    pub id: i64,
    pub stream_name: String,
    pub file_path: Option<String>,
    pub start_time: Time,
    pub end_time: Option<Time>,
    pub size_bytes: i64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
    pub is_complete: bool,
    pub trigger: TriggerKind,
    pub protected: bool,
    pub retention_override_days: Option<i64>,
}

/// An object-detection event posted by the external detection service.
#[derive(Clone, Debug)]
pub struct DetectionEvent {
    pub stream_name: String,
    pub timestamp: Time,
    pub label: String,
    pub confidence: f64,
    pub track_id: Option<i64>,
    pub zone_id: Option<i64>,
}

/// Filter for [`LockedCatalog::list_recordings`]. Only complete recordings are
/// ever returned.
#[derive(Clone, Debug, Default)]
pub struct ListFilter {
    pub stream: Option<String>,
    pub time: Option<Range<Time>>,

    /// Restrict to recordings that are detection-triggered or span at least
    /// one detection event.
    pub has_detection: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SortField {
    Id,
    StreamName,
    StartTime,
    EndTime,
    SizeBytes,
}

impl SortField {
    /// The column name spliced into `order by`. Fixed strings only; this is
    /// the sole path from a sort request to SQL text.
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            SortField::Id => "id",
            SortField::StreamName => "stream_name",
            SortField::StartTime => "start_time",
            SortField::EndTime => "end_time",
            SortField::SizeBytes => "size_bytes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "id" => SortField::Id,
            "stream_name" => SortField::StreamName,
            "start_time" => SortField::StartTime,
            "end_time" => SortField::EndTime,
            "size_bytes" => SortField::SizeBytes,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "asc" => SortOrder::Asc,
            "desc" => SortOrder::Desc,
            _ => return None,
        })
    }
}

/// Validates requested sort parameters against the whitelist, clamping
/// anything unrecognized to `start_time desc` with a logged warning.
pub fn clamped_sort(field: &str, order: &str) -> (SortField, SortOrder) {
    match (SortField::parse(field), SortOrder::parse(order)) {
        (Some(f), Some(o)) => (f, o),
        _ => {
            warn!(field, order, "unrecognized sort parameters; using start_time desc");
            (SortField::StartTime, SortOrder::Desc)
        }
    }
}

/// Truncates `s` in place to at most `max` bytes, respecting UTF-8 character
/// boundaries.
fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Initializes the schema on a fresh connection.
pub fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    conn.pragma_update(None, "journal_mode", "wal")
        .err_kind(ErrorKind::Internal)?;
    let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
    tx.execute_batch(include_str!("schema.sql"))
        .err_kind(ErrorKind::Internal)?;
    tx.execute(
        "insert into meta (schema_version) values (?)",
        rusqlite::params![EXPECTED_SCHEMA_VERSION],
    )
    .err_kind(ErrorKind::Internal)?;
    tx.commit().err_kind(ErrorKind::Internal)?;
    Ok(())
}

/// The recording catalog. See module doc.
pub struct Database {
    inner: base::Mutex<LockedCatalog>,
}

/// Catalog state accessible while holding the global lock.
pub struct LockedCatalog {
    conn: rusqlite::Connection,
    days: days::Map,
}

impl Database {
    /// Takes ownership of an open connection, verifies the schema version,
    /// and rebuilds the in-memory days index.
    pub fn new(conn: rusqlite::Connection) -> Result<Self, Error> {
        let ver: i32 = conn
            .query_row("select schema_version from meta", [], |row| row.get(0))
            .map_err(|e| {
                err!(
                    FailedPrecondition,
                    msg("unable to read schema version; was this catalog initialized?"),
                    source(e),
                )
            })?;
        if ver != EXPECTED_SCHEMA_VERSION {
            bail!(
                FailedPrecondition,
                msg("catalog schema version {ver}, expected {EXPECTED_SCHEMA_VERSION}")
            );
        }
        let mut days = days::Map::default();
        let mut n = 0usize;
        raw::for_each_complete_span(&conn, &mut |start, end| {
            days.adjust(start..end, 1);
            n += 1;
        })?;
        info!(recordings = n, days = days.len(), "catalog loaded");
        Ok(Database {
            inner: base::Mutex::new(LockedCatalog { conn, days }),
        })
    }

    /// Acquires the global catalog lock.
    ///
    /// Mutating and reading both serialize here. Callers should not perform
    /// long-running work while holding the guard.
    pub fn lock(&self) -> MutexGuard<'_, LockedCatalog> {
        self.inner.lock()
    }
}

impl LockedCatalog {
    /// Inserts a new incomplete recording row, returning its id.
    ///
    /// String fields are truncated to their column limits.
    pub fn add_recording(&mut self, mut r: RecordingToInsert) -> Result<i64, Error> {
        truncate_utf8(&mut r.stream_name, MAX_STREAM_NAME_LEN);
        truncate_utf8(&mut r.codec, MAX_CODEC_LEN);
        truncate_utf8(&mut r.file_path, MAX_PATH_LEN);
        if r.stream_name.is_empty() {
            bail!(InvalidArgument, msg("empty stream name"));
        }
        raw::insert_recording(&self.conn, &r)
    }

    /// Finalizes a recording: sets `end_time`, `size_bytes`, and
    /// `is_complete`, making it visible to listing and retention.
    pub fn finalize_recording(
        &mut self,
        id: i64,
        end_time: Time,
        size_bytes: i64,
    ) -> Result<(), Error> {
        let Some(row) = raw::get_recording(&self.conn, id)? else {
            bail!(NotFound, msg("no recording {id}"));
        };
        if row.is_complete {
            bail!(FailedPrecondition, msg("recording {id} is already complete"));
        }
        if end_time < row.start_time {
            bail!(
                InvalidArgument,
                msg(
                    "recording {id}: end {end_time} precedes start {}",
                    row.start_time
                )
            );
        }
        if raw::finalize_recording(&self.conn, id, end_time, size_bytes)? != 1 {
            bail!(Internal, msg("recording {id} vanished during finalize"));
        }
        self.days.adjust(row.start_time..end_time, 1);
        Ok(())
    }

    /// Removes a recording row. The caller is responsible for the file.
    pub fn delete_recording(&mut self, id: i64) -> Result<(), Error> {
        let Some(row) = raw::get_recording(&self.conn, id)? else {
            bail!(NotFound, msg("no recording {id}"));
        };
        if raw::delete_recording(&self.conn, id)? != 1 {
            bail!(Internal, msg("recording {id} vanished during delete"));
        }
        if let (true, Some(end)) = (row.is_complete, row.end_time) {
            self.days.adjust(row.start_time..end, -1);
        }
        Ok(())
    }

    pub fn get_recording(&self, id: i64) -> Result<Option<RecordingRow>, Error> {
        raw::get_recording(&self.conn, id)
    }

    pub fn get_recording_by_path(&self, path: &str) -> Result<Option<RecordingRow>, Error> {
        raw::get_recording_by_path(&self.conn, path)
    }

    /// Lists complete recordings matching `filter`, returning the page of
    /// rows plus the total row count for the filter.
    pub fn list_recordings(
        &self,
        filter: &ListFilter,
        sort: SortField,
        order: SortOrder,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<RecordingRow>, i64), Error> {
        let rows = raw::list_recordings(&self.conn, filter, sort, order, limit, offset)?;
        let total = raw::count_recordings(&self.conn, filter)?;
        Ok((rows, total))
    }

    pub fn set_protected(&mut self, id: i64, protected: bool) -> Result<(), Error> {
        if raw::set_protected(&self.conn, id, protected)? != 1 {
            bail!(NotFound, msg("no recording {id}"));
        }
        Ok(())
    }

    /// Sets or clears the per-recording retention override. Negative values
    /// are treated as "no override".
    pub fn set_retention_override(&mut self, id: i64, days: Option<i64>) -> Result<(), Error> {
        let days = days.filter(|d| *d >= 0);
        if raw::set_retention_override(&self.conn, id, days)? != 1 {
            bail!(NotFound, msg("no recording {id}"));
        }
        Ok(())
    }

    /// See [`raw::retention_candidates`].
    pub fn retention_candidates(
        &self,
        stream: &str,
        regular_days: i64,
        detection_days: i64,
        now: Time,
        max: i64,
    ) -> Result<Vec<RecordingRow>, Error> {
        raw::retention_candidates(&self.conn, stream, regular_days, detection_days, now, max)
    }

    /// See [`raw::quota_candidates`].
    pub fn quota_candidates(&self, stream: &str, max: i64) -> Result<Vec<RecordingRow>, Error> {
        raw::quota_candidates(&self.conn, stream, max)
    }

    /// Lists up to `max` complete rows whose `file_path` no longer exists on
    /// disk. Scans at most `scan_limit` rows per call so the lock hold time
    /// is bounded; callers resume via the returned cursor.
    pub fn orphan_candidates(
        &self,
        mut after_id: i64,
        max: usize,
        scan_limit: usize,
    ) -> Result<(Vec<RecordingRow>, i64), Error> {
        let mut orphans = Vec::new();
        let mut scanned = 0usize;
        while orphans.len() < max && scanned < scan_limit {
            let batch = std::cmp::min(100, scan_limit - scanned) as i64;
            let page = raw::complete_rows_after(&self.conn, after_id, batch)?;
            if page.is_empty() {
                break;
            }
            for (id, path) in page {
                after_id = id;
                scanned += 1;
                let missing = match &path {
                    None => true,
                    Some(p) => !Path::new(p).exists(),
                };
                if missing {
                    if let Some(row) = raw::get_recording(&self.conn, id)? {
                        orphans.push(row);
                        if orphans.len() >= max {
                            break;
                        }
                    }
                }
            }
        }
        Ok((orphans, after_id))
    }

    /// Lists incomplete rows from writer sessions that started before
    /// `cutoff` and can no longer be finalized.
    pub fn stale_incomplete(&self, cutoff: Time, max: i64) -> Result<Vec<RecordingRow>, Error> {
        raw::stale_incomplete(&self.conn, cutoff, max)
    }

    /// See [`raw::recordings_intersecting`].
    pub fn recordings_intersecting(
        &self,
        stream: &str,
        range: &Range<Time>,
    ) -> Result<Vec<RecordingRow>, Error> {
        raw::recordings_intersecting(&self.conn, stream, range)
    }

    pub fn add_detection(&mut self, d: DetectionEvent) -> Result<i64, Error> {
        raw::insert_detection(&self.conn, &d)
    }

    /// The distinct `YYYY-mm-dd` UTC days with at least one complete
    /// recording, ascending.
    pub fn distinct_days(&self) -> Vec<String> {
        self.days.keys()
    }

    #[cfg(test)]
    pub(crate) fn days(&self) -> &days::Map {
        &self.days
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    const HOUR: i64 = 3_600;
    const DAY: i64 = 86_400;

    // 2015-04-25 00:00:00 UTC.
    const T0: i64 = 1_429_920_000;

    fn insert(
        db: &mut LockedCatalog,
        stream: &str,
        start: i64,
        end: i64,
        trigger: TriggerKind,
    ) -> i64 {
        let id = db
            .add_recording(RecordingToInsert {
                stream_name: stream.to_owned(),
                file_path: format!("/tank/{stream}/{start}.mp4"),
                start_time: Time(start),
                width: 1920,
                height: 1080,
                fps: 30.0,
                codec: "avc1.4d401f".to_owned(),
                trigger,
            })
            .unwrap();
        db.finalize_recording(id, Time(end), 20 << 20).unwrap();
        id
    }

    #[test]
    fn round_trip_with_truncation() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let mut db = tdb.db.lock();
        let long_name = "x".repeat(100);
        let id = db
            .add_recording(RecordingToInsert {
                stream_name: long_name.clone(),
                file_path: "/tank/x/0.mp4".to_owned(),
                start_time: Time(T0),
                width: 0,
                height: 0,
                fps: 0.0,
                codec: "a-codec-tag-that-is-too-long".to_owned(),
                trigger: TriggerKind::Manual,
            })
            .unwrap();
        assert!(id > 0);
        db.finalize_recording(id, Time(T0 + 60), 123).unwrap();
        let row = db.get_recording(id).unwrap().unwrap();
        assert_eq!(row.stream_name, long_name[..MAX_STREAM_NAME_LEN]);
        assert_eq!(row.codec.len(), MAX_CODEC_LEN);
        assert_eq!(row.end_time, Some(Time(T0 + 60)));
        assert_eq!(row.size_bytes, 123);
        assert!(row.is_complete);
        assert_eq!(row.trigger, TriggerKind::Manual);
        let by_path = db.get_recording_by_path("/tank/x/0.mp4").unwrap().unwrap();
        assert_eq!(by_path.id, id);
    }

    #[test]
    fn finalize_rejects_reversed_times() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let mut db = tdb.db.lock();
        let id = db
            .add_recording(RecordingToInsert {
                stream_name: "front".to_owned(),
                file_path: "/tank/front/0.mp4".to_owned(),
                start_time: Time(T0),
                width: 1920,
                height: 1080,
                fps: 30.0,
                codec: "avc1".to_owned(),
                trigger: TriggerKind::Scheduled,
            })
            .unwrap();
        let e = db.finalize_recording(id, Time(T0 - 1), 0).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn incomplete_rows_are_invisible() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let mut db = tdb.db.lock();
        db.add_recording(RecordingToInsert {
            stream_name: "front".to_owned(),
            file_path: "/tank/front/0.mp4".to_owned(),
            start_time: Time(T0),
            width: 1920,
            height: 1080,
            fps: 30.0,
            codec: "avc1".to_owned(),
            trigger: TriggerKind::Scheduled,
        })
        .unwrap();
        let (rows, total) = db
            .list_recordings(
                &ListFilter::default(),
                SortField::StartTime,
                SortOrder::Desc,
                10,
                0,
            )
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(total, 0);
        assert!(db.distinct_days().is_empty());
    }

    #[test]
    fn paginated_listing() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let mut db = tdb.db.lock();
        for i in 0..57 {
            insert(&mut db, "z", T0 + i * HOUR, T0 + i * HOUR + 60, TriggerKind::Scheduled);
        }
        let filter = ListFilter {
            stream: Some("z".to_owned()),
            ..Default::default()
        };
        let (rows, total) = db
            .list_recordings(&filter, SortField::StartTime, SortOrder::Desc, 20, 40)
            .unwrap();
        assert_eq!(total, 57);
        assert_eq!(rows.len(), 17);
        for pair in rows.windows(2) {
            assert!(pair[0].start_time > pair[1].start_time);
        }
    }

    #[test]
    fn sort_injection_is_clamped() {
        testutil::init();
        let (field, order) = clamped_sort("'; DROP TABLE recording; --", "desc");
        assert_eq!(field, SortField::StartTime);
        assert_eq!(order, SortOrder::Desc);
        let (field, order) = clamped_sort("size_bytes", "upside-down");
        assert_eq!(field, SortField::StartTime);
        assert_eq!(order, SortOrder::Desc);
        let (field, order) = clamped_sort("size_bytes", "asc");
        assert_eq!(field, SortField::SizeBytes);
        assert_eq!(order, SortOrder::Asc);
    }

    #[test]
    fn detection_filter() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let mut db = tdb.db.lock();
        // Triggered by detection: matches regardless of events.
        let a = insert(&mut db, "front", T0, T0 + 60, TriggerKind::Detection);
        // Scheduled, but spans an event.
        let b = insert(&mut db, "front", T0 + HOUR, T0 + HOUR + 60, TriggerKind::Scheduled);
        // Scheduled, no event in span.
        insert(&mut db, "front", T0 + 2 * HOUR, T0 + 2 * HOUR + 60, TriggerKind::Scheduled);
        // Event for a different stream within b's span: must not count.
        db.add_detection(DetectionEvent {
            stream_name: "back".to_owned(),
            timestamp: Time(T0 + HOUR + 30),
            label: "person".to_owned(),
            confidence: 0.9,
            track_id: None,
            zone_id: None,
        })
        .unwrap();
        db.add_detection(DetectionEvent {
            stream_name: "front".to_owned(),
            timestamp: Time(T0 + HOUR + 30),
            label: "person".to_owned(),
            confidence: 0.97,
            track_id: Some(7),
            zone_id: None,
        })
        .unwrap();
        let filter = ListFilter {
            stream: Some("front".to_owned()),
            has_detection: true,
            ..Default::default()
        };
        let (rows, total) = db
            .list_recordings(&filter, SortField::StartTime, SortOrder::Asc, 10, 0)
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn retention_ordering_and_classes() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let mut db = tdb.db.lock();
        let now = Time(T0 + 30 * DAY);
        // Ages 10 d and 5 d, one scheduled and one detection of each.
        let a = insert(&mut db, "x", now.0 - 10 * DAY, now.0 - 10 * DAY + 60, TriggerKind::Scheduled);
        let _b = insert(&mut db, "x", now.0 - 10 * DAY + HOUR, now.0 - 10 * DAY + HOUR + 60, TriggerKind::Detection);
        let _c = insert(&mut db, "x", now.0 - 5 * DAY, now.0 - 5 * DAY + 60, TriggerKind::Scheduled);
        let _d = insert(&mut db, "x", now.0 - 5 * DAY + HOUR, now.0 - 5 * DAY + HOUR + 60, TriggerKind::Detection);
        let rows = db.retention_candidates("x", 7, 14, now, 100).unwrap();
        // Only A: past 7 d and non-detection. B is detection under 14 d; C and
        // D are too young.
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a]);
    }

    #[test]
    fn retention_orders_non_detection_first_then_oldest() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let mut db = tdb.db.lock();
        let now = Time(T0 + 100 * DAY);
        let det_old = insert(&mut db, "x", now.0 - 40 * DAY, now.0 - 40 * DAY + 60, TriggerKind::Detection);
        let sched_new = insert(&mut db, "x", now.0 - 20 * DAY, now.0 - 20 * DAY + 60, TriggerKind::Scheduled);
        let sched_old = insert(&mut db, "x", now.0 - 50 * DAY, now.0 - 50 * DAY + 60, TriggerKind::Scheduled);
        let rows = db.retention_candidates("x", 7, 14, now, 100).unwrap();
        assert_eq!(
            rows.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![sched_old, sched_new, det_old]
        );
    }

    #[test]
    fn retention_respects_protection_and_override() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let mut db = tdb.db.lock();
        let now = Time(T0 + 60 * DAY);
        let protected = insert(&mut db, "x", now.0 - 30 * DAY, now.0 - 30 * DAY + 60, TriggerKind::Scheduled);
        db.set_protected(protected, true).unwrap();
        // Age 20 d with a 30 d override: kept.
        let overridden = insert(&mut db, "x", now.0 - 20 * DAY, now.0 - 20 * DAY + 60, TriggerKind::Scheduled);
        db.set_retention_override(overridden, Some(30)).unwrap();
        // Age 20 d with an elapsed 10 d override: deletable.
        let elapsed = insert(&mut db, "x", now.0 - 20 * DAY + HOUR, now.0 - 20 * DAY + HOUR + 60, TriggerKind::Scheduled);
        db.set_retention_override(elapsed, Some(10)).unwrap();
        let rows = db.retention_candidates("x", 7, 14, now, 100).unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![elapsed]);

        // Clearing the override (or setting a negative one) restores the
        // stream default.
        db.set_retention_override(overridden, Some(-1)).unwrap();
        let rows = db.retention_candidates("x", 7, 14, now, 100).unwrap();
        assert_eq!(
            rows.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![elapsed, overridden]
        );
    }

    #[test]
    fn quota_candidates_oldest_first_skipping_protected() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let mut db = tdb.db.lock();
        let r1 = insert(&mut db, "y", T0, T0 + 60, TriggerKind::Scheduled);
        let r2 = insert(&mut db, "y", T0 + HOUR, T0 + HOUR + 60, TriggerKind::Detection);
        let r3 = insert(&mut db, "y", T0 + 2 * HOUR, T0 + 2 * HOUR + 60, TriggerKind::Scheduled);
        db.set_protected(r1, true).unwrap();
        let rows = db.quota_candidates("y", 10).unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![r2, r3]);
    }

    #[test]
    fn orphan_candidates_report_missing_files() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let present = tdb.tmpdir.path().join("present.mp4");
        std::fs::write(&present, b"x").unwrap();
        let missing = tdb.tmpdir.path().join("missing.mp4");
        let mut db = tdb.db.lock();
        let mk = |db: &mut LockedCatalog, path: &std::path::Path, start: i64| {
            let id = db
                .add_recording(RecordingToInsert {
                    stream_name: "front".to_owned(),
                    file_path: path.to_str().unwrap().to_owned(),
                    start_time: Time(start),
                    width: 1920,
                    height: 1080,
                    fps: 30.0,
                    codec: "avc1".to_owned(),
                    trigger: TriggerKind::Scheduled,
                })
                .unwrap();
            db.finalize_recording(id, Time(start + 60), 1).unwrap();
            id
        };
        let _ok_id = mk(&mut db, &present, T0);
        let orphan_id = mk(&mut db, &missing, T0 + HOUR);
        let (orphans, _cursor) = db.orphan_candidates(0, 10, 1000).unwrap();
        assert_eq!(orphans.iter().map(|r| r.id).collect::<Vec<_>>(), vec![orphan_id]);
    }

    #[test]
    fn days_index_tracks_completion_and_deletion() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let mut db = tdb.db.lock();
        let id = insert(&mut db, "front", T0 + 23 * HOUR + 3590, T0 + 23 * HOUR + 3590 + 60, TriggerKind::Scheduled);
        // Crosses UTC midnight: two days.
        assert_eq!(
            db.distinct_days(),
            vec!["2015-04-25".to_owned(), "2015-04-26".to_owned()]
        );
        db.delete_recording(id).unwrap();
        assert!(db.distinct_days().is_empty());
    }

    #[test]
    fn stale_incomplete_rows_are_found() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let mut db = tdb.db.lock();
        let id = db
            .add_recording(RecordingToInsert {
                stream_name: "front".to_owned(),
                file_path: "/tank/front/crashed.mp4".to_owned(),
                start_time: Time(T0),
                width: 1920,
                height: 1080,
                fps: 30.0,
                codec: "avc1".to_owned(),
                trigger: TriggerKind::Scheduled,
            })
            .unwrap();
        let rows = db.stale_incomplete(Time(T0 + 600), 10).unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![id]);
        let rows = db.stale_incomplete(Time(T0), 10).unwrap();
        assert!(rows.is_empty());
    }
}
