// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Raw database access: SQLite statements which do not touch any cached state.
//!
//! All values are passed via parameter binding. The only text spliced into
//! SQL here is produced by [`crate::db::SortField::as_sql`] and
//! [`crate::db::SortOrder::as_sql`], which return fixed strings.

use crate::db::{
    DetectionEvent, ListFilter, RecordingRow, RecordingToInsert, SortField, SortOrder, TriggerKind,
};
use base::time::Time;
use base::{err, Error, ErrorKind, ResultExt as _};
use rusqlite::{named_params, params, Connection, Row};
use std::ops::Range;

const RECORDING_COLS: &str = r#"
    recording.id,
    recording.stream_name,
    recording.file_path,
    recording.start_time,
    recording.end_time,
    recording.size_bytes,
    recording.width,
    recording.height,
    recording.fps,
    recording.codec,
    recording.is_complete,
    recording.trigger_type,
    recording.protected,
    recording.retention_override_days
"#;

/// `where` fragment selecting rows visible to playback and listing.
const VISIBLE: &str = "recording.is_complete = 1 and recording.end_time is not null";

/// `where` fragment selecting rows spanning at least one detection event.
const HAS_DETECTION: &str = r#"(recording.trigger_type = 'detection' or exists (
    select 1 from detection
    where detection.stream_name = recording.stream_name
      and detection.timestamp >= recording.start_time
      and detection.timestamp <= recording.end_time))"#;

fn parse_row(row: &Row) -> rusqlite::Result<RecordingRow> {
    let trigger: String = row.get(11)?;
    Ok(RecordingRow {
        id: row.get(0)?,
        stream_name: row.get(1)?,
        file_path: row.get(2)?,
        start_time: Time(row.get(3)?),
        end_time: row.get::<_, Option<i64>>(4)?.map(Time),
        size_bytes: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        fps: row.get(8)?,
        codec: row.get(9)?,
        is_complete: row.get(10)?,
        trigger: TriggerKind::parse(&trigger).unwrap_or(TriggerKind::Scheduled),
        protected: row.get(12)?,
        retention_override_days: row.get(13)?,
    })
}

pub(crate) fn insert_recording(
    conn: &Connection,
    r: &RecordingToInsert,
) -> Result<i64, Error> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            insert into recording (stream_name,  file_path,  start_time,  width,  height,
                                   fps,  codec,  trigger_type)
                           values (:stream_name, :file_path, :start_time, :width, :height,
                                   :fps, :codec, :trigger_type)
            "#,
        )
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {
        ":stream_name": &r.stream_name,
        ":file_path": &r.file_path,
        ":start_time": r.start_time.0,
        ":width": r.width,
        ":height": r.height,
        ":fps": r.fps,
        ":codec": &r.codec,
        ":trigger_type": r.trigger.as_str(),
    })
    .err_kind(ErrorKind::Internal)?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn finalize_recording(
    conn: &Connection,
    id: i64,
    end_time: Time,
    size_bytes: i64,
) -> Result<usize, Error> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            update recording
            set end_time = :end_time, size_bytes = :size_bytes, is_complete = 1
            where id = :id
            "#,
        )
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {
        ":id": id,
        ":end_time": end_time.0,
        ":size_bytes": size_bytes,
    })
    .err_kind(ErrorKind::Internal)
}

pub(crate) fn delete_recording(conn: &Connection, id: i64) -> Result<usize, Error> {
    let mut stmt = conn
        .prepare_cached("delete from recording where id = ?")
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(params![id]).err_kind(ErrorKind::Internal)
}

pub(crate) fn get_recording(conn: &Connection, id: i64) -> Result<Option<RecordingRow>, Error> {
    let sql = format!("select {RECORDING_COLS} from recording where id = ?");
    let mut stmt = conn.prepare_cached(&sql).err_kind(ErrorKind::Internal)?;
    stmt.query_row(params![id], parse_row)
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(err!(Internal, source(e))),
        })
}

pub(crate) fn get_recording_by_path(
    conn: &Connection,
    path: &str,
) -> Result<Option<RecordingRow>, Error> {
    let sql = format!("select {RECORDING_COLS} from recording where file_path = ?");
    let mut stmt = conn.prepare_cached(&sql).err_kind(ErrorKind::Internal)?;
    stmt.query_row(params![path], parse_row)
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(err!(Internal, source(e))),
        })
}

/// Builds the `where` clause and bound values shared by `list_recordings` and
/// `count_recordings`.
fn filter_clause(filter: &ListFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut clause = String::with_capacity(256);
    clause.push_str(VISIBLE);
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(stream) = &filter.stream {
        clause.push_str(" and recording.stream_name = ?");
        values.push(Box::new(stream.clone()));
    }
    if let Some(range) = &filter.time {
        clause.push_str(" and recording.start_time < ? and recording.end_time > ?");
        values.push(Box::new(range.end.0));
        values.push(Box::new(range.start.0));
    }
    if filter.has_detection {
        clause.push_str(" and ");
        clause.push_str(HAS_DETECTION);
    }
    (clause, values)
}

pub(crate) fn list_recordings(
    conn: &Connection,
    filter: &ListFilter,
    sort: SortField,
    order: SortOrder,
    limit: i64,
    offset: i64,
) -> Result<Vec<RecordingRow>, Error> {
    let (clause, mut values) = filter_clause(filter);
    let sql = format!(
        "select {RECORDING_COLS} from recording where {clause} \
         order by recording.{} {} limit ? offset ?",
        sort.as_sql(),
        order.as_sql(),
    );
    values.push(Box::new(limit));
    values.push(Box::new(offset));
    let mut stmt = conn.prepare(&sql).err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())))
        .err_kind(ErrorKind::Internal)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        out.push(parse_row(row).err_kind(ErrorKind::Internal)?);
    }
    Ok(out)
}

pub(crate) fn count_recordings(conn: &Connection, filter: &ListFilter) -> Result<i64, Error> {
    let (clause, values) = filter_clause(filter);
    let sql = format!("select count(*) from recording where {clause}");
    let mut stmt = conn.prepare(&sql).err_kind(ErrorKind::Internal)?;
    stmt.query_row(
        rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        |row| row.get(0),
    )
    .err_kind(ErrorKind::Internal)
}

pub(crate) fn set_protected(conn: &Connection, id: i64, protected: bool) -> Result<usize, Error> {
    let mut stmt = conn
        .prepare_cached("update recording set protected = ? where id = ?")
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(params![protected, id])
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn set_retention_override(
    conn: &Connection,
    id: i64,
    days: Option<i64>,
) -> Result<usize, Error> {
    let mut stmt = conn
        .prepare_cached("update recording set retention_override_days = ? where id = ?")
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(params![days, id]).err_kind(ErrorKind::Internal)
}

/// Lists recordings eligible for age-based deletion: complete, unprotected,
/// past their class's retention period (or their per-recording override),
/// ordered with non-detection recordings first so detection footage is kept
/// longest, oldest first within each class.
pub(crate) fn retention_candidates(
    conn: &Connection,
    stream: &str,
    regular_days: i64,
    detection_days: i64,
    now: Time,
    max: i64,
) -> Result<Vec<RecordingRow>, Error> {
    let sql = format!(
        r#"
        select {RECORDING_COLS} from recording
        where recording.stream_name = :stream
          and recording.is_complete = 1
          and recording.end_time is not null
          and recording.protected = 0
          and (case
                 when recording.retention_override_days is not null
                   then recording.start_time + recording.retention_override_days * 86400 <= :now
                 when recording.trigger_type = 'detection'
                   then recording.start_time + :detection_days * 86400 <= :now
                 else recording.start_time + :regular_days * 86400 <= :now
               end)
        order by (recording.trigger_type = 'detection'), recording.start_time
        limit :max
        "#
    );
    let mut stmt = conn.prepare_cached(&sql).err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(named_params! {
            ":stream": stream,
            ":now": now.0,
            ":regular_days": regular_days,
            ":detection_days": detection_days,
            ":max": max,
        })
        .err_kind(ErrorKind::Internal)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        out.push(parse_row(row).err_kind(ErrorKind::Internal)?);
    }
    Ok(out)
}

/// Lists the oldest unprotected complete recordings of a stream, for quota
/// eviction. Trigger kind is ignored: pure FIFO.
pub(crate) fn quota_candidates(
    conn: &Connection,
    stream: &str,
    max: i64,
) -> Result<Vec<RecordingRow>, Error> {
    let sql = format!(
        r#"
        select {RECORDING_COLS} from recording
        where recording.stream_name = :stream
          and recording.is_complete = 1
          and recording.end_time is not null
          and recording.protected = 0
        order by recording.start_time
        limit :max
        "#
    );
    let mut stmt = conn.prepare_cached(&sql).err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(named_params! { ":stream": stream, ":max": max })
        .err_kind(ErrorKind::Internal)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        out.push(parse_row(row).err_kind(ErrorKind::Internal)?);
    }
    Ok(out)
}

/// Pages through complete rows by id for filesystem reconciliation.
pub(crate) fn complete_rows_after(
    conn: &Connection,
    after_id: i64,
    limit: i64,
) -> Result<Vec<(i64, Option<String>)>, Error> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            select id, file_path from recording
            where is_complete = 1 and id > :after
            order by id
            limit :limit
            "#,
        )
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(named_params! { ":after": after_id, ":limit": limit })
        .err_kind(ErrorKind::Internal)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        out.push((row.get(0).err_kind(ErrorKind::Internal)?, row.get(1).err_kind(ErrorKind::Internal)?));
    }
    Ok(out)
}

/// Lists incomplete rows whose recording started before `cutoff`: leftovers
/// of crashed or aborted writer sessions.
pub(crate) fn stale_incomplete(
    conn: &Connection,
    cutoff: Time,
    max: i64,
) -> Result<Vec<RecordingRow>, Error> {
    let sql = format!(
        r#"
        select {RECORDING_COLS} from recording
        where recording.is_complete = 0 and recording.start_time < :cutoff
        order by recording.id
        limit :max
        "#
    );
    let mut stmt = conn.prepare_cached(&sql).err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(named_params! { ":cutoff": cutoff.0, ":max": max })
        .err_kind(ErrorKind::Internal)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        out.push(parse_row(row).err_kind(ErrorKind::Internal)?);
    }
    Ok(out)
}

/// Lists complete recordings of `stream` whose `[start_time, end_time]`
/// interval intersects `range`, in ascending start order.
pub(crate) fn recordings_intersecting(
    conn: &Connection,
    stream: &str,
    range: &Range<Time>,
) -> Result<Vec<RecordingRow>, Error> {
    let sql = format!(
        r#"
        select {RECORDING_COLS} from recording
        where recording.stream_name = :stream
          and recording.is_complete = 1
          and recording.end_time is not null
          and recording.start_time <= :range_end
          and recording.end_time >= :range_start
        order by recording.start_time
        "#
    );
    let mut stmt = conn.prepare_cached(&sql).err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(named_params! {
            ":stream": stream,
            ":range_start": range.start.0,
            ":range_end": range.end.0,
        })
        .err_kind(ErrorKind::Internal)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        out.push(parse_row(row).err_kind(ErrorKind::Internal)?);
    }
    Ok(out)
}

pub(crate) fn insert_detection(conn: &Connection, d: &DetectionEvent) -> Result<i64, Error> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            insert into detection (stream_name,  timestamp,  label,  confidence,  track_id,  zone_id)
                           values (:stream_name, :timestamp, :label, :confidence, :track_id, :zone_id)
            "#,
        )
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {
        ":stream_name": &d.stream_name,
        ":timestamp": d.timestamp.0,
        ":label": &d.label,
        ":confidence": d.confidence,
        ":track_id": d.track_id,
        ":zone_id": d.zone_id,
    })
    .err_kind(ErrorKind::Internal)?;
    Ok(conn.last_insert_rowid())
}

/// Streams `(start_time, end_time)` of all complete recordings, for rebuilding
/// the in-memory days index at open.
pub(crate) fn for_each_complete_span(
    conn: &Connection,
    f: &mut dyn FnMut(Time, Time),
) -> Result<(), Error> {
    let mut stmt = conn
        .prepare(
            "select start_time, end_time from recording \
             where is_complete = 1 and end_time is not null",
        )
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt.query(params![]).err_kind(ErrorKind::Internal)?;
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        f(
            Time(row.get(0).err_kind(ErrorKind::Internal)?),
            Time(row.get(1).err_kind(ErrorKind::Internal)?),
        );
    }
    Ok(())
}
