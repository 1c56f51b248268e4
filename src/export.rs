// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Export: concatenating a time range of one stream's segments into a single
//! stream-copied file.
//!
//! Interior segments are copied whole; the first and last are trimmed to the
//! requested window, starting at a sync sample so the output remains
//! independently decodable. Codec parameter changes across the range are
//! refused (this engine never re-encodes). The output is written to a
//! sibling temp file and renamed into place.

use crate::mp4::{self, SegmentMuxer, TrackKind, TrackSpec};
use base::time::{Time, TIME_UNITS_PER_SEC};
use base::{bail, err, Error};
use db::Database;
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ExportRequest {
    pub stream: String,
    pub range: Range<Time>,
    pub dest: PathBuf,
}

#[derive(Debug)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub bytes: u64,
    pub segments: usize,
    pub video_samples: usize,
}

/// Samples of one parsed segment, selected and rebased for the output.
struct SelectedSegment {
    path: PathBuf,
    samples: Vec<mp4::SegmentSample>,
}

pub fn export(db: &Arc<Database>, req: &ExportRequest) -> Result<ExportSummary, Error> {
    if req.range.end <= req.range.start {
        bail!(
            InvalidArgument,
            msg("empty export range {}..{}", req.range.start, req.range.end)
        );
    }
    let rows = db
        .lock()
        .recordings_intersecting(&req.stream, &req.range)?;
    if rows.is_empty() {
        bail!(
            NotFound,
            msg(
                "no recordings for stream {:?} in {}..{}",
                req.stream,
                req.range.start,
                req.range.end
            )
        );
    }

    // Parse every segment up front; codec parameters must agree before any
    // output is written.
    let mut parsed = Vec::with_capacity(rows.len());
    for row in &rows {
        let Some(path) = &row.file_path else {
            continue;
        };
        let path = PathBuf::from(path);
        let info = match mp4::read_segment(&path) {
            Ok(i) => i,
            Err(e) => {
                // A file deleted between the query and here is the orphan
                // pass's business, not a reason to fail the export.
                warn!(path = %path.display(), err = %e.chain(), "skipping unreadable segment");
                continue;
            }
        };
        parsed.push((row.clone(), path, info));
    }
    let Some((_, _, first)) = parsed.first() else {
        bail!(NotFound, msg("no readable segments in range"));
    };
    let video_entry = first.video_sample_entry.clone();
    let video_timescale = first.video_timescale;
    for (row, _, info) in &parsed {
        if info.video_sample_entry != video_entry || info.video_timescale != video_timescale {
            bail!(
                FailedPrecondition,
                msg(
                    "video codec parameters changed within the range (at recording {}); \
                     export is stream-copy only",
                    row.id
                )
            );
        }
    }
    let audio = {
        let first_audio = first.audio_sample_entry.clone();
        let uniform = parsed.iter().all(|(_, _, i)| {
            i.audio_sample_entry == first_audio && i.audio_timescale == first.audio_timescale
        });
        if !uniform {
            warn!("audio parameters differ across segments; exporting video only");
        }
        first_audio.filter(|_| uniform).map(|entry| TrackSpec {
            sample_entry: entry,
            timescale: first.audio_timescale,
            default_dur: 1024,
            width: 0,
            height: 0,
        })
    };
    let audio_timescale = audio.as_ref().map(|a| a.timescale).unwrap_or(0);

    // Select samples per segment, in wall-clock terms.
    let range_90k = (req.range.start.0 * TIME_UNITS_PER_SEC)..(req.range.end.0 * TIME_UNITS_PER_SEC);
    let mut selected = Vec::with_capacity(parsed.len());
    for (row, path, info) in parsed {
        let base_90k = row.start_time.0 * TIME_UNITS_PER_SEC;
        let first_video_pts = info
            .samples
            .iter()
            .find(|s| s.track == TrackKind::Video)
            .map(|s| s.pts)
            .unwrap_or(0);
        let first_audio_pts = info
            .samples
            .iter()
            .find(|s| s.track == TrackKind::Audio)
            .map(|s| s.pts)
            .unwrap_or(0);
        let wall_90k = |s: &mp4::SegmentSample| -> i64 {
            match s.track {
                TrackKind::Video => base_90k + (s.pts - first_video_pts) as i64,
                TrackKind::Audio => {
                    let rel = (s.pts - first_audio_pts) as i64;
                    if audio_timescale == 0 {
                        base_90k
                    } else {
                        base_90k + rel * TIME_UNITS_PER_SEC / i64::from(audio_timescale)
                    }
                }
            }
        };
        let video: Vec<_> = info
            .samples
            .iter()
            .filter(|s| s.track == TrackKind::Video)
            .cloned()
            .collect();
        let in_window =
            |s: &mp4::SegmentSample| range_90k.contains(&wall_90k(s));
        let first_wanted = video.iter().position(in_window);
        let mut samples: Vec<mp4::SegmentSample> = Vec::new();
        if let Some(first_wanted) = first_wanted {
            // Trim to the window, backing the start up to a sync sample so
            // the output decodes from its first frame.
            let start_idx = (0..=first_wanted)
                .rev()
                .find(|&i| video[i].is_sync)
                .unwrap_or(0);
            samples.extend(
                video[start_idx..]
                    .iter()
                    .take_while(|&s| wall_90k(s) < range_90k.end)
                    .cloned(),
            );
        }
        if audio.is_some() {
            samples.extend(
                info.samples
                    .iter()
                    .filter(|&s| s.track == TrackKind::Audio && in_window(s))
                    .cloned(),
            );
        }
        if !samples.is_empty() {
            selected.push(SelectedSegment { path, samples });
        }
    }
    if selected.is_empty() {
        bail!(NotFound, msg("no samples within the requested window"));
    }

    // Write the output: temp file in the destination directory, atomic
    // rename at the end.
    if let Some(parent) = req.dest.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = req.dest.with_extension("mp4.tmp");
    let tmp = std::fs::File::create(&tmp_path)?;
    let video_spec = TrackSpec {
        sample_entry: video_entry,
        timescale: video_timescale,
        default_dur: 3_000,
        width: 0, // filled from the sample entry below
        height: 0,
    };
    let result = write_output(tmp, video_spec, audio, &selected);
    let (bytes, video_samples) = match result {
        Ok(v) => v,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
    };
    std::fs::rename(&tmp_path, &req.dest)
        .map_err(|e| err!(Unknown, msg("unable to move export into place"), source(e)))?;
    info!(
        stream = %req.stream,
        path = %req.dest.display(),
        bytes,
        segments = selected.len(),
        "export complete"
    );
    Ok(ExportSummary {
        path: req.dest.clone(),
        bytes,
        segments: selected.len(),
        video_samples,
    })
}

fn write_output(
    tmp: std::fs::File,
    mut video_spec: TrackSpec,
    audio_spec: Option<TrackSpec>,
    selected: &[SelectedSegment],
) -> Result<(u64, usize), Error> {
    if let Some((w, h)) = mp4::sample_entry_dimensions(&video_spec.sample_entry) {
        video_spec.width = w;
        video_spec.height = h;
    }
    let mut muxer = SegmentMuxer::new(
        std::io::BufWriter::new(tmp),
        video_spec,
        audio_spec,
    )?;
    let mut out_video_pts = 0u64;
    let mut out_audio_pts = 0u64;
    let mut video_samples = 0usize;
    let mut buf = Vec::new();
    for seg in selected {
        let mut f = std::fs::File::open(&seg.path)?;
        for s in &seg.samples {
            buf.resize(s.size as usize, 0);
            f.seek(SeekFrom::Start(s.offset))?;
            f.read_exact(&mut buf)?;
            match s.track {
                TrackKind::Video => {
                    if s.is_sync {
                        muxer.flush_fragment()?;
                    }
                    muxer.append_video(&buf, out_video_pts, s.is_sync)?;
                    out_video_pts += u64::from(s.dur.max(1));
                    video_samples += 1;
                }
                TrackKind::Audio => {
                    muxer.append_audio(&buf, out_audio_pts)?;
                    out_audio_pts += u64::from(s.dur.max(1));
                }
            }
        }
    }
    let (w, bytes) = muxer.finish()?;
    let mut f = w
        .into_inner()
        .map_err(|e| err!(Unknown, msg("unable to flush export"), source(e.into_error())))?;
    f.flush()?;
    f.sync_all()?;
    Ok((bytes, video_samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::testutil::test_video_spec;
    use db::testutil::TestDb;
    use db::{RecordingToInsert, TriggerKind};

    // 2015-04-25 00:00:00 UTC.
    const T0: i64 = 1_429_920_000;

    /// Writes a six-sample segment starting at `start`: keyframes at samples
    /// 0 and 3, one sample per second, and registers it as complete.
    fn write_segment(
        tdb: &TestDb,
        dir: &db::dir::ArchiveDir,
        stream: &str,
        start: i64,
        width_override: Option<u16>,
    ) -> i64 {
        let mut spec = test_video_spec();
        if let Some(w) = width_override {
            spec.sample_entry[32..34].copy_from_slice(&w.to_be_bytes());
            spec.width = u32::from(w);
        }
        let path = dir.segment_path(stream, Time(start), "scheduled");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let f = std::fs::File::create(&path).unwrap();
        let mut m = SegmentMuxer::new(std::io::BufWriter::new(f), spec, None).unwrap();
        for i in 0..6u64 {
            let is_key = i % 3 == 0;
            if is_key {
                m.flush_fragment().unwrap();
            }
            m.append_video(format!("frame-{start}-{i}").as_bytes(), i * 90_000, is_key)
                .unwrap();
        }
        let (w, size) = m.finish().unwrap();
        drop(w.into_inner().unwrap());
        let mut l = tdb.db.lock();
        let id = l
            .add_recording(RecordingToInsert {
                stream_name: stream.to_owned(),
                file_path: path.to_str().unwrap().to_owned(),
                start_time: Time(start),
                width: 1280,
                height: 720,
                fps: 1.0,
                codec: "avc1.4d001f".to_owned(),
                trigger: TriggerKind::Scheduled,
            })
            .unwrap();
        l.finalize_recording(id, Time(start + 6), size as i64)
            .unwrap();
        id
    }

    #[test]
    fn concatenates_and_trims_to_window() {
        db::testutil::init();
        let tdb = TestDb::new();
        let dir = tdb.archive_dir();
        write_segment(&tdb, &dir, "z", T0, None);
        write_segment(&tdb, &dir, "z", T0 + 6, None);
        let dest = tdb.tmpdir.path().join("exports/clip.mp4");
        let summary = export(
            &tdb.db,
            &ExportRequest {
                stream: "z".to_owned(),
                range: Time(T0 + 3)..Time(T0 + 9),
                dest: dest.clone(),
            },
        )
        .unwrap();
        assert_eq!(summary.segments, 2);
        // Seconds 3..6 of the first segment (starting at the sample-3
        // keyframe) plus seconds 6..9 of the second.
        assert_eq!(summary.video_samples, 6);
        assert!(dest.exists());
        assert!(!dest.with_extension("mp4.tmp").exists(), "temp file renamed");
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), summary.bytes);

        let types = mp4::top_level_box_types(&dest).unwrap();
        assert_eq!(&types[0], b"ftyp");
        assert!(
            types.iter().position(|t| t == b"moov").unwrap()
                < types.iter().position(|t| t == b"mdat").unwrap()
        );
        let info = mp4::read_segment(&dest).unwrap();
        let video: Vec<_> = info
            .samples
            .iter()
            .filter(|s| s.track == TrackKind::Video)
            .collect();
        assert_eq!(video.len(), 6);
        assert!(video[0].is_sync);
        // The trimmed output begins with the second segment boundary intact.
        let data = std::fs::read(&dest).unwrap();
        let s0 = &video[0];
        assert_eq!(
            &data[s0.offset as usize..(s0.offset + u64::from(s0.size)) as usize],
            format!("frame-{T0}-3").as_bytes()
        );
    }

    #[test]
    fn whole_range_copies_everything() {
        db::testutil::init();
        let tdb = TestDb::new();
        let dir = tdb.archive_dir();
        write_segment(&tdb, &dir, "z", T0, None);
        let dest = tdb.tmpdir.path().join("all.mp4");
        let summary = export(
            &tdb.db,
            &ExportRequest {
                stream: "z".to_owned(),
                range: Time(T0 - 100)..Time(T0 + 100),
                dest: dest.clone(),
            },
        )
        .unwrap();
        assert_eq!(summary.video_samples, 6);
    }

    #[test]
    fn refuses_codec_parameter_change() {
        db::testutil::init();
        let tdb = TestDb::new();
        let dir = tdb.archive_dir();
        write_segment(&tdb, &dir, "z", T0, None);
        write_segment(&tdb, &dir, "z", T0 + 6, Some(640));
        let dest = tdb.tmpdir.path().join("mismatch.mp4");
        let e = export(
            &tdb.db,
            &ExportRequest {
                stream: "z".to_owned(),
                range: Time(T0)..Time(T0 + 12),
                dest: dest.clone(),
            },
        )
        .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::FailedPrecondition);
        assert!(!dest.exists());
        assert!(!dest.with_extension("mp4.tmp").exists());
    }

    #[test]
    fn rejects_bad_requests() {
        db::testutil::init();
        let tdb = TestDb::new();
        let dest = tdb.tmpdir.path().join("none.mp4");
        let e = export(
            &tdb.db,
            &ExportRequest {
                stream: "z".to_owned(),
                range: Time(T0 + 10)..Time(T0),
                dest: dest.clone(),
            },
        )
        .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
        let e = export(
            &tdb.db,
            &ExportRequest {
                stream: "z".to_owned(),
                range: Time(T0)..Time(T0 + 10),
                dest,
            },
        )
        .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::NotFound);
    }
}
