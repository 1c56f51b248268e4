// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Writing segment files and registering them in the catalog.
//!
//! A [`Writer`] owns everything belonging to one stream's current segment:
//! the open file, the in-flight muxer state, and the audio substate. The
//! ownership tree guarantees release on every error path; an abort deletes
//! both the partial file and its catalog row so no half-written segment is
//! ever visible.
//!
//! Catalog row lifecycle: `add_recording` (incomplete) at open,
//! `finalize_recording` after the file and its directory entry are fsynced.
//! The finalize is the commit barrier: listing, retention, and export only
//! ever see finalized rows.

use crate::audio::{self, AudioCodec, AudioParams, TranscoderRegistry};
use crate::h264;
use crate::mp4::{SegmentMuxer, TrackSpec};
use base::clock::Clocks;
use base::time::{Duration, Time, TIME_UNITS_PER_SEC};
use base::{bail, err, Error};
use db::dir::ArchiveDir;
use db::{Database, RecordingToInsert, TriggerKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{trace, warn};

/// Trait to allow mocking out [`std::fs::File`] in writer tests.
pub trait SegmentFile: std::io::Write + Send {
    fn sync_all(&mut self) -> Result<(), Error>;
}

impl SegmentFile for std::fs::File {
    fn sync_all(&mut self) -> Result<(), Error> {
        std::fs::File::sync_all(self)?;
        Ok(())
    }
}

impl SegmentFile for std::io::BufWriter<std::fs::File> {
    fn sync_all(&mut self) -> Result<(), Error> {
        std::io::Write::flush(self)?;
        self.get_ref().sync_all()?;
        Ok(())
    }
}

/// Trait to allow mocking out [`ArchiveDir`] in writer tests.
pub trait DirWriter: Send + Sync {
    type File: SegmentFile;

    fn segment_path(&self, stream_name: &str, start: Time, trigger: &str) -> PathBuf;
    fn create_file(&self, path: &Path) -> Result<Self::File, Error>;
    fn sync_parent(&self, path: &Path) -> Result<(), Error>;
    fn unlink(&self, path: &Path) -> Result<bool, Error>;
}

impl DirWriter for ArchiveDir {
    type File = std::io::BufWriter<std::fs::File>;

    fn segment_path(&self, stream_name: &str, start: Time, trigger: &str) -> PathBuf {
        ArchiveDir::segment_path(self, stream_name, start, trigger)
    }
    fn create_file(&self, path: &Path) -> Result<Self::File, Error> {
        Ok(std::io::BufWriter::with_capacity(
            self.write_buffer_bytes(),
            ArchiveDir::create_segment(self, path)?,
        ))
    }
    fn sync_parent(&self, path: &Path) -> Result<(), Error> {
        ArchiveDir::sync_parent(self, path)
    }
    fn unlink(&self, path: &Path) -> Result<bool, Error> {
        ArchiveDir::unlink(self, path)
    }
}

/// Static configuration for one stream's writer.
#[derive(Clone, Debug)]
pub struct WriterConfig {
    pub stream_name: String,
    pub trigger: TriggerKind,
    pub segment_duration: std::time::Duration,

    /// Rotate when the file reaches this size, if set.
    pub max_segment_bytes: Option<u64>,

    /// Frame rate hint for the catalog row and for the duration assumed
    /// before a sample's successor arrives.
    pub fps: f64,
}

impl WriterConfig {
    fn default_sample_dur(&self) -> u32 {
        if self.fps > 0.0 {
            (TIME_UNITS_PER_SEC as f64 / self.fps) as u32
        } else {
            3_000 // 30 fps
        }
    }
}

enum AudioTrackState {
    /// No audio stream, or its codec cannot be carried.
    NoTrack,

    /// Source frames are appended directly. `pts` advances by the codec
    /// frame size per packet, in the audio timescale.
    PassThrough { pts: u64, frame_size: u32 },

    /// PCM transcoded to AAC. The transcoder handle is fetched from the
    /// registry on the first audio packet and kept for the session; `pts` is
    /// the count of samples appended to this segment's track.
    Transcode {
        fmt: audio::PcmFormat,
        sample_rate: u32,
        channels: u16,
        handle: Option<Arc<base::Mutex<audio::Transcoder>>>,
        pts: u64,
    },

    /// Encoder init failed; the session continues video-only.
    Failed,
}

struct InnerWriter<F: SegmentFile> {
    id: i64,
    path: PathBuf,
    muxer: SegmentMuxer<F>,
    start: Time,
    opened_at: base::clock::Instant,
    first_pts: i64,
    last_pts: i64,
    audio: AudioTrackState,
}

enum WriterState<F: SegmentFile> {
    Unopened,
    Open(InnerWriter<F>),
}

/// Struct for writing a stream's segments to disk and committing their
/// metadata to the catalog.
pub struct Writer<'a, C: Clocks, D: DirWriter> {
    dir: &'a D,
    db: &'a Arc<Database>,
    clocks: &'a C,
    registry: &'a TranscoderRegistry,
    cfg: WriterConfig,
    state: WriterState<D::File>,
    rotate_requested: bool,

    /// End time of the previous segment; the next segment's start is clamped
    /// to it so completed recordings of a stream never overlap.
    prev_end: Option<Time>,

    /// Scratch buffer for Annex B -> AVC sample conversion.
    avc_buf: Vec<u8>,
}

impl<'a, C: Clocks, D: DirWriter> Writer<'a, C, D> {
    pub fn new(
        dir: &'a D,
        db: &'a Arc<Database>,
        clocks: &'a C,
        registry: &'a TranscoderRegistry,
        cfg: WriterConfig,
    ) -> Self {
        Writer {
            dir,
            db,
            clocks,
            registry,
            cfg,
            state: WriterState::Unopened,
            rotate_requested: false,
            prev_end: None,
            avc_buf: Vec::new(),
        }
    }

    /// Requests that the current segment close at the next video keyframe.
    pub fn request_rotate(&mut self) {
        self.rotate_requested = true;
    }

    /// Bytes committed to the current segment, if open.
    pub fn bytes_written(&self) -> u64 {
        match &self.state {
            WriterState::Open(w) => w.muxer.bytes_written(),
            WriterState::Unopened => 0,
        }
    }

    fn should_rotate(&self, w: &InnerWriter<D::File>) -> bool {
        if self.rotate_requested {
            return true;
        }
        let elapsed = self.clocks.monotonic().saturating_sub(&w.opened_at);
        if elapsed >= self.cfg.segment_duration {
            return true;
        }
        if let Some(max) = self.cfg.max_segment_bytes {
            if w.muxer.bytes_written() >= max {
                return true;
            }
        }
        false
    }

    /// Writes one video packet in Annex B form.
    ///
    /// A segment opens only at a keyframe; packets before the first keyframe
    /// are dropped. Rotation also happens only here, when a keyframe arrives
    /// and a rotation condition holds.
    pub fn write_video(
        &mut self,
        video_params: &h264::ExtraData,
        audio_params: Option<&AudioParams>,
        pts: i64,
        is_key: bool,
        annexb: &[u8],
    ) -> Result<(), Error> {
        match &self.state {
            WriterState::Unopened => {
                if !is_key {
                    trace!("{}: dropping pre-keyframe packet", self.cfg.stream_name);
                    return Ok(());
                }
                self.open(video_params, audio_params)?;
            }
            WriterState::Open(w) => {
                if is_key && self.should_rotate(w) {
                    trace!("{}: rotating at keyframe", self.cfg.stream_name);
                    self.close(Some("rotate"))?;
                    self.open(video_params, audio_params)?;
                }
            }
        }
        if let Err(e) = self.append_video(pts, is_key, annexb) {
            self.abort();
            return Err(e);
        }
        Ok(())
    }

    fn append_video(&mut self, pts: i64, is_key: bool, annexb: &[u8]) -> Result<(), Error> {
        h264::transform_sample_data(annexb, &mut self.avc_buf)?;
        let WriterState::Open(w) = &mut self.state else {
            unreachable!();
        };
        if is_key {
            // Fragments begin at random access points.
            w.muxer.flush_fragment()?;
        }
        let pts_u = u64::try_from(pts)
            .map_err(|_| err!(InvalidArgument, msg("negative video pts {pts}")))?;
        w.muxer.append_video(&self.avc_buf, pts_u, is_key)?;
        if w.first_pts < 0 {
            w.first_pts = pts;
        }
        w.last_pts = pts;
        Ok(())
    }

    /// Writes one audio packet. Ignored while no segment is open and when
    /// audio is disabled for the session.
    ///
    /// Audio problems never fail the recording: transcoder init or encode
    /// errors disable the track and the session continues video-only. Only a
    /// muxer write failure (shared with the video path) aborts the segment.
    pub fn write_audio(&mut self, data: &[u8]) -> Result<(), Error> {
        enum Outcome {
            Done,
            Disable(Error),
            MuxError(Error),
        }
        let outcome = {
            let WriterState::Open(w) = &mut self.state else {
                return Ok(());
            };
            match &mut w.audio {
                AudioTrackState::NoTrack | AudioTrackState::Failed => return Ok(()),
                AudioTrackState::PassThrough { pts, frame_size } => {
                    match w.muxer.append_audio(data, *pts) {
                        Ok(()) => {
                            *pts += u64::from(*frame_size);
                            Outcome::Done
                        }
                        Err(e) => Outcome::MuxError(e),
                    }
                }
                AudioTrackState::Transcode {
                    fmt,
                    sample_rate,
                    channels,
                    handle,
                    pts,
                } => {
                    let got = match handle {
                        Some(h) => Ok(h.clone()),
                        None => self
                            .registry
                            .get_or_create(&self.cfg.stream_name, *fmt, *sample_rate, *channels)
                            .map(|h| handle.insert(h).clone()),
                    };
                    match got.and_then(|h| h.lock().push(data)) {
                        Ok(frames) => {
                            let mut outcome = Outcome::Done;
                            for f in frames {
                                if let Err(e) = w.muxer.append_audio(&f.data, *pts) {
                                    outcome = Outcome::MuxError(e);
                                    break;
                                }
                                *pts += u64::from(f.samples);
                            }
                            outcome
                        }
                        Err(e) => Outcome::Disable(e),
                    }
                }
            }
        };
        match outcome {
            Outcome::Done => Ok(()),
            Outcome::Disable(e) => {
                warn!(
                    stream = %self.cfg.stream_name,
                    err = %e.chain(),
                    "audio transcode failed; continuing video-only"
                );
                if let WriterState::Open(w) = &mut self.state {
                    w.audio = AudioTrackState::Failed;
                }
                Ok(())
            }
            Outcome::MuxError(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn open(
        &mut self,
        video_params: &h264::ExtraData,
        audio_params: Option<&AudioParams>,
    ) -> Result<(), Error> {
        let now = self.clocks.realtime();
        let start = match self.prev_end {
            Some(e) if e > now => e,
            _ => now,
        };

        // One-second path resolution; avoid collisions after a quick restart.
        let base_path = self
            .dir
            .segment_path(&self.cfg.stream_name, start, self.cfg.trigger.as_str());
        let mut path = base_path.clone();
        let mut n = 0;
        while path.exists() {
            n += 1;
            if n > 5 {
                bail!(
                    AlreadyExists,
                    msg("unable to find a free segment path near {}", base_path.display())
                );
            }
            path = base_path.with_extension(format!("{n}.mp4"));
        }

        let (audio_spec, audio_state) = match audio_params {
            None => (None, AudioTrackState::NoTrack),
            Some(p) => match &p.codec {
                AudioCodec::Pcm(fmt) => (
                    Some(TrackSpec {
                        sample_entry: audio::aac_sample_entry(p.sample_rate, p.channels),
                        timescale: p.sample_rate,
                        default_dur: audio::AAC_DEFAULT_FRAME_SIZE,
                        width: 0,
                        height: 0,
                    }),
                    AudioTrackState::Transcode {
                        fmt: *fmt,
                        sample_rate: p.sample_rate,
                        channels: p.channels,
                        handle: None,
                        pts: 0,
                    },
                ),
                AudioCodec::Unsupported(name) => {
                    trace!(
                        stream = %self.cfg.stream_name,
                        codec = %name,
                        "unsupported audio codec; recording video-only"
                    );
                    (None, AudioTrackState::NoTrack)
                }
                _ => match audio::passthrough_sample_entry(p) {
                    Some(sample_entry) => (
                        Some(TrackSpec {
                            sample_entry,
                            timescale: p.sample_rate,
                            default_dur: p.effective_frame_size(),
                            width: 0,
                            height: 0,
                        }),
                        AudioTrackState::PassThrough {
                            pts: 0,
                            frame_size: p.effective_frame_size(),
                        },
                    ),
                    None => (None, AudioTrackState::NoTrack),
                },
            },
        };

        let id = self.db.lock().add_recording(RecordingToInsert {
            stream_name: self.cfg.stream_name.clone(),
            file_path: path.to_string_lossy().into_owned(),
            start_time: start,
            width: video_params.width,
            height: video_params.height,
            fps: self.cfg.fps,
            codec: video_params.rfc6381_codec.clone(),
            trigger: self.cfg.trigger,
        })?;

        let file = match self.dir.create_file(&path) {
            Ok(f) => f,
            Err(e) => {
                if let Err(e2) = self.db.lock().delete_recording(id) {
                    warn!(err = %e2.chain(), "unable to roll back recording {id}");
                }
                return Err(e);
            }
        };
        let video_spec = TrackSpec {
            sample_entry: video_params.sample_entry.clone(),
            timescale: TIME_UNITS_PER_SEC as u32,
            default_dur: self.cfg.default_sample_dur(),
            width: video_params.width,
            height: video_params.height,
        };
        let muxer = match SegmentMuxer::new(file, video_spec, audio_spec) {
            Ok(m) => m,
            Err(e) => {
                let _ = self.dir.unlink(&path);
                if let Err(e2) = self.db.lock().delete_recording(id) {
                    warn!(err = %e2.chain(), "unable to roll back recording {id}");
                }
                return Err(e);
            }
        };
        trace!(
            stream = %self.cfg.stream_name,
            id,
            path = %path.display(),
            "opened segment"
        );
        self.rotate_requested = false;
        self.state = WriterState::Open(InnerWriter {
            id,
            path,
            muxer,
            start,
            opened_at: self.clocks.monotonic(),
            first_pts: -1,
            last_pts: -1,
            audio: audio_state,
        });
        Ok(())
    }

    /// Cleanly closes the current segment, if open: flushes the muxer,
    /// fsyncs file and directory, and finalizes the catalog row.
    ///
    /// On an I/O failure the partial file and row are removed and the error
    /// returned; the caller must restart its pipeline. On a catalog failure
    /// the file is left in place with its incomplete row for the stale pass
    /// to clean, matching crash behavior.
    pub fn close(&mut self, reason: Option<&str>) -> Result<(), Error> {
        let w = match std::mem::replace(&mut self.state, WriterState::Unopened) {
            WriterState::Unopened => return Ok(()),
            WriterState::Open(w) => w,
        };
        let media_dur = if w.last_pts >= 0 && w.first_pts >= 0 {
            // Round up so a segment always occupies at least one second.
            ((w.last_pts - w.first_pts) + TIME_UNITS_PER_SEC - 1) / TIME_UNITS_PER_SEC
        } else {
            0
        };
        let end = std::cmp::max(w.start + Duration(media_dur), self.clocks.realtime());
        let id = w.id;
        let path = w.path;
        let size = match w.muxer.finish().and_then(|(mut f, size)| {
            f.sync_all()?;
            Ok(size)
        }) {
            Ok(size) => size,
            Err(e) => {
                let _ = self.dir.unlink(&path);
                if let Err(e2) = self.db.lock().delete_recording(id) {
                    warn!(err = %e2.chain(), "unable to roll back recording {id}");
                }
                return Err(e);
            }
        };
        if let Err(e) = self.dir.sync_parent(&path) {
            let _ = self.dir.unlink(&path);
            if let Err(e2) = self.db.lock().delete_recording(id) {
                warn!(err = %e2.chain(), "unable to roll back recording {id}");
            }
            return Err(e);
        }
        self.db
            .lock()
            .finalize_recording(id, end, i64::try_from(size).unwrap_or(i64::MAX))?;
        trace!(
            stream = %self.cfg.stream_name,
            id,
            reason = reason.unwrap_or("unspecified"),
            "closed segment"
        );
        self.prev_end = Some(end);
        Ok(())
    }

    /// Deletes the partial segment and its catalog row after a write error.
    fn abort(&mut self) {
        let w = match std::mem::replace(&mut self.state, WriterState::Unopened) {
            WriterState::Unopened => return,
            WriterState::Open(w) => w,
        };
        warn!(
            stream = %self.cfg.stream_name,
            id = w.id,
            path = %w.path.display(),
            "aborting segment"
        );
        drop(w.muxer);
        if let Err(e) = self.dir.unlink(&w.path) {
            warn!(err = %e.chain(), "unable to delete aborted segment");
        }
        if let Err(e) = self.db.lock().delete_recording(w.id) {
            warn!(err = %e.chain(), "unable to delete aborted recording row");
        }
    }
}

impl<C: Clocks, D: DirWriter> Drop for Writer<'_, C, D> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            // This will probably panic again. Don't do it.
            return;
        }
        // The caller should close() explicitly and report errors; this is the
        // last resort, so just log.
        if let Err(e) = self.close(Some("drop")) {
            warn!(err = %e.chain(), "error closing segment on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testutil::{failing_factory, mock_factory};
    use base::clock::SimulatedClocks;
    use db::testutil::TestDb;
    use db::ListFilter;

    // 2015-04-25 00:00:00 UTC.
    const T0: i64 = 1_429_920_000;

    const AVC_EXTRADATA: [u8; 38] = [
        0x01, 0x4d, 0x00, 0x1f, 0xff, 0xe1, 0x00, 0x17, 0x67, 0x4d, 0x00, 0x1f, 0x9a, 0x66, 0x02,
        0x80, 0x2d, 0xff, 0x35, 0x01, 0x01, 0x01, 0x40, 0x00, 0x00, 0xfa, 0x00, 0x00, 0x1d, 0x4c,
        0x01, 0x01, 0x00, 0x04, 0x68, 0xee, 0x3c, 0x80,
    ];

    fn extradata() -> h264::ExtraData {
        h264::ExtraData::parse(&AVC_EXTRADATA, 1280, 720).unwrap()
    }

    fn annexb(key: bool) -> Vec<u8> {
        let mut v = vec![0, 0, 0, 1, if key { 0x65 } else { 0x41 }];
        v.extend_from_slice(b"payload");
        v
    }

    fn config(seconds: u64) -> WriterConfig {
        WriterConfig {
            stream_name: "front".to_owned(),
            trigger: TriggerKind::Scheduled,
            segment_duration: std::time::Duration::from_secs(seconds),
            max_segment_bytes: None,
            fps: 1.0,
        }
    }

    fn complete_rows(db: &Arc<Database>) -> Vec<db::RecordingRow> {
        db.lock()
            .list_recordings(
                &ListFilter::default(),
                db::SortField::StartTime,
                db::SortOrder::Asc,
                100,
                0,
            )
            .unwrap()
            .0
    }

    #[test]
    fn keyframe_aligned_rotation() {
        db::testutil::init();
        let tdb = TestDb::new();
        let dir = tdb.archive_dir();
        let clocks = SimulatedClocks::new(Time(T0));
        let registry = TranscoderRegistry::new(mock_factory);
        let ed = extradata();
        let mut w = Writer::new(&dir, &tdb.db, &clocks, &registry, config(2));

        // Keyframe at t=0 opens the first segment.
        w.write_video(&ed, None, 0, true, &annexb(true)).unwrap();
        clocks.sleep(std::time::Duration::from_secs(1));
        w.write_video(&ed, None, 90_000, false, &annexb(false)).unwrap();
        clocks.sleep(std::time::Duration::from_secs(1));
        // Rotation condition now holds, but this packet is not a keyframe.
        w.write_video(&ed, None, 180_000, false, &annexb(false)).unwrap();
        assert_eq!(complete_rows(&tdb.db).len(), 0, "still in first segment");
        clocks.sleep(std::time::Duration::from_secs(1));
        // Keyframe: the first segment closes and the second begins with it.
        w.write_video(&ed, None, 270_000, true, &annexb(true)).unwrap();
        clocks.sleep(std::time::Duration::from_secs(1));
        w.write_video(&ed, None, 360_000, false, &annexb(false)).unwrap();
        w.close(Some("test")).unwrap();

        let rows = complete_rows(&tdb.db);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].start_time, Time(T0));
        assert!(rows[0].end_time.unwrap() >= Time(T0 + 2));
        assert!(rows[1].start_time >= rows[0].end_time.unwrap(), "no overlap");
        for r in &rows {
            let path = PathBuf::from(r.file_path.clone().unwrap());
            assert!(path.exists());
            let md = std::fs::metadata(&path).unwrap();
            assert_eq!(md.len() as i64, r.size_bytes);
            let types = crate::mp4::top_level_box_types(&path).unwrap();
            assert_eq!(&types[0], b"ftyp");
            let moov = types.iter().position(|t| t == b"moov").unwrap();
            let mdat = types.iter().position(|t| t == b"mdat").unwrap();
            assert!(moov < mdat);
        }
        let first = crate::mp4::read_segment(&PathBuf::from(rows[0].file_path.clone().unwrap()))
            .unwrap();
        let v: Vec<_> = first
            .samples
            .iter()
            .filter(|s| s.track == crate::mp4::TrackKind::Video)
            .collect();
        assert_eq!(v.len(), 3);
        assert!(v[0].is_sync);
        let second = crate::mp4::read_segment(&PathBuf::from(rows[1].file_path.clone().unwrap()))
            .unwrap();
        let v: Vec<_> = second
            .samples
            .iter()
            .filter(|s| s.track == crate::mp4::TrackKind::Video)
            .collect();
        assert_eq!(v.len(), 2);
        assert!(v[0].is_sync);
    }

    #[test]
    fn no_keyframe_no_segment() {
        db::testutil::init();
        let tdb = TestDb::new();
        let dir = tdb.archive_dir();
        let clocks = SimulatedClocks::new(Time(T0));
        let registry = TranscoderRegistry::new(mock_factory);
        let ed = extradata();
        let mut w = Writer::new(&dir, &tdb.db, &clocks, &registry, config(60));
        for i in 0..5 {
            w.write_video(&ed, None, i * 3_000, false, &annexb(false))
                .unwrap();
        }
        w.close(None).unwrap();
        assert!(complete_rows(&tdb.db).is_empty());
        assert!(!dir.stream_root("front").exists());
        // And nothing incomplete left behind either.
        assert!(tdb
            .db
            .lock()
            .stale_incomplete(Time(i64::MAX), 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn pcm_audio_is_transcoded() {
        db::testutil::init();
        let tdb = TestDb::new();
        let dir = tdb.archive_dir();
        let clocks = SimulatedClocks::new(Time(T0));
        let registry = TranscoderRegistry::new(mock_factory);
        let ed = extradata();
        let audio = AudioParams::from_rtsp("pcmu", 8_000, 1);
        let mut w = Writer::new(&dir, &tdb.db, &clocks, &registry, config(60));
        w.write_video(&ed, Some(&audio), 0, true, &annexb(true))
            .unwrap();
        // Two full encoder frames of u-law silence.
        w.write_audio(&[0xffu8; 1024]).unwrap();
        w.write_audio(&[0xffu8; 1024]).unwrap();
        w.write_video(&ed, Some(&audio), 90_000, false, &annexb(false))
            .unwrap();
        w.close(None).unwrap();

        let rows = complete_rows(&tdb.db);
        assert_eq!(rows.len(), 1);
        let info =
            crate::mp4::read_segment(&PathBuf::from(rows[0].file_path.clone().unwrap())).unwrap();
        assert_eq!(info.audio_timescale, 8_000);
        let entry = info.audio_sample_entry.as_ref().unwrap();
        assert_eq!(&entry[4..8], b"mp4a");
        let audio_samples = info
            .samples
            .iter()
            .filter(|s| s.track == crate::mp4::TrackKind::Audio)
            .count();
        assert_eq!(audio_samples, 2);
    }

    #[test]
    fn encoder_init_failure_records_video_only() {
        db::testutil::init();
        let tdb = TestDb::new();
        let dir = tdb.archive_dir();
        let clocks = SimulatedClocks::new(Time(T0));
        let registry = TranscoderRegistry::new(failing_factory);
        let ed = extradata();
        let audio = AudioParams::from_rtsp("pcmu", 8_000, 1);
        let mut w = Writer::new(&dir, &tdb.db, &clocks, &registry, config(60));
        w.write_video(&ed, Some(&audio), 0, true, &annexb(true))
            .unwrap();
        w.write_audio(&[0xffu8; 2048]).unwrap(); // init fails, audio disabled
        w.write_audio(&[0xffu8; 2048]).unwrap(); // silently dropped
        w.write_video(&ed, Some(&audio), 90_000, false, &annexb(false))
            .unwrap();
        w.close(None).unwrap();

        let rows = complete_rows(&tdb.db);
        assert_eq!(rows.len(), 1, "recording completes despite audio failure");
        let info =
            crate::mp4::read_segment(&PathBuf::from(rows[0].file_path.clone().unwrap())).unwrap();
        let audio_samples = info
            .samples
            .iter()
            .filter(|s| s.track == crate::mp4::TrackKind::Audio)
            .count();
        assert_eq!(audio_samples, 0);
        assert_eq!(
            info.samples
                .iter()
                .filter(|s| s.track == crate::mp4::TrackKind::Video)
                .count(),
            2
        );
    }

    #[test]
    fn explicit_rotate_waits_for_keyframe() {
        db::testutil::init();
        let tdb = TestDb::new();
        let dir = tdb.archive_dir();
        let clocks = SimulatedClocks::new(Time(T0));
        let registry = TranscoderRegistry::new(mock_factory);
        let ed = extradata();
        let mut w = Writer::new(&dir, &tdb.db, &clocks, &registry, config(600));
        w.write_video(&ed, None, 0, true, &annexb(true)).unwrap();
        w.request_rotate();
        clocks.sleep(std::time::Duration::from_secs(1));
        w.write_video(&ed, None, 90_000, false, &annexb(false)).unwrap();
        assert_eq!(complete_rows(&tdb.db).len(), 0);
        clocks.sleep(std::time::Duration::from_secs(1));
        w.write_video(&ed, None, 180_000, true, &annexb(true)).unwrap();
        assert_eq!(complete_rows(&tdb.db).len(), 1);
        w.close(None).unwrap();
        assert_eq!(complete_rows(&tdb.db).len(), 2);
    }

    struct FailDir {
        root: PathBuf,
    }

    struct FailFile;

    impl std::io::Write for FailFile {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("mock write failure"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SegmentFile for FailFile {
        fn sync_all(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    impl DirWriter for FailDir {
        type File = FailFile;

        fn segment_path(&self, stream_name: &str, start: Time, trigger: &str) -> PathBuf {
            self.root.join(format!("{stream_name}-{}-{trigger}.mp4", start.0))
        }
        fn create_file(&self, _path: &Path) -> Result<Self::File, Error> {
            Ok(FailFile)
        }
        fn sync_parent(&self, _path: &Path) -> Result<(), Error> {
            Ok(())
        }
        fn unlink(&self, _path: &Path) -> Result<bool, Error> {
            Ok(false)
        }
    }

    #[test]
    fn write_failure_rolls_back_file_and_row() {
        db::testutil::init();
        let tdb = TestDb::new();
        let clocks = SimulatedClocks::new(Time(T0));
        let registry = TranscoderRegistry::new(mock_factory);
        let ed = extradata();
        let dir = FailDir {
            root: tdb.tmpdir.path().to_owned(),
        };
        let mut w = Writer::new(&dir, &tdb.db, &clocks, &registry, config(60));
        // The muxer head write fails immediately; open must roll back.
        w.write_video(&ed, None, 0, true, &annexb(true)).unwrap_err();
        assert!(complete_rows(&tdb.db).is_empty());
        assert!(tdb
            .db
            .lock()
            .stale_incomplete(Time(i64::MAX), 10)
            .unwrap()
            .is_empty());
    }
}
