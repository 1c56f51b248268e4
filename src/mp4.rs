// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Fragmented `.mp4` segment muxing and reading.
//!
//! Layout per segment file: `ftyp`, then `moov` (with `mvex`) describing the
//! tracks with empty sample tables, then one `moof`+`mdat` pair per fragment.
//! The metadata atom therefore precedes all media data, so a finalized file
//! is immediately playable and even a crash-truncated file is valid up to its
//! last complete fragment. Fragments are cut at video keyframes by the
//! caller, making each fragment independently decodable.
//!
//! See the BMFF spec, ISO/IEC 14496-12:2015.

use base::{bail, err, Error};
use bytes::{BufMut, BytesMut};
use byteorder::{BigEndian, ByteOrder};
use std::io::Write;
use std::path::Path;

/// Writes a box length for everything appended in the supplied scope.
macro_rules! write_box {
    ($buf:expr, $fourcc:expr, $b:block) => {{
        let _: &mut BytesMut = $buf; // type-check.
        let pos_start = $buf.len();
        let fourcc: &[u8; 4] = $fourcc;
        $buf.extend_from_slice(&[0, 0, 0, 0, fourcc[0], fourcc[1], fourcc[2], fourcc[3]]);
        let r = {
            $b;
        };
        let pos_end = $buf.len();
        let len = pos_end.checked_sub(pos_start).unwrap();
        $buf[pos_start..pos_start + 4]
            .copy_from_slice(&u32::try_from(len).expect("box fits u32").to_be_bytes()[..]);
        r
    }};
}
pub(crate) use write_box;

/// `sample_flags` for a sync sample: `sample_depends_on` = 2 (independent).
const SYNC_SAMPLE_FLAGS: u32 = 0x0200_0000;

/// `sample_flags` for a non-sync sample: depends on others, non-sync bit set.
const NON_SYNC_SAMPLE_FLAGS: u32 = 0x0101_0000;

const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
const TRUN_SAMPLE_DURATION: u32 = 0x000100;
const TRUN_SAMPLE_SIZE: u32 = 0x000200;

/// Description of one track for [`SegmentMuxer::new`].
#[derive(Clone, Debug)]
pub struct TrackSpec {
    /// A complete sample entry box (`avc1`, `mp4a`, ...) to place in `stsd`.
    pub sample_entry: Vec<u8>,

    /// The track's media timescale: 90 kHz for video, the sample rate for
    /// audio.
    pub timescale: u32,

    /// Duration in timescale units assumed for a sample when the following
    /// sample's timestamp is not yet known.
    pub default_dur: u32,

    /// Pixel dimensions; 0 for audio.
    pub width: u32,
    pub height: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrackKind {
    Video,
    Audio,
}

struct Trak {
    track_id: u32,
    spec: TrackSpec,

    /// `(duration, size)` of samples in the current fragment. As in the
    /// `trun` box, a sample's duration is the difference between its
    /// timestamp and the next sample's; the writer assigns it retroactively,
    /// so the duration recorded for sample `i` is actually the gap preceding
    /// it. The first sample of a segment gets `default_dur`.
    samples: Vec<(u32, u32)>,

    /// Media payload of the current fragment.
    data: Vec<u8>,

    /// Decode time of the current fragment's first sample, in timescale
    /// units.
    base_time: u64,

    last_pts: Option<u64>,
    first_is_sync: bool,
}

impl Trak {
    fn new(track_id: u32, spec: TrackSpec) -> Self {
        Trak {
            track_id,
            spec,
            samples: Vec::new(),
            data: Vec::new(),
            base_time: 0,
            last_pts: None,
            first_is_sync: false,
        }
    }

    fn add_sample(&mut self, data: &[u8], pts: u64, is_sync: bool) -> Result<(), Error> {
        let dur = match self.last_pts {
            None => self.spec.default_dur,
            Some(last) => {
                if pts < last {
                    bail!(
                        InvalidArgument,
                        msg("pts not monotonically increasing; got {last} then {pts}")
                    );
                }
                u32::try_from(pts - last)
                    .map_err(|_| err!(OutOfRange, msg("excessive pts jump from {last} to {pts}")))?
            }
        };
        if self.samples.is_empty() {
            self.first_is_sync = is_sync;
        }
        self.last_pts = Some(pts);
        self.samples.push((
            dur,
            u32::try_from(data.len()).map_err(|_| err!(OutOfRange, msg("oversized sample")))?,
        ));
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn fragment_duration(&self) -> u64 {
        self.samples.iter().map(|&(d, _)| u64::from(d)).sum()
    }

    /// Writes `traf` for the current fragment. Returns the buffer position of
    /// the `trun` `data_offset` placeholder.
    fn write_traf(&self, buf: &mut BytesMut) -> usize {
        let data_offset_pos;
        write_box!(buf, b"traf", {
            write_box!(buf, b"tfhd", {
                buf.put_u32(0x020000); // default-base-is-moof
                buf.put_u32(self.track_id);
            });
            write_box!(buf, b"tfdt", {
                buf.put_u32(1 << 24); // version 1
                buf.put_u64(self.base_time);
            });
            write_box!(buf, b"trun", {
                buf.put_u32(
                    TRUN_DATA_OFFSET
                        | TRUN_FIRST_SAMPLE_FLAGS
                        | TRUN_SAMPLE_DURATION
                        | TRUN_SAMPLE_SIZE,
                );
                buf.put_u32(u32::try_from(self.samples.len()).expect("fragment fits u32"));
                data_offset_pos = buf.len();
                buf.put_i32(0); // data_offset placeholder
                buf.put_u32(if self.first_is_sync {
                    SYNC_SAMPLE_FLAGS
                } else {
                    NON_SYNC_SAMPLE_FLAGS
                });
                for &(dur, size) in &self.samples {
                    buf.put_u32(dur);
                    buf.put_u32(size);
                }
            });
        });
        data_offset_pos
    }

    fn clear_fragment(&mut self) {
        self.base_time += self.fragment_duration();
        self.samples.clear();
        self.data.clear();
        self.first_is_sync = false;
    }

    fn write_trak(&self, buf: &mut BytesMut) {
        let is_video = self.spec.width != 0;
        write_box!(buf, b"trak", {
            write_box!(buf, b"tkhd", {
                buf.put_u32((1 << 24) | 7); // version 1, flags: enabled+in-movie+in-preview
                buf.put_u64(0); // creation_time
                buf.put_u64(0); // modification_time
                buf.put_u32(self.track_id);
                buf.put_u32(0); // reserved
                buf.put_u64(0); // duration: unknown for fragmented files
                buf.put_u64(0); // reserved
                buf.put_u16(0); // layer
                buf.put_u16(0); // alternate_group
                buf.put_u16(if is_video { 0 } else { 0x0100 }); // volume
                buf.put_u16(0); // reserved
                for v in &[0x00010000u32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
                    buf.put_u32(*v); // matrix
                }
                buf.put_u32(self.spec.width << 16);
                buf.put_u32(self.spec.height << 16);
            });
            write_box!(buf, b"mdia", {
                write_box!(buf, b"mdhd", {
                    buf.put_u32(1 << 24); // version 1
                    buf.put_u64(0); // creation_time
                    buf.put_u64(0); // modification_time
                    buf.put_u32(self.spec.timescale);
                    buf.put_u64(0); // duration: unknown
                    buf.put_u32(0x55c4_0000); // language=und + pre_defined
                });
                write_box!(buf, b"hdlr", {
                    buf.put_u32(0); // version + flags
                    buf.put_u32(0); // pre_defined
                    buf.extend_from_slice(if is_video { b"vide" } else { b"soun" });
                    buf.put_u32(0); // reserved[0]
                    buf.put_u32(0); // reserved[1]
                    buf.put_u32(0); // reserved[2]
                    buf.put_u8(0); // name, zero-terminated (empty)
                });
                write_box!(buf, b"minf", {
                    if is_video {
                        write_box!(buf, b"vmhd", {
                            buf.put_u32(1);
                            buf.put_u64(0);
                        });
                    } else {
                        write_box!(buf, b"smhd", {
                            buf.put_u32(0);
                            buf.put_u32(0);
                        });
                    }
                    write_box!(buf, b"dinf", {
                        write_box!(buf, b"dref", {
                            buf.put_u32(0);
                            buf.put_u32(1); // entry_count
                            write_box!(buf, b"url ", {
                                buf.put_u32(1); // flags: self-contained
                            });
                        });
                    });
                    write_box!(buf, b"stbl", {
                        write_box!(buf, b"stsd", {
                            buf.put_u32(0); // version
                            buf.put_u32(1); // entry_count
                            buf.extend_from_slice(&self.spec.sample_entry);
                        });
                        // Empty fixed sample tables; all samples arrive in
                        // movie fragments.
                        write_box!(buf, b"stts", {
                            buf.put_u32(0);
                            buf.put_u32(0);
                        });
                        write_box!(buf, b"stsc", {
                            buf.put_u32(0);
                            buf.put_u32(0);
                        });
                        write_box!(buf, b"stsz", {
                            buf.put_u32(0);
                            buf.put_u32(0); // sample_size
                            buf.put_u32(0); // sample_count
                        });
                        write_box!(buf, b"stco", {
                            buf.put_u32(0);
                            buf.put_u32(0);
                        });
                    });
                });
            });
        });
    }
}

/// Writes one fragmented `.mp4` segment to a byte sink.
pub struct SegmentMuxer<W: Write> {
    inner: W,
    pos: u64,
    video: Trak,
    audio: Option<Trak>,
    seq_no: u32,
}

impl<W: Write> SegmentMuxer<W> {
    /// Writes the `ftyp` and `moov` head and returns the muxer.
    pub fn new(inner: W, video: TrackSpec, audio: Option<TrackSpec>) -> Result<Self, Error> {
        let mut m = SegmentMuxer {
            inner,
            pos: 0,
            video: Trak::new(1, video),
            audio: audio.map(|spec| Trak::new(2, spec)),
            seq_no: 1,
        };
        let mut buf = BytesMut::with_capacity(1024);
        write_box!(&mut buf, b"ftyp", {
            buf.extend_from_slice(b"isom"); // major_brand
            buf.put_u32(0x200); // minor_version
            buf.extend_from_slice(b"isom");
            buf.extend_from_slice(b"iso6");
            buf.extend_from_slice(b"avc1");
            buf.extend_from_slice(b"mp41");
        });
        write_box!(&mut buf, b"moov", {
            write_box!(&mut buf, b"mvhd", {
                buf.put_u32(1 << 24); // version 1
                buf.put_u64(0); // creation_time
                buf.put_u64(0); // modification_time
                buf.put_u32(m.video.spec.timescale);
                buf.put_u64(0); // duration: unknown for fragmented files
                buf.put_u32(0x00010000); // rate
                buf.put_u16(0x0100); // volume
                buf.put_u16(0); // reserved
                buf.put_u64(0); // reserved
                for v in &[0x00010000u32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
                    buf.put_u32(*v); // matrix
                }
                for _ in 0..6 {
                    buf.put_u32(0); // pre_defined
                }
                buf.put_u32(if m.audio.is_some() { 3 } else { 2 }); // next_track_id
            });
            m.video.write_trak(&mut buf);
            if let Some(a) = &m.audio {
                a.write_trak(&mut buf);
            }
            write_box!(&mut buf, b"mvex", {
                for track_id in
                    std::iter::once(1).chain(m.audio.is_some().then_some(2))
                {
                    write_box!(&mut buf, b"trex", {
                        buf.put_u32(0); // version, flags
                        buf.put_u32(track_id);
                        buf.put_u32(1); // default_sample_description_index
                        buf.put_u32(0); // default_sample_duration: use trun
                        buf.put_u32(0); // default_sample_size: use trun
                        buf.put_u32(NON_SYNC_SAMPLE_FLAGS);
                    });
                }
            });
        });
        m.write_all(&buf)?;
        Ok(m)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.inner.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    /// Bytes committed to the sink so far, excluding any unflushed fragment.
    pub fn bytes_written(&self) -> u64 {
        self.pos
    }

    /// Appends a video sample in AVC (length-prefixed) form. `pts` is in the
    /// video track's timescale and must be monotonically non-decreasing.
    pub fn append_video(&mut self, data: &[u8], pts: u64, is_sync: bool) -> Result<(), Error> {
        self.video.add_sample(data, pts, is_sync)
    }

    /// Appends an audio sample (one codec frame). `pts` is in the audio
    /// track's timescale.
    pub fn append_audio(&mut self, data: &[u8], pts: u64) -> Result<(), Error> {
        match &mut self.audio {
            Some(a) => a.add_sample(data, pts, false),
            None => bail!(FailedPrecondition, msg("no audio track")),
        }
    }

    /// Writes the buffered samples as one `moof`+`mdat` pair. A no-op when
    /// nothing is buffered. The caller invokes this just before appending a
    /// video keyframe, so fragments begin at random access points.
    pub fn flush_fragment(&mut self) -> Result<(), Error> {
        let video_samples = self.video.samples.len();
        let audio_samples = self.audio.as_ref().map(|a| a.samples.len()).unwrap_or(0);
        if video_samples == 0 && audio_samples == 0 {
            return Ok(());
        }

        let mut moof = BytesMut::with_capacity(
            256 + 8 * (video_samples + audio_samples),
        );
        let mut video_offset_pos = None;
        let mut audio_offset_pos = None;
        write_box!(&mut moof, b"moof", {
            write_box!(&mut moof, b"mfhd", {
                moof.put_u32(0);
                moof.put_u32(self.seq_no);
            });
            if video_samples > 0 {
                video_offset_pos = Some(self.video.write_traf(&mut moof));
            }
            if audio_samples > 0 {
                if let Some(a) = &self.audio {
                    audio_offset_pos = Some(a.write_traf(&mut moof));
                }
            }
        });

        // Patch `trun` data offsets, which are relative to the start of the
        // `moof`: media payload begins just past the mdat header, video bytes
        // first, then audio.
        let mdat_payload_start = i32::try_from(moof.len() + 8)
            .map_err(|_| err!(OutOfRange, msg("oversized moof")))?;
        if let Some(pos) = video_offset_pos {
            BigEndian::write_i32(&mut moof[pos..pos + 4], mdat_payload_start);
        }
        if let Some(pos) = audio_offset_pos {
            let off = mdat_payload_start
                .checked_add(i32::try_from(self.video.data.len()).expect("fragment fits i32"))
                .ok_or_else(|| err!(OutOfRange, msg("oversized fragment")))?;
            BigEndian::write_i32(&mut moof[pos..pos + 4], off);
        }

        let audio_len = self.audio.as_ref().map(|a| a.data.len()).unwrap_or(0);
        let mdat_len = u32::try_from(8 + self.video.data.len() + audio_len)
            .map_err(|_| err!(OutOfRange, msg("oversized fragment")))?;

        let moof = moof.freeze();
        self.write_all(&moof)?;
        self.write_all(&mdat_len.to_be_bytes())?;
        self.write_all(b"mdat")?;
        let video_data = std::mem::take(&mut self.video.data);
        self.write_all(&video_data)?;
        if let Some(a) = &mut self.audio {
            let audio_data = std::mem::take(&mut a.data);
            self.write_all(&audio_data)?;
        }

        self.seq_no = self.seq_no.wrapping_add(1);
        self.video.clear_fragment();
        if let Some(a) = &mut self.audio {
            a.clear_fragment();
        }
        Ok(())
    }

    /// Flushes any pending fragment and returns the sink and total length.
    pub fn finish(mut self) -> Result<(W, u64), Error> {
        self.flush_fragment()?;
        self.inner.flush()?;
        Ok((self.inner, self.pos))
    }
}

/// One sample read back from a segment file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentSample {
    pub track: TrackKind,

    /// Decode time in the track's timescale, from `tfdt` plus accumulated
    /// durations.
    pub pts: u64,

    pub dur: u32,
    pub size: u32,
    pub is_sync: bool,

    /// Byte offset of the sample payload within the file.
    pub offset: u64,
}

/// Parsed description of a segment file produced by [`SegmentMuxer`].
#[derive(Clone, Debug)]
pub struct SegmentInfo {
    pub video_sample_entry: Vec<u8>,
    pub video_timescale: u32,
    pub audio_sample_entry: Option<Vec<u8>>,
    pub audio_timescale: u32,
    pub samples: Vec<SegmentSample>,
}

struct BoxIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BoxIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        BoxIter { data, pos: 0 }
    }

    /// Returns `(fourcc, body, body_file_offset)` of the next box.
    fn next(&mut self) -> Result<Option<([u8; 4], &'a [u8], usize)>, Error> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        if self.data.len() - self.pos < 8 {
            bail!(DataLoss, msg("truncated box header"));
        }
        let size = BigEndian::read_u32(&self.data[self.pos..self.pos + 4]) as usize;
        let mut fourcc = [0u8; 4];
        fourcc.copy_from_slice(&self.data[self.pos + 4..self.pos + 8]);
        if size < 8 || self.pos + size > self.data.len() {
            bail!(
                DataLoss,
                msg(
                    "box {:?} of size {size} exceeds remaining {}",
                    String::from_utf8_lossy(&fourcc),
                    self.data.len() - self.pos
                )
            );
        }
        let body = &self.data[self.pos + 8..self.pos + size];
        let body_off = self.pos + 8;
        self.pos += size;
        Ok(Some((fourcc, body, body_off)))
    }
}

fn find_box<'a>(data: &'a [u8], fourcc: &[u8; 4]) -> Result<Option<&'a [u8]>, Error> {
    let mut it = BoxIter::new(data);
    while let Some((cc, body, _)) = it.next()? {
        if &cc == fourcc {
            return Ok(Some(body));
        }
    }
    Ok(None)
}

struct TrakInfo {
    track_id: u32,
    timescale: u32,
    handler: [u8; 4],
    sample_entry: Vec<u8>,
}

fn parse_trak(body: &[u8]) -> Result<TrakInfo, Error> {
    let tkhd = find_box(body, b"tkhd")?
        .ok_or_else(|| err!(DataLoss, msg("trak without tkhd")))?;
    let version = *tkhd.first().ok_or_else(|| err!(DataLoss, msg("empty tkhd")))?;
    let track_id_off = match version {
        1 => 4 + 8 + 8,
        _ => 4 + 4 + 4,
    };
    if tkhd.len() < track_id_off + 4 {
        bail!(DataLoss, msg("short tkhd"));
    }
    let track_id = BigEndian::read_u32(&tkhd[track_id_off..track_id_off + 4]);

    let mdia = find_box(body, b"mdia")?
        .ok_or_else(|| err!(DataLoss, msg("trak without mdia")))?;
    let mdhd = find_box(mdia, b"mdhd")?
        .ok_or_else(|| err!(DataLoss, msg("mdia without mdhd")))?;
    let version = *mdhd.first().ok_or_else(|| err!(DataLoss, msg("empty mdhd")))?;
    let ts_off = match version {
        1 => 4 + 8 + 8,
        _ => 4 + 4 + 4,
    };
    if mdhd.len() < ts_off + 4 {
        bail!(DataLoss, msg("short mdhd"));
    }
    let timescale = BigEndian::read_u32(&mdhd[ts_off..ts_off + 4]);

    let hdlr = find_box(mdia, b"hdlr")?
        .ok_or_else(|| err!(DataLoss, msg("mdia without hdlr")))?;
    if hdlr.len() < 12 {
        bail!(DataLoss, msg("short hdlr"));
    }
    let mut handler = [0u8; 4];
    handler.copy_from_slice(&hdlr[8..12]);

    let minf = find_box(mdia, b"minf")?
        .ok_or_else(|| err!(DataLoss, msg("mdia without minf")))?;
    let stbl = find_box(minf, b"stbl")?
        .ok_or_else(|| err!(DataLoss, msg("minf without stbl")))?;
    let stsd = find_box(stbl, b"stsd")?
        .ok_or_else(|| err!(DataLoss, msg("stbl without stsd")))?;
    if stsd.len() < 8 {
        bail!(DataLoss, msg("short stsd"));
    }
    // First (sole) entry follows the version/flags + entry_count words.
    let entry = &stsd[8..];
    if entry.len() < 8 {
        bail!(DataLoss, msg("empty stsd"));
    }
    let entry_len = BigEndian::read_u32(&entry[0..4]) as usize;
    if entry_len < 8 || entry_len > entry.len() {
        bail!(DataLoss, msg("bad stsd entry length {entry_len}"));
    }
    Ok(TrakInfo {
        track_id,
        timescale,
        handler,
        sample_entry: entry[..entry_len].to_vec(),
    })
}

/// Parses a fragmented segment file written by [`SegmentMuxer`].
pub fn read_segment(path: &Path) -> Result<SegmentInfo, Error> {
    let data = std::fs::read(path)
        .map_err(|e| err!(Unknown, msg("unable to read {}", path.display()), source(e)))?;
    parse_segment(&data)
}

fn parse_segment(data: &[u8]) -> Result<SegmentInfo, Error> {
    let mut video: Option<TrakInfo> = None;
    let mut audio: Option<TrakInfo> = None;
    let mut samples = Vec::new();
    let mut saw_ftyp = false;

    let mut it = BoxIter::new(data);
    while let Some((fourcc, body, body_off)) = it.next()? {
        match &fourcc {
            b"ftyp" => saw_ftyp = true,
            b"moov" => {
                let mut moov_it = BoxIter::new(body);
                while let Some((cc, trak_body, _)) = moov_it.next()? {
                    if &cc == b"trak" {
                        let t = parse_trak(trak_body)?;
                        match &t.handler {
                            b"vide" => video = Some(t),
                            b"soun" => audio = Some(t),
                            other => bail!(
                                Unimplemented,
                                msg("unknown handler {:?}", String::from_utf8_lossy(other))
                            ),
                        }
                    }
                }
            }
            b"moof" => {
                let moof_start = body_off - 8;
                let video_id = video.as_ref().map(|t| t.track_id);
                parse_moof(body, moof_start, video_id, &mut samples)?;
            }
            _ => {}
        }
    }
    if !saw_ftyp {
        bail!(DataLoss, msg("not a segment file: no ftyp"));
    }
    let video = video.ok_or_else(|| err!(DataLoss, msg("no video track")))?;
    Ok(SegmentInfo {
        video_sample_entry: video.sample_entry,
        video_timescale: video.timescale,
        audio_sample_entry: audio.as_ref().map(|a| a.sample_entry.clone()),
        audio_timescale: audio.map(|a| a.timescale).unwrap_or(0),
        samples,
    })
}

fn parse_moof(
    body: &[u8],
    moof_start: usize,
    video_track_id: Option<u32>,
    samples: &mut Vec<SegmentSample>,
) -> Result<(), Error> {
    let mut it = BoxIter::new(body);
    while let Some((cc, traf, _)) = it.next()? {
        if &cc != b"traf" {
            continue;
        }
        let tfhd = find_box(traf, b"tfhd")?
            .ok_or_else(|| err!(DataLoss, msg("traf without tfhd")))?;
        if tfhd.len() < 8 {
            bail!(DataLoss, msg("short tfhd"));
        }
        let track_id = BigEndian::read_u32(&tfhd[4..8]);
        let track = if Some(track_id) == video_track_id {
            TrackKind::Video
        } else {
            TrackKind::Audio
        };

        let tfdt = find_box(traf, b"tfdt")?
            .ok_or_else(|| err!(DataLoss, msg("traf without tfdt")))?;
        let base_time = match tfdt.first() {
            Some(1) if tfdt.len() >= 12 => BigEndian::read_u64(&tfdt[4..12]),
            Some(0) if tfdt.len() >= 8 => u64::from(BigEndian::read_u32(&tfdt[4..8])),
            _ => bail!(DataLoss, msg("bad tfdt")),
        };

        let trun = find_box(traf, b"trun")?
            .ok_or_else(|| err!(DataLoss, msg("traf without trun")))?;
        if trun.len() < 8 {
            bail!(DataLoss, msg("short trun"));
        }
        let flags = BigEndian::read_u32(&trun[0..4]) & 0x00ff_ffff;
        let count = BigEndian::read_u32(&trun[4..8]) as usize;
        let mut pos = 8;
        let mut need = |n: usize, pos: &mut usize| -> Result<usize, Error> {
            let p = *pos;
            if trun.len() < p + n {
                bail!(DataLoss, msg("truncated trun"));
            }
            *pos += n;
            Ok(p)
        };
        if flags & TRUN_DATA_OFFSET == 0 {
            bail!(Unimplemented, msg("trun without data offset"));
        }
        let p = need(4, &mut pos)?;
        let data_offset = BigEndian::read_i32(&trun[p..p + 4]);
        let first_sample_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
            let p = need(4, &mut pos)?;
            Some(BigEndian::read_u32(&trun[p..p + 4]))
        } else {
            None
        };
        if flags & (TRUN_SAMPLE_DURATION | TRUN_SAMPLE_SIZE)
            != (TRUN_SAMPLE_DURATION | TRUN_SAMPLE_SIZE)
        {
            bail!(Unimplemented, msg("trun without per-sample duration+size"));
        }

        let mut pts = base_time;
        let mut offset = u64::try_from(moof_start)
            .expect("file offsets fit u64")
            .checked_add_signed(i64::from(data_offset))
            .ok_or_else(|| err!(DataLoss, msg("negative sample offset")))?;
        for i in 0..count {
            let p = need(8, &mut pos)?;
            let dur = BigEndian::read_u32(&trun[p..p + 4]);
            let size = BigEndian::read_u32(&trun[p + 4..p + 8]);
            let is_sync = match (i, first_sample_flags, track) {
                (0, Some(f), TrackKind::Video) => f & 0x0001_0000 == 0,
                (_, _, TrackKind::Audio) => true,
                _ => false,
            };
            samples.push(SegmentSample {
                track,
                pts,
                dur,
                size,
                is_sync,
                offset,
            });
            pts += u64::from(dur);
            offset += u64::from(size);
        }
    }
    Ok(())
}

/// Reads the pixel dimensions out of a visual sample entry box
/// (ISO/IEC 14496-12 section 12.1.3: 16-bit width and height at fixed
/// offsets past the SampleEntry header).
pub fn sample_entry_dimensions(entry: &[u8]) -> Option<(u32, u32)> {
    if entry.len() < 36 {
        return None;
    }
    let w = u32::from(BigEndian::read_u16(&entry[32..34]));
    let h = u32::from(BigEndian::read_u16(&entry[34..36]));
    (w != 0 && h != 0).then_some((w, h))
}

/// Returns the top-level box types of the file at `path`, in order.
pub fn top_level_box_types(path: &Path) -> Result<Vec<[u8; 4]>, Error> {
    let data = std::fs::read(path)
        .map_err(|e| err!(Unknown, msg("unable to read {}", path.display()), source(e)))?;
    let mut it = BoxIter::new(&data);
    let mut types = Vec::new();
    while let Some((fourcc, _, _)) = it.next()? {
        types.push(fourcc);
    }
    Ok(types)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// A minimal but structurally valid `avc1` entry for tests.
    pub fn test_video_spec() -> TrackSpec {
        let extradata: [u8; 38] = [
            0x01, 0x4d, 0x00, 0x1f, 0xff, 0xe1, 0x00, 0x17, 0x67, 0x4d, 0x00, 0x1f, 0x9a, 0x66,
            0x02, 0x80, 0x2d, 0xff, 0x35, 0x01, 0x01, 0x01, 0x40, 0x00, 0x00, 0xfa, 0x00, 0x00,
            0x1d, 0x4c, 0x01, 0x01, 0x00, 0x04, 0x68, 0xee, 0x3c, 0x80,
        ];
        let e = crate::h264::ExtraData::parse(&extradata, 1280, 720).unwrap();
        TrackSpec {
            sample_entry: e.sample_entry,
            timescale: 90_000,
            default_dur: 3_000,
            width: 1280,
            height: 720,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::test_video_spec;
    use super::*;

    fn write_test_segment(path: &Path, with_audio: bool) {
        let f = std::fs::File::create(path).unwrap();
        let audio = with_audio.then(|| TrackSpec {
            sample_entry: crate::audio::aac_sample_entry(8_000, 1),
            timescale: 8_000,
            default_dur: 1_024,
            width: 0,
            height: 0,
        });
        let mut m =
            SegmentMuxer::new(std::io::BufWriter::new(f), test_video_spec(), audio).unwrap();
        // Two fragments of video, keyframe-aligned.
        m.append_video(b"keyframe-0", 0, true).unwrap();
        m.append_video(b"frame-1", 3_000, false).unwrap();
        m.append_video(b"frame-2", 6_000, false).unwrap();
        if with_audio {
            m.append_audio(b"aac-0", 0).unwrap();
            m.append_audio(b"aac-1", 1_024).unwrap();
        }
        m.flush_fragment().unwrap();
        m.append_video(b"keyframe-3", 9_000, true).unwrap();
        m.append_video(b"frame-4", 12_000, false).unwrap();
        let (w, _len) = m.finish().unwrap();
        w.into_inner().unwrap().sync_all().unwrap();
    }

    #[test]
    fn box_order_is_faststart() {
        db::testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("seg.mp4");
        write_test_segment(&p, false);
        let types = top_level_box_types(&p).unwrap();
        assert_eq!(&types[0], b"ftyp");
        let moov = types.iter().position(|t| t == b"moov").unwrap();
        let first_mdat = types.iter().position(|t| t == b"mdat").unwrap();
        assert!(moov < first_mdat);
        assert_eq!(
            types.iter().filter(|t| *t == b"mdat").count(),
            2,
            "one mdat per fragment"
        );
    }

    #[test]
    fn read_back_video_samples() {
        db::testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("seg.mp4");
        write_test_segment(&p, false);
        let info = read_segment(&p).unwrap();
        assert_eq!(info.video_timescale, 90_000);
        assert!(info.audio_sample_entry.is_none());
        let v: Vec<_> = info
            .samples
            .iter()
            .filter(|s| s.track == TrackKind::Video)
            .collect();
        assert_eq!(v.len(), 5);
        // First sample of each fragment is a random access point.
        assert!(v[0].is_sync);
        assert!(!v[1].is_sync);
        assert!(!v[2].is_sync);
        assert!(v[3].is_sync);
        assert!(!v[4].is_sync);
        // Sample payloads are addressable by (offset, size).
        let data = std::fs::read(&p).unwrap();
        let s = v[3];
        assert_eq!(
            &data[s.offset as usize..(s.offset + u64::from(s.size)) as usize],
            b"keyframe-3"
        );
        // Decode times: first sample carries the default duration, later ones
        // the preceding gap.
        assert_eq!(v[0].pts, 0);
        assert_eq!(v[1].pts, 3_000);
        assert_eq!(v[2].pts, 6_000);
        assert_eq!(v[3].pts, 9_000);
    }

    #[test]
    fn read_back_audio_samples() {
        db::testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("seg.mp4");
        write_test_segment(&p, true);
        let info = read_segment(&p).unwrap();
        assert_eq!(info.audio_timescale, 8_000);
        assert!(info.audio_sample_entry.is_some());
        let a: Vec<_> = info
            .samples
            .iter()
            .filter(|s| s.track == TrackKind::Audio)
            .collect();
        assert_eq!(a.len(), 2);
        let data = std::fs::read(&p).unwrap();
        let s = a[1];
        assert_eq!(
            &data[s.offset as usize..(s.offset + u64::from(s.size)) as usize],
            b"aac-1"
        );
    }

    #[test]
    fn non_monotonic_pts_rejected() {
        db::testutil::init();
        let mut m = SegmentMuxer::new(Vec::new(), test_video_spec(), None).unwrap();
        m.append_video(b"a", 3_000, true).unwrap();
        let e = m.append_video(b"b", 1_000, false).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
    }

    #[test]
    fn empty_segment_has_no_fragments() {
        db::testutil::init();
        let mut m = SegmentMuxer::new(Vec::new(), test_video_spec(), None).unwrap();
        m.flush_fragment().unwrap();
        let (buf, len) = m.finish().unwrap();
        assert_eq!(buf.len() as u64, len);
        let mut it = BoxIter::new(&buf);
        let mut types = Vec::new();
        while let Some((cc, _, _)) = it.next().unwrap() {
            types.push(cc);
        }
        assert_eq!(types, vec![*b"ftyp", *b"moov"]);
    }
}
