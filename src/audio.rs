// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Audio handling for segment files.
//!
//! MP4 carries AAC, MP3, AC-3, and Opus; those pass through with a suitable
//! sample entry. PCM variants (G.711 μ-law/A-law and linear formats) are
//! transcoded to AAC-LC at the source sample rate and 128 kbps. Anything else
//! disables audio for the session and recording proceeds video-only.
//!
//! Transcoder contexts are owned by a process-wide [`TranscoderRegistry`]
//! keyed by stream name so the encoder survives segment rotation; an AAC
//! encoder re-init on every rotate would cost a frame of priming each time.

use crate::mp4::write_box;
use base::{bail, Error};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

pub const AAC_DEFAULT_FRAME_SIZE: u32 = 1024;
pub const OPUS_DEFAULT_FRAME_SIZE: u32 = 960;
pub const AAC_BIT_RATE: u32 = 128_000;

/// A PCM sample format, as named by RTP encodings and camera descriptors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PcmFormat {
    MulawU8,
    AlawU8,
    S16Le,
    S16Be,
    S24Le,
    S32Le,
    F32Le,
}

impl PcmFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            PcmFormat::MulawU8 | PcmFormat::AlawU8 => 1,
            PcmFormat::S16Le | PcmFormat::S16Be => 2,
            PcmFormat::S24Le => 3,
            PcmFormat::S32Le | PcmFormat::F32Le => 4,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AudioCodec {
    Aac,
    Mp3,
    Ac3,
    Opus,
    Pcm(PcmFormat),
    Unsupported(String),
}

/// An audio stream descriptor from the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioParams {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,

    /// Samples per codec frame as reported by the descriptor; 0 if unknown.
    pub frame_size: u32,
}

impl AudioParams {
    /// Maps an RTP encoding name (lowercase, as in SDP `rtpmap`) to params.
    pub fn from_rtsp(encoding: &str, clock_rate: u32, channels: u16) -> Self {
        let codec = match encoding {
            "aac" | "mp4a-latm" | "mpeg4-generic" => AudioCodec::Aac,
            "mpa" | "mp3" => AudioCodec::Mp3,
            "ac3" => AudioCodec::Ac3,
            "opus" => AudioCodec::Opus,
            "pcmu" => AudioCodec::Pcm(PcmFormat::MulawU8),
            "pcma" => AudioCodec::Pcm(PcmFormat::AlawU8),
            "l16" => AudioCodec::Pcm(PcmFormat::S16Be),
            other => AudioCodec::Unsupported(other.to_owned()),
        };
        AudioParams {
            codec,
            sample_rate: clock_rate,
            // An unknown channel layout defaults to stereo.
            channels: if channels == 0 { 2 } else { channels },
            frame_size: 0,
        }
    }

    /// The frame size to declare to the muxer. Descriptors reporting zero get
    /// the codec's standard value to avoid "frame size not set" mux failures.
    pub fn effective_frame_size(&self) -> u32 {
        if self.frame_size != 0 {
            return self.frame_size;
        }
        match self.codec {
            AudioCodec::Opus => OPUS_DEFAULT_FRAME_SIZE,
            _ => AAC_DEFAULT_FRAME_SIZE,
        }
    }
}

// G.711 decode, ITU-T tables expressed as the usual bit fiddling.

fn mulaw_to_i16(b: u8) -> i16 {
    let u = !b;
    let sign = (u & 0x80) != 0;
    let exponent = i32::from((u >> 4) & 0x07);
    let mantissa = i32::from(u & 0x0f);
    let magnitude = (((mantissa << 3) + 0x84) << exponent) - 0x84;
    (if sign { -magnitude } else { magnitude }) as i16
}

fn alaw_to_i16(b: u8) -> i16 {
    let a = b ^ 0x55;
    let positive = (a & 0x80) != 0;
    let exponent = i32::from((a >> 4) & 0x07);
    let mantissa = i32::from(a & 0x0f);
    let magnitude = if exponent == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    };
    (if positive { magnitude } else { -magnitude }) as i16
}

/// Decodes interleaved PCM into planar f32, appending to `planes` (one `Vec`
/// per channel). Trailing partial sample groups are dropped.
pub fn decode_pcm(fmt: PcmFormat, channels: usize, data: &[u8], planes: &mut [Vec<f32>]) {
    assert_eq!(planes.len(), channels);
    let bps = fmt.bytes_per_sample();
    let group = bps * channels;
    let whole = data.len() / group * group;
    let mut ch = 0;
    for s in data[..whole].chunks_exact(bps) {
        let v = match fmt {
            PcmFormat::MulawU8 => f32::from(mulaw_to_i16(s[0])) / 32768.0,
            PcmFormat::AlawU8 => f32::from(alaw_to_i16(s[0])) / 32768.0,
            PcmFormat::S16Le => f32::from(i16::from_le_bytes([s[0], s[1]])) / 32768.0,
            PcmFormat::S16Be => f32::from(i16::from_be_bytes([s[0], s[1]])) / 32768.0,
            PcmFormat::S24Le => {
                let raw = i32::from(s[0]) | (i32::from(s[1]) << 8) | (i32::from(s[2] as i8) << 16);
                raw as f32 / 8_388_608.0
            }
            PcmFormat::S32Le => {
                i32::from_le_bytes([s[0], s[1], s[2], s[3]]) as f32 / 2_147_483_648.0
            }
            PcmFormat::F32Le => f32::from_le_bytes([s[0], s[1], s[2], s[3]]),
        };
        planes[ch].push(v);
        ch = (ch + 1) % channels;
    }
}

/// MPEG-4 sampling frequency index (ISO/IEC 14496-3 table 1.18).
fn sampling_frequency_index(rate: u32) -> Option<u8> {
    const RATES: [u32; 13] = [
        96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
        8_000, 7_350,
    ];
    RATES.iter().position(|&r| r == rate).map(|i| i as u8)
}

/// AudioSpecificConfig for AAC-LC.
pub fn audio_specific_config(rate: u32, channels: u16) -> Option<[u8; 2]> {
    let sfi = sampling_frequency_index(rate)?;
    let channels = u8::try_from(channels).ok()?;
    Some([
        (2 << 3) | (sfi >> 1),             // audioObjectType=2 (LC) + sfi high bits
        ((sfi & 1) << 7) | (channels << 3), // sfi low bit + channelConfiguration
    ])
}

fn audio_sample_entry_header(buf: &mut BytesMut, rate: u32, channels: u16) {
    buf.extend_from_slice(&[0; 6]); // reserved
    buf.put_u16(1); // data_reference_index
    buf.put_u64(0); // reserved
    buf.put_u16(channels);
    buf.put_u16(16); // samplesize
    buf.put_u32(0); // pre_defined + reserved
    buf.put_u32(rate << 16);
}

/// Writes one MPEG-4 descriptor with a single-byte length.
fn descriptor(buf: &mut BytesMut, tag: u8, body: &[u8]) {
    debug_assert!(body.len() < 128);
    buf.put_u8(tag);
    buf.put_u8(body.len() as u8);
    buf.extend_from_slice(body);
}

fn esds_sample_entry(rate: u32, channels: u16, object_type: u8, asc: Option<&[u8]>) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(128);
    write_box!(&mut buf, b"mp4a", {
        audio_sample_entry_header(&mut buf, rate, channels);
        write_box!(&mut buf, b"esds", {
            buf.put_u32(0); // version + flags

            let mut dcd = BytesMut::with_capacity(32);
            dcd.put_u8(object_type);
            dcd.put_u8(0x15); // streamType=audio, upStream=0, reserved=1
            dcd.extend_from_slice(&[0, 0, 0]); // bufferSizeDB
            dcd.put_u32(AAC_BIT_RATE); // maxBitrate
            dcd.put_u32(AAC_BIT_RATE); // avgBitrate
            if let Some(asc) = asc {
                descriptor(&mut dcd, 0x05, asc); // DecoderSpecificInfo
            }

            let mut es = BytesMut::with_capacity(64);
            es.put_u16(0); // ES_ID
            es.put_u8(0); // flags
            descriptor(&mut es, 0x04, &dcd); // DecoderConfigDescriptor
            descriptor(&mut es, 0x06, &[0x02]); // SLConfigDescriptor

            descriptor(&mut buf, 0x03, &es); // ES_Descriptor
        });
    });
    buf.to_vec()
}

/// A complete `mp4a` sample entry for AAC-LC.
pub fn aac_sample_entry(rate: u32, channels: u16) -> Vec<u8> {
    let asc = audio_specific_config(rate, channels);
    esds_sample_entry(rate, channels, 0x40, asc.as_ref().map(|a| &a[..]))
}

/// A complete `mp4a` sample entry for MPEG-1 layer 3.
pub fn mp3_sample_entry(rate: u32, channels: u16) -> Vec<u8> {
    esds_sample_entry(rate, channels, 0x6b, None)
}

/// A complete `ac-3` sample entry.
pub fn ac3_sample_entry(rate: u32, channels: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(64);
    write_box!(&mut buf, b"ac-3", {
        audio_sample_entry_header(&mut buf, rate, channels);
        write_box!(&mut buf, b"dac3", {
            let fscod: u32 = match rate {
                48_000 => 0,
                44_100 => 1,
                _ => 2,
            };
            let acmod: u32 = if channels >= 2 { 2 } else { 1 };
            let bit_rate_code: u32 = 8; // 128 kbps
            let bits = (fscod << 22) | (8 << 17) | (acmod << 11) | (bit_rate_code << 5);
            buf.put_u8((bits >> 16) as u8);
            buf.put_u8((bits >> 8) as u8);
            buf.put_u8(bits as u8);
        });
    });
    buf.to_vec()
}

/// A complete `Opus` sample entry.
pub fn opus_sample_entry(rate: u32, channels: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(64);
    write_box!(&mut buf, b"Opus", {
        audio_sample_entry_header(&mut buf, rate, channels);
        write_box!(&mut buf, b"dOps", {
            buf.put_u8(0); // Version
            buf.put_u8(channels.min(255) as u8);
            buf.put_u16(3840); // PreSkip, the codec's standard 80 ms at 48 kHz
            buf.put_u32(rate); // InputSampleRate
            buf.put_u16(0); // OutputGain
            buf.put_u8(0); // ChannelMappingFamily
        });
    });
    buf.to_vec()
}

/// The sample entry for a pass-through codec; `None` when the codec needs
/// transcoding (PCM) or cannot be carried (unsupported).
pub fn passthrough_sample_entry(params: &AudioParams) -> Option<Vec<u8>> {
    match &params.codec {
        AudioCodec::Aac => Some(aac_sample_entry(params.sample_rate, params.channels)),
        AudioCodec::Mp3 => Some(mp3_sample_entry(params.sample_rate, params.channels)),
        AudioCodec::Ac3 => Some(ac3_sample_entry(params.sample_rate, params.channels)),
        AudioCodec::Opus => Some(opus_sample_entry(params.sample_rate, params.channels)),
        AudioCodec::Pcm(_) | AudioCodec::Unsupported(_) => None,
    }
}

/// One encoded AAC access unit.
#[derive(Clone, Debug)]
pub struct AacFrame {
    pub data: Vec<u8>,

    /// PCM samples per channel this frame covers.
    pub samples: u32,
}

/// An AAC encoder accepting float-planar input one full frame at a time.
pub trait AacEncoder: Send {
    fn frame_samples(&self) -> usize;

    /// Encodes exactly `frame_samples()` samples per channel. May return zero
    /// frames while the encoder is priming and more than one later.
    fn encode(&mut self, planar: &[Vec<f32>]) -> Result<Vec<AacFrame>, Error>;
}

pub type EncoderFactory = fn(u32, u16) -> Result<Box<dyn AacEncoder>, Error>;

#[cfg(feature = "aac")]
mod ffmpeg_impl {
    use super::{AacEncoder, AacFrame, AAC_BIT_RATE};
    use base::{err, Error, ErrorKind, ResultExt as _};
    use ffmpeg_next as ffmpeg;

    pub(super) struct FfmpegAacEncoder {
        enc: ffmpeg::encoder::Audio,
        frame_samples: usize,
        next_pts: i64,
    }

    pub(super) fn new_encoder(rate: u32, channels: u16) -> Result<Box<dyn AacEncoder>, Error> {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            let _ = ffmpeg::init();
        });
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::AAC)
            .ok_or_else(|| err!(Unimplemented, msg("FFmpeg build lacks an AAC encoder")))?;
        let ctx = ffmpeg::codec::context::Context::new_with_codec(codec);
        let mut enc = ctx.encoder().audio().err_kind(ErrorKind::Internal)?;
        enc.set_rate(rate as i32);
        enc.set_format(ffmpeg::format::Sample::F32(
            ffmpeg::format::sample::Type::Planar,
        ));
        enc.set_channel_layout(ffmpeg::channel_layout::ChannelLayout::default(i32::from(
            channels,
        )));
        enc.set_bit_rate(AAC_BIT_RATE as usize);
        enc.set_time_base(ffmpeg::Rational(1, rate as i32));
        let enc = enc.open_as(codec).err_kind(ErrorKind::Internal)?;
        let frame_samples = match enc.frame_size() {
            0 => super::AAC_DEFAULT_FRAME_SIZE as usize,
            n => n as usize,
        };
        Ok(Box::new(FfmpegAacEncoder {
            enc,
            frame_samples,
            next_pts: 0,
        }))
    }

    impl AacEncoder for FfmpegAacEncoder {
        fn frame_samples(&self) -> usize {
            self.frame_samples
        }

        fn encode(&mut self, planar: &[Vec<f32>]) -> Result<Vec<AacFrame>, Error> {
            let mut frame = ffmpeg::frame::Audio::new(
                self.enc.format(),
                self.frame_samples,
                self.enc.channel_layout(),
            );
            for (ch, plane) in planar.iter().enumerate() {
                let n = plane.len().min(self.frame_samples);
                frame.plane_mut::<f32>(ch)[..n].copy_from_slice(&plane[..n]);
            }
            frame.set_pts(Some(self.next_pts));
            self.next_pts += self.frame_samples as i64;
            self.enc.send_frame(&frame).err_kind(ErrorKind::Internal)?;
            let mut out = Vec::new();
            let mut pkt = ffmpeg::Packet::empty();
            while self.enc.receive_packet(&mut pkt).is_ok() {
                out.push(AacFrame {
                    data: pkt.data().unwrap_or_default().to_vec(),
                    samples: self.frame_samples as u32,
                });
            }
            Ok(out)
        }
    }
}

/// Creates the default AAC encoder for the given rate and channel count.
pub fn new_aac_encoder(rate: u32, channels: u16) -> Result<Box<dyn AacEncoder>, Error> {
    #[cfg(feature = "aac")]
    {
        ffmpeg_impl::new_encoder(rate, channels)
    }
    #[cfg(not(feature = "aac"))]
    {
        let _ = (rate, channels);
        bail!(Unimplemented, msg("built without the aac feature"));
    }
}

/// Converts a PCM packet stream to AAC frames.
pub struct Transcoder {
    fmt: PcmFormat,
    channels: usize,
    sample_rate: u32,
    enc: Box<dyn AacEncoder>,
    pending: Vec<Vec<f32>>,
}

impl std::fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcoder")
            .field("fmt", &self.fmt)
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("pending", &self.pending)
            .finish()
    }
}

impl Transcoder {
    pub fn new(
        fmt: PcmFormat,
        sample_rate: u32,
        channels: u16,
        enc: Box<dyn AacEncoder>,
    ) -> Self {
        let channels = usize::from(channels.max(1));
        Transcoder {
            fmt,
            channels,
            sample_rate,
            enc,
            pending: vec![Vec::new(); channels],
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels as u16
    }

    /// Feeds one interleaved PCM packet, returning any completed AAC frames.
    /// Partial encoder frames stay buffered across calls (and segment
    /// rotations).
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<AacFrame>, Error> {
        decode_pcm(self.fmt, self.channels, data, &mut self.pending);
        let frame_samples = self.enc.frame_samples();
        let mut out = Vec::new();
        while self.pending[0].len() >= frame_samples {
            let mut planar = Vec::with_capacity(self.channels);
            for p in &mut self.pending {
                let rest = p.split_off(frame_samples);
                planar.push(std::mem::replace(p, rest));
            }
            out.extend(self.enc.encode(&planar)?);
        }
        Ok(out)
    }
}

/// Process-wide map of stream name to its audio transcoder.
///
/// Insert/remove take the write lock; per-packet use goes through the cloned
/// `Arc`, so encode calls on an already-registered stream never contend on
/// this map.
pub struct TranscoderRegistry {
    inner: RwLock<HashMap<String, Arc<base::Mutex<Transcoder>>>>,
    factory: EncoderFactory,
}

impl TranscoderRegistry {
    pub fn new(factory: EncoderFactory) -> Self {
        TranscoderRegistry {
            inner: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// The transcoder for `stream`, creating one on first use. Fails if the
    /// encoder cannot be initialized; the caller is expected to disable audio
    /// for the session.
    pub fn get_or_create(
        &self,
        stream: &str,
        fmt: PcmFormat,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Arc<base::Mutex<Transcoder>>, Error> {
        if let Some(t) = self.inner.read().expect("registry lock").get(stream) {
            return Ok(t.clone());
        }
        let enc = (self.factory)(sample_rate, channels)?;
        info!(
            stream,
            sample_rate, channels, "created audio transcoder ({fmt:?} -> aac)"
        );
        let t = Arc::new(base::Mutex::new(Transcoder::new(
            fmt,
            sample_rate,
            channels,
            enc,
        )));
        let mut l = self.inner.write().expect("registry lock");
        Ok(l.entry(stream.to_owned()).or_insert(t).clone())
    }

    /// Drops the transcoder for `stream`, if any. Called when a worker stops
    /// for good, not on segment rotation.
    pub fn remove(&self, stream: &str) {
        self.inner.write().expect("registry lock").remove(stream);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn g711_known_values() {
        // μ-law: 0xff is positive zero, 0x7f negative zero, 0x00 the negative
        // maximum.
        assert_eq!(mulaw_to_i16(0xff), 0);
        assert_eq!(mulaw_to_i16(0x7f), 0);
        assert_eq!(mulaw_to_i16(0x00), -32_124);
        assert_eq!(mulaw_to_i16(0x80), 32_124);
        // A-law: 0x55 is -8, 0xd5 is +8.
        assert_eq!(alaw_to_i16(0x55), -8);
        assert_eq!(alaw_to_i16(0xd5), 8);
        assert_eq!(alaw_to_i16(0x2a), -32_256); // negative maximum
    }

    #[test]
    fn decode_pcm_deinterleaves() {
        let mut planes = vec![Vec::new(), Vec::new()];
        // Two stereo sample groups of s16le, plus a trailing partial byte.
        let data = [0x00, 0x40, 0x00, 0xc0, 0x00, 0x20, 0x00, 0xe0, 0x7f];
        decode_pcm(PcmFormat::S16Le, 2, &data, &mut planes);
        assert_eq!(planes[0], vec![0.5, 0.25]);
        assert_eq!(planes[1], vec![-0.5, -0.25]);
    }

    #[test]
    fn asc_for_8khz_mono() {
        assert_eq!(audio_specific_config(8_000, 1), Some([0x15, 0x88]));
        assert_eq!(audio_specific_config(44_100, 2), Some([0x12, 0x10]));
        assert_eq!(audio_specific_config(5_512, 1), None);
    }

    #[test]
    fn aac_sample_entry_structure() {
        let e = aac_sample_entry(8_000, 1);
        assert_eq!(&e[4..8], b"mp4a");
        assert!(e.windows(4).any(|w| w == b"esds"));
        // The ASC bytes appear within the esds.
        assert!(e.windows(2).any(|w| w == [0x15, 0x88]));
    }

    #[test]
    fn params_from_rtsp_mapping() {
        let p = AudioParams::from_rtsp("pcmu", 8_000, 1);
        assert_eq!(p.codec, AudioCodec::Pcm(PcmFormat::MulawU8));
        assert_eq!(p.sample_rate, 8_000);
        assert_eq!(p.channels, 1);
        assert_eq!(p.effective_frame_size(), AAC_DEFAULT_FRAME_SIZE);

        let p = AudioParams::from_rtsp("opus", 48_000, 0);
        assert_eq!(p.codec, AudioCodec::Opus);
        assert_eq!(p.channels, 2, "unknown channel layout defaults to stereo");
        assert_eq!(p.effective_frame_size(), OPUS_DEFAULT_FRAME_SIZE);

        let p = AudioParams::from_rtsp("weird-codec", 8_000, 1);
        assert!(matches!(p.codec, AudioCodec::Unsupported(_)));
        assert!(passthrough_sample_entry(&p).is_none());
    }

    #[test]
    fn transcoder_chunks_into_encoder_frames() {
        let t = &mut Transcoder::new(
            PcmFormat::MulawU8,
            8_000,
            1,
            Box::new(testutil::MockAacEncoder { calls: 0 }),
        );
        // 1000 samples: not yet a full frame.
        assert!(t.push(&[0xffu8; 1000]).unwrap().is_empty());
        // 1100 more: exactly one frame out, 1076 samples pending.
        let frames = t.push(&[0xffu8; 1100]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples, 1024);
        // 3020 more: (1076 + 3020) / 1024 = 4 frames.
        let frames = t.push(&[0xffu8; 3020]).unwrap();
        assert_eq!(frames.len(), 4);
    }

    #[test]
    fn registry_reuses_and_removes() {
        let r = TranscoderRegistry::new(testutil::mock_factory);
        let a = r
            .get_or_create("front", PcmFormat::MulawU8, 8_000, 1)
            .unwrap();
        let b = r
            .get_or_create("front", PcmFormat::MulawU8, 8_000, 1)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b), "rotation must not re-create encoders");
        r.remove("front");
        let c = r
            .get_or_create("front", PcmFormat::MulawU8, 8_000, 1)
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn registry_propagates_encoder_failure() {
        let r = TranscoderRegistry::new(testutil::failing_factory);
        r.get_or_create("front", PcmFormat::AlawU8, 8_000, 1)
            .unwrap_err();
    }
}
