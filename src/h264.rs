// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! H.264 byte stream handling.
//!
//! For the most part, Nightjar does not try to understand the video codec.
//! However, H.264 has two byte stream encodings: ISO/IEC 14496-10 Annex B,
//! and ISO/IEC 14496-15 AVC access units (4-byte length prefixes). Sources
//! deliver either; the ingest pipeline normalizes packets to Annex B, and the
//! muxer requires AVC form for `.mp4` samples plus an
//! `AVCDecoderConfigurationRecord` for the `avcC` box. This file manages the
//! conversions in both directions.

use base::{bail, err, Error};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use h264_reader::nal::{NalHeader, UnitType};

const ANNEX_B_START: &[u8] = b"\x00\x00\x00\x01";

// For certain common sub stream anamorphic resolutions, add a pixel aspect
// ratio box. The Dahua IPC-HDW5231R-Z sets the aspect ratio in the H.264 SPS
// (correctly) for both square and non-square pixels. The Hikvision
// DS-2CD2032-I doesn't set it, even though the sub stream's pixels aren't
// square. So define a default based on the pixel dimensions.
const PIXEL_ASPECT_RATIOS: [((u32, u32), (u16, u16)); 4] = [
    ((320, 240), (4, 3)),
    ((352, 240), (40, 33)),
    ((640, 480), (4, 3)),
    ((704, 480), (40, 33)),
];

fn default_pixel_aspect_ratio(width: u32, height: u32) -> (u16, u16) {
    let dims = (width, height);
    for r in &PIXEL_ASPECT_RATIOS {
        if r.0 == dims {
            return r.1;
        }
    }
    (1, 1)
}

/// Decodes a H.264 Annex B byte stream into NAL units, calling `f` for each.
///
/// Note `f` is called with the encoded NAL form, not the RBSP. The NAL header
/// byte and any emulation prevention bytes will be present.
///
/// See ISO/IEC 14496-10 section B.2: Byte stream NAL unit decoding process.
/// This is a relatively simple, unoptimized implementation.
fn decode_annex_b<'a, F>(mut data: &'a [u8], mut f: F) -> Result<(), Error>
where
    F: FnMut(&'a [u8]) -> Result<(), Error>,
{
    let start_code = &b"\x00\x00\x01"[..];
    'outer: while let Some(pos) = find_subslice(data, start_code) {
        let mut unit = &data[0..pos];
        data = &data[pos + start_code.len()..];
        // Have zero or more bytes that end in a start code. Strip out any
        // trailing 0x00s and process the unit if there's anything left.
        loop {
            match unit.last() {
                None => continue 'outer,
                Some(b) if *b == 0 => {
                    unit = &unit[..unit.len() - 1];
                }
                Some(_) => break,
            }
        }
        f(unit)?;
    }

    // No remaining start codes; likely a unit left.
    if !data.is_empty() {
        f(data)?;
    }
    Ok(())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn unit_type(unit: &[u8]) -> Option<UnitType> {
    let first = *unit.first()?;
    NalHeader::new(first).ok().map(|h| h.nal_unit_type())
}

/// True iff `data` begins with an Annex B start code.
pub fn is_annex_b(data: &[u8]) -> bool {
    data.starts_with(b"\x00\x00\x00\x01") || data.starts_with(b"\x00\x00\x01")
}

/// Normalizes one video packet to Annex B form.
///
/// A packet already beginning with a start code passes through untouched and
/// this returns `false`. Otherwise the packet is assumed to carry 4-byte
/// length-prefixed AVC units; each is rewritten into `out` with a start code,
/// dropping in-band SPS/PPS units (parameter sets travel in the stream
/// descriptor, not the samples), and this returns `true`.
pub fn ensure_annex_b(data: &[u8], out: &mut Vec<u8>) -> Result<bool, Error> {
    if is_annex_b(data) {
        return Ok(false);
    }
    out.clear();
    out.reserve(data.len() + 4);
    let mut rest = data;
    while !rest.is_empty() {
        if rest.len() < 4 {
            bail!(InvalidArgument, msg("truncated AVC length prefix"));
        }
        let len = BigEndian::read_u32(&rest[0..4]) as usize;
        rest = &rest[4..];
        if len == 0 || len > rest.len() {
            bail!(
                InvalidArgument,
                msg("AVC unit length {len} exceeds remaining {}", rest.len())
            );
        }
        let unit = &rest[..len];
        rest = &rest[len..];
        match unit_type(unit) {
            Some(UnitType::SeqParameterSet) | Some(UnitType::PicParameterSet) => continue,
            _ => {}
        }
        out.extend_from_slice(ANNEX_B_START);
        out.extend_from_slice(unit);
    }
    Ok(true)
}

/// Transforms sample data from Annex B format to AVC format for muxing. Uses
/// an out parameter rather than a return so that memory allocations can be
/// reused from sample to sample.
pub fn transform_sample_data(annexb_sample: &[u8], avc_sample: &mut Vec<u8>) -> Result<(), Error> {
    // See AVCParameterSamples, ISO/IEC 14496-15 section 5.3.2.
    avc_sample.clear();

    // The output will be about as long as the input. Annex B start codes
    // require at least three bytes; many are four. The output lengths are
    // exactly four.
    avc_sample.reserve(annexb_sample.len() + 4);
    decode_annex_b(annexb_sample, |unit| {
        // 4-byte length; must match ExtraData's lengthSizeMinusOne == 3.
        avc_sample.write_u32::<BigEndian>(unit.len() as u32)?;
        avc_sample.extend_from_slice(unit);
        Ok(())
    })?;
    Ok(())
}

/// Parses Annex B extra data, returning `(sps, pps)`.
fn parse_annex_b_extra_data(data: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    let mut sps = None;
    let mut pps = None;
    decode_annex_b(data, |unit| {
        match unit_type(unit) {
            Some(UnitType::SeqParameterSet) => sps = Some(unit),
            Some(UnitType::PicParameterSet) => pps = Some(unit),
            t => bail!(InvalidArgument, msg("expected SPS and PPS; got {t:?}")),
        };
        Ok(())
    })?;
    match (sps, pps) {
        (Some(s), Some(p)) => Ok((s, p)),
        _ => bail!(InvalidArgument, msg("SPS and PPS must both be specified")),
    }
}

/// Parsed representation of a source's video stream descriptor, as needed by
/// the muxer: a complete `avc1` VisualSampleEntry box plus labeling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtraData {
    /// A full `avc1` box, as placed within `stsd`.
    pub sample_entry: Vec<u8>,

    pub rfc6381_codec: String,
    pub width: u32,
    pub height: u32,
}

impl ExtraData {
    /// Parses stream descriptor "extradata", in either Annex B form (raw
    /// SPS+PPS) or as an `AVCDecoderConfigurationRecord`, and builds the
    /// `avc1` sample entry.
    ///
    /// Zero `width`/`height` (cameras sometimes omit them before the first
    /// IDR) are replaced with 640×480 so muxing can proceed.
    pub fn parse(extradata: &[u8], width: u32, height: u32) -> Result<ExtraData, Error> {
        let (width, height) = if width == 0 || height == 0 {
            tracing::debug!("substituting 640x480 for missing video dimensions");
            (640, 480)
        } else {
            (width, height)
        };

        let mut sample_entry = Vec::with_capacity(256);

        // This is a concatenation of the following boxes/classes.

        // SampleEntry, ISO/IEC 14496-12 section 8.5.2.
        let avc1_len_pos = sample_entry.len();
        // length placeholder + type + reserved + data_reference_index = 1
        sample_entry.extend_from_slice(b"\x00\x00\x00\x00avc1\x00\x00\x00\x00\x00\x00\x00\x01");

        // VisualSampleEntry, ISO/IEC 14496-12 section 12.1.3.
        sample_entry.extend_from_slice(&[0; 16]); // pre-defined + reserved
        sample_entry.write_u16::<BigEndian>(u16::try_from(width).map_err(|_| {
            err!(InvalidArgument, msg("width {width} out of range"))
        })?)?;
        sample_entry.write_u16::<BigEndian>(u16::try_from(height).map_err(|_| {
            err!(InvalidArgument, msg("height {height} out of range"))
        })?)?;
        sample_entry.extend_from_slice(&[
            0x00, 0x48, 0x00, 0x00, // horizresolution
            0x00, 0x48, 0x00, 0x00, // vertresolution
            0x00, 0x00, 0x00, 0x00, // reserved
            0x00, 0x01, // frame count
            0x00, 0x00, 0x00, 0x00, // compressorname
            0x00, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
            0x00, 0x18, 0xff, 0xff, // depth + pre_defined
        ]);

        // AVCConfigurationBox, ISO/IEC 14496-15 section 5.3.4.1.
        let avcc_len_pos = sample_entry.len();
        sample_entry.extend_from_slice(b"\x00\x00\x00\x00avcC");

        if is_annex_b(extradata) {
            let (sps, pps) = parse_annex_b_extra_data(extradata)?;

            // Create the AVCDecoderConfiguration, ISO/IEC 14496-15 section
            // 5.2.4.1. The beginning of the AVCDecoderConfiguration takes a
            // few values from the SPS (ISO/IEC 14496-10 section 7.3.2.1.1).
            // One caveat: that section defines the syntax in terms of RBSP,
            // not NAL, but 00 is not a valid value of profile_idc, so the
            // escaping of 00 00 01/02 cannot land in these bytes.
            if sps.len() < 4 {
                bail!(InvalidArgument, msg("SPS too short: {} bytes", sps.len()));
            }
            sample_entry.push(1); // configurationVersion
            sample_entry.push(sps[1]); // profile_idc -> AVCProfileIndication
            sample_entry.push(sps[2]); // ...misc bits... -> profile_compatibility
            sample_entry.push(sps[3]); // level_idc -> AVCLevelIndication

            // Hardcode lengthSizeMinusOne to 3, matching
            // transform_sample_data's 4-byte lengths.
            sample_entry.push(0xff);

            // Only support one SPS and PPS. This next byte is a reserved
            // 0b111 + a 5-bit # of SPSs (1).
            sample_entry.push(0xe1);
            sample_entry.write_u16::<BigEndian>(u16::try_from(sps.len()).map_err(|_| {
                err!(InvalidArgument, msg("SPS too long"))
            })?)?;
            sample_entry.extend_from_slice(sps);
            sample_entry.push(1); // # of PPSs.
            sample_entry.write_u16::<BigEndian>(u16::try_from(pps.len()).map_err(|_| {
                err!(InvalidArgument, msg("PPS too long"))
            })?)?;
            sample_entry.extend_from_slice(pps);
        } else {
            // Assume extradata already holds an AVCDecoderConfiguration.
            if extradata.len() < 6 || extradata[0] != 1 {
                bail!(
                    InvalidArgument,
                    msg("bad AVCDecoderConfigurationRecord of {} bytes", extradata.len())
                );
            }
            sample_entry.extend_from_slice(extradata);
        };

        // Fix up avcC box length.
        let cur_pos = sample_entry.len();
        BigEndian::write_u32(
            &mut sample_entry[avcc_len_pos..avcc_len_pos + 4],
            u32::try_from(cur_pos - avcc_len_pos)
                .map_err(|_| err!(OutOfRange, msg("avcC overflow")))?,
        );

        // PixelAspectRatioBox, ISO/IEC 14496-12 section 12.1.4.2, for
        // anamorphic sub streams.
        let pasp = default_pixel_aspect_ratio(width, height);
        if pasp != (1, 1) {
            sample_entry.extend_from_slice(b"\x00\x00\x00\x10pasp"); // length + box name
            sample_entry.write_u32::<BigEndian>(pasp.0.into())?;
            sample_entry.write_u32::<BigEndian>(pasp.1.into())?;
        }

        // Fix up avc1 box length.
        let cur_pos = sample_entry.len();
        BigEndian::write_u32(
            &mut sample_entry[avc1_len_pos..avc1_len_pos + 4],
            u32::try_from(cur_pos - avc1_len_pos)
                .map_err(|_| err!(OutOfRange, msg("avc1 overflow")))?,
        );

        let profile_idc = sample_entry[avcc_len_pos + 9];
        let constraint_flags = sample_entry[avcc_len_pos + 10];
        let level_idc = sample_entry[avcc_len_pos + 11];
        let rfc6381_codec = format!("avc1.{profile_idc:02x}{constraint_flags:02x}{level_idc:02x}");
        Ok(ExtraData {
            sample_entry,
            rfc6381_codec,
            width,
            height,
        })
    }
}

#[cfg(test)]
mod tests {
    use db::testutil;

    #[rustfmt::skip]
    const ANNEX_B_TEST_INPUT: [u8; 35] = [
        0x00, 0x00, 0x00, 0x01, 0x67, 0x4d, 0x00, 0x1f,
        0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01,
        0x01, 0x01, 0x40, 0x00, 0x00, 0xfa, 0x00, 0x00,
        0x1d, 0x4c, 0x01, 0x00, 0x00, 0x00, 0x01, 0x68,
        0xee, 0x3c, 0x80,
    ];

    #[rustfmt::skip]
    const AVC_DECODER_CONFIG_TEST_INPUT: [u8; 38] = [
        0x01, 0x4d, 0x00, 0x1f, 0xff, 0xe1, 0x00, 0x17,
        0x67, 0x4d, 0x00, 0x1f, 0x9a, 0x66, 0x02, 0x80,
        0x2d, 0xff, 0x35, 0x01, 0x01, 0x01, 0x40, 0x00,
        0x00, 0xfa, 0x00, 0x00, 0x1d, 0x4c, 0x01, 0x01,
        0x00, 0x04, 0x68, 0xee, 0x3c, 0x80,
    ];

    #[test]
    fn decode_annex_b_splits_units() {
        testutil::init();
        let data = &ANNEX_B_TEST_INPUT;
        let mut pieces = Vec::new();
        super::decode_annex_b(data, |p| {
            pieces.push(p);
            Ok(())
        })
        .unwrap();
        assert_eq!(&pieces, &[&data[4..27], &data[31..]]);
    }

    #[test]
    fn sample_entry_from_avc_decoder_config() {
        testutil::init();
        let e = super::ExtraData::parse(&AVC_DECODER_CONFIG_TEST_INPUT, 1280, 720).unwrap();
        assert_eq!(e.width, 1280);
        assert_eq!(e.height, 720);
        assert_eq!(e.rfc6381_codec, "avc1.4d001f");
        assert!(e.sample_entry.starts_with(&[0, 0, 0]));
        assert_eq!(&e.sample_entry[4..8], b"avc1");
        // The embedded record is carried verbatim.
        let pos = e
            .sample_entry
            .windows(4)
            .position(|w| w == b"avcC")
            .unwrap();
        assert_eq!(
            &e.sample_entry[pos + 4..pos + 4 + AVC_DECODER_CONFIG_TEST_INPUT.len()],
            &AVC_DECODER_CONFIG_TEST_INPUT[..]
        );
    }

    #[test]
    fn sample_entry_from_annex_b() {
        testutil::init();
        let e = super::ExtraData::parse(&ANNEX_B_TEST_INPUT, 1280, 720).unwrap();
        assert_eq!(e.width, 1280);
        assert_eq!(e.height, 720);
        assert_eq!(e.rfc6381_codec, "avc1.4d001f");
    }

    #[test]
    fn zero_dimensions_substituted() {
        testutil::init();
        let e = super::ExtraData::parse(&AVC_DECODER_CONFIG_TEST_INPUT, 0, 0).unwrap();
        assert_eq!(e.width, 640);
        assert_eq!(e.height, 480);
        // 640x480 is a known anamorphic resolution: expect a pasp box.
        assert!(e.sample_entry.windows(4).any(|w| w == b"pasp"));
    }

    #[test]
    fn ensure_annex_b_passthrough() {
        testutil::init();
        let mut out = Vec::new();
        let transformed = super::ensure_annex_b(&ANNEX_B_TEST_INPUT, &mut out).unwrap();
        assert!(!transformed);
        assert!(out.is_empty());
    }

    #[test]
    fn ensure_annex_b_rewraps_and_strips_parameter_sets() {
        testutil::init();
        #[rustfmt::skip]
        const AVC_INPUT: [u8; 31] = [
            // SPS (stripped).
            0x00, 0x00, 0x00, 0x04, 0x67, 0x4d, 0x00, 0x1f,
            // PPS (stripped).
            0x00, 0x00, 0x00, 0x04, 0x68, 0xee, 0x3c, 0x80,
            // IDR slice (kept).
            0x00, 0x00, 0x00, 0x0b, 0x65, 0x88, 0x80, 0x10,
            0x00, 0x08, 0x7f, 0x00, 0x5d, 0x27, 0xb5,
        ];
        let mut out = Vec::new();
        let transformed = super::ensure_annex_b(&AVC_INPUT, &mut out).unwrap();
        assert!(transformed);
        #[rustfmt::skip]
        const EXPECTED: [u8; 15] = [
            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x80, 0x10,
            0x00, 0x08, 0x7f, 0x00, 0x5d, 0x27, 0xb5,
        ];
        assert_eq!(&out[..], &EXPECTED[..]);
    }

    #[test]
    fn ensure_annex_b_rejects_truncation() {
        testutil::init();
        let mut out = Vec::new();
        super::ensure_annex_b(&[0x00, 0x00, 0x00, 0x09, 0x65, 0x00], &mut out).unwrap_err();
        super::ensure_annex_b(&[0x00, 0x00], &mut out).unwrap_err();
    }

    #[test]
    fn transform_sample_data() {
        testutil::init();
        #[rustfmt::skip]
        const INPUT: [u8; 64] = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x4d, 0x00, 0x1f,
            0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01,
            0x01, 0x01, 0x40, 0x00, 0x00, 0xfa, 0x00, 0x00,
            0x1d, 0x4c, 0x01,

            0x00, 0x00, 0x00, 0x01, 0x68, 0xee, 0x3c, 0x80,

            0x00, 0x00, 0x00, 0x01, 0x06, 0x06, 0x01, 0xc4,
            0x80,

            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x80, 0x10,
            0x00, 0x08, 0x7f, 0x00, 0x5d, 0x27, 0xb5, 0xc1,
            0xff, 0x8c, 0xd6, 0x35,
            // (truncated)
        ];
        #[rustfmt::skip]
        const EXPECTED_OUTPUT: [u8; 64] = [
            0x00, 0x00, 0x00, 0x17, 0x67, 0x4d, 0x00, 0x1f,
            0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01,
            0x01, 0x01, 0x40, 0x00, 0x00, 0xfa, 0x00, 0x00,
            0x1d, 0x4c, 0x01,

            0x00, 0x00, 0x00, 0x04, 0x68, 0xee, 0x3c, 0x80,

            0x00, 0x00, 0x00, 0x05, 0x06, 0x06, 0x01, 0xc4,
            0x80,

            0x00, 0x00, 0x00, 0x10, 0x65, 0x88, 0x80, 0x10,
            0x00, 0x08, 0x7f, 0x00, 0x5d, 0x27, 0xb5, 0xc1,
            0xff, 0x8c, 0xd6, 0x35,
        ];
        let mut out = Vec::new();
        super::transform_sample_data(&INPUT, &mut out).unwrap();
        assert_eq!(&out[..], &EXPECTED_OUTPUT[..]);
    }
}
