// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! RTSP sources.
//!
//! Built on the Retina library, which is asynchronous and tokio-based where
//! the stream workers expect a synchronous interface. Each call blocks on the
//! shared runtime via `handle.block_on(handle.spawn(...))`; the per-frame
//! hand-off is cheap relative to camera frame intervals.

use crate::audio::AudioParams;
use crate::h264;
use base::{bail, err, Error};
use bytes::Bytes;
use futures::StreamExt as _;
use retina::client::Demuxed;
use retina::codec::CodecItem;
use std::pin::Pin;
use tracing::{debug, warn};
use url::Url;

/// Deadline for DESCRIBE/SETUP/PLAY through the first video frame.
pub static CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Per-packet watchdog; exceeding it surfaces `DeadlineExceeded` and the
/// worker reconnects.
pub static PACKET_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct Options {
    pub session: retina::client::SessionOptions,
    pub transport: retina::client::Transport,
}

pub struct VideoFrame {
    /// Presentation timestamp in 90 kHz units since session start.
    pub pts: i64,

    pub is_key: bool,
    pub data: Bytes,

    /// True when the source delivered changed video parameters with this
    /// frame; the worker should rotate so the new segment gets a fresh
    /// sample entry.
    pub new_parameters: bool,
}

pub struct AudioFrame {
    /// Presentation timestamp in the audio clock's units (the sample rate).
    pub pts: i64,

    pub data: Bytes,
}

pub enum Frame {
    Video(VideoFrame),
    Audio(AudioFrame),
}

/// Opens a RTSP stream. This is a trait for test injection.
pub trait Opener: Send + Sync {
    /// Opens the given RTSP URL, blocking until the first video keyframe.
    ///
    /// Note: despite the blocking interface, this expects to be called from
    /// a thread with a multithreaded tokio runtime handle entered.
    fn open(&self, label: String, url: Url, options: Options) -> Result<Box<dyn Stream>, Error>;
}

pub trait Stream: Send {
    fn video_params(&self) -> &h264::ExtraData;

    /// Audio descriptor, once known. Populated at open when the source sent
    /// audio before its first video keyframe, otherwise when the first audio
    /// frame arrives; segments opened later carry the track.
    fn audio_params(&self) -> Option<&AudioParams>;

    /// Blocks until the next frame, the packet watchdog, or stream end.
    fn next(&mut self) -> Result<Frame, Error>;
}

pub struct RealOpener;

pub const OPENER: RealOpener = RealOpener;

impl Opener for RealOpener {
    fn open(&self, label: String, url: Url, options: Options) -> Result<Box<dyn Stream>, Error> {
        let options = Options {
            session: options
                .session
                .user_agent(format!("Nightjar NVR {}", env!("CARGO_PKG_VERSION"))),
            transport: options.transport,
        };
        let rt_handle = tokio::runtime::Handle::current();
        let (inner, first_frame) = rt_handle
            .block_on(rt_handle.spawn(tokio::time::timeout(
                CONNECT_TIMEOUT,
                RetinaStreamInner::play(label, url, options),
            )))
            .expect("RetinaStream::play task panicked, see earlier error")
            .map_err(|e| {
                err!(
                    DeadlineExceeded,
                    msg("unable to play stream and get first frame within {CONNECT_TIMEOUT:?}"),
                    source(e),
                )
            })??;
        Ok(Box::new(RetinaStream {
            inner: Some(inner),
            rt_handle,
            first_frame: Some(first_frame),
        }))
    }
}

struct RetinaStream {
    /// The actual stream details used from within the tokio reactor.
    ///
    /// Spawned tokio tasks must be `'static`, so ownership is passed to the
    /// task, and then returned when it completes.
    inner: Option<Box<RetinaStreamInner>>,

    rt_handle: tokio::runtime::Handle,

    /// The first video frame, if not yet returned from `next`. Fetched as
    /// part of getting the video parameters.
    first_frame: Option<retina::codec::VideoFrame>,
}

struct RetinaStreamInner {
    label: String,
    session: Demuxed,
    video_stream_i: usize,
    video_params: h264::ExtraData,

    /// `(stream index, lowercased encoding name)` of the chosen audio
    /// stream, if any.
    audio_stream: Option<(usize, String)>,
    audio_params: Option<AudioParams>,
}

fn params_to_extra_data(params: &retina::codec::VideoParameters) -> Result<h264::ExtraData, Error> {
    let (width, height) = params.pixel_dimensions();
    h264::ExtraData::parse(params.extra_data(), width, height)
}

/// Audio encodings that can be carried or transcoded; see `crate::audio`.
fn audio_encoding_usable(encoding: &str) -> bool {
    matches!(
        encoding,
        "aac" | "mpeg4-generic" | "mp4a-latm" | "mpa" | "mp3" | "ac3" | "opus" | "pcmu" | "pcma"
            | "l16"
    )
}

fn default_channels(encoding: &str) -> u16 {
    match encoding {
        // G.711 over RTP is mono (RFC 3551).
        "pcmu" | "pcma" => 1,
        _ => 0,
    }
}

impl RetinaStreamInner {
    /// Plays to the first video keyframe. No timeout; that's the caller's
    /// responsibility.
    async fn play(
        label: String,
        url: Url,
        options: Options,
    ) -> Result<(Box<Self>, retina::codec::VideoFrame), Error> {
        let mut session = retina::client::Session::describe(url, options.session)
            .await
            .map_err(|e| err!(Unknown, source(e)))?;
        debug!("connected to {:?}, tool {:?}", &label, session.tool());
        let video_stream_i = session
            .streams()
            .iter()
            .position(|s| s.media() == "video" && s.encoding_name() == "h264")
            .ok_or_else(|| {
                err!(
                    FailedPrecondition,
                    msg("couldn't find supported video stream")
                )
            })?;
        let audio_stream = session.streams().iter().enumerate().find_map(|(i, s)| {
            let encoding = s.encoding_name().to_ascii_lowercase();
            (s.media() == "audio" && audio_encoding_usable(&encoding)).then_some((i, encoding))
        });
        session
            .setup(
                video_stream_i,
                retina::client::SetupOptions::default().transport(options.transport.clone()),
            )
            .await
            .map_err(|e| err!(Unknown, source(e)))?;
        if let Some((i, _)) = audio_stream {
            session
                .setup(
                    i,
                    retina::client::SetupOptions::default().transport(options.transport.clone()),
                )
                .await
                .map_err(|e| err!(Unknown, source(e)))?;
        }
        let session = session
            .play(retina::client::PlayOptions::default())
            .await
            .map_err(|e| err!(Unknown, source(e)))?;
        let mut session = session.demuxed().map_err(|e| err!(Unknown, source(e)))?;

        // First video keyframe; note any audio overheard on the way.
        let mut audio_params = None;
        let first_frame = loop {
            match Pin::new(&mut session).next().await {
                None => bail!(Unavailable, msg("stream closed before first frame")),
                Some(Err(e)) => bail!(Unknown, msg("unable to get first frame"), source(e)),
                Some(Ok(CodecItem::VideoFrame(v))) => {
                    if v.is_random_access_point() {
                        break v;
                    }
                }
                Some(Ok(CodecItem::AudioFrame(a))) => {
                    if let Some((_, encoding)) = &audio_stream {
                        audio_params.get_or_insert_with(|| {
                            Self::audio_params_from_frame(encoding, &a)
                        });
                    }
                }
                Some(Ok(_)) => {}
            }
        };
        let video_params = match session.streams()[video_stream_i].parameters() {
            Some(retina::codec::ParametersRef::Video(v)) => params_to_extra_data(&v.clone())?,
            Some(_) => unreachable!(),
            None => bail!(Unknown, msg("couldn't find video parameters")),
        };
        let self_ = Box::new(Self {
            label,
            session,
            video_stream_i,
            video_params,
            audio_stream,
            audio_params,
        });
        Ok((self_, first_frame))
    }

    fn audio_params_from_frame(encoding: &str, frame: &retina::codec::AudioFrame) -> AudioParams {
        let clock_rate = frame.timestamp().clock_rate().get();
        AudioParams::from_rtsp(encoding, clock_rate, default_channels(encoding))
    }

    /// Fetches the next video or audio frame.
    async fn fetch_next(
        mut self: Box<Self>,
    ) -> Result<
        (
            Box<Self>,
            CodecItem,
            Option<retina::codec::VideoParameters>,
        ),
        Error,
    > {
        loop {
            match Pin::new(&mut self.session)
                .next()
                .await
                .transpose()
                .map_err(|e| err!(Unknown, source(e)))?
            {
                None => bail!(Unavailable, msg("end of stream")),
                Some(CodecItem::VideoFrame(v)) => {
                    if v.loss() > 0 {
                        warn!(
                            "{}: lost {} RTP packets @ {}",
                            &self.label,
                            v.loss(),
                            v.start_ctx()
                        );
                    }
                    let p = if v.has_new_parameters() {
                        Some(match self.session.streams()[self.video_stream_i].parameters() {
                            Some(retina::codec::ParametersRef::Video(v)) => v.clone(),
                            _ => unreachable!(),
                        })
                    } else {
                        None
                    };
                    return Ok((self, CodecItem::VideoFrame(v), p));
                }
                Some(CodecItem::AudioFrame(a)) => {
                    if let Some((_, encoding)) = &self.audio_stream {
                        if self.audio_params.is_none() {
                            self.audio_params = Some(Self::audio_params_from_frame(encoding, &a));
                        }
                    }
                    return Ok((self, CodecItem::AudioFrame(a), None));
                }
                Some(_) => {}
            }
        }
    }
}

impl Stream for RetinaStream {
    fn video_params(&self) -> &h264::ExtraData {
        &self.inner.as_ref().unwrap().video_params
    }

    fn audio_params(&self) -> Option<&AudioParams> {
        self.inner.as_ref().unwrap().audio_params.as_ref()
    }

    fn next(&mut self) -> Result<Frame, Error> {
        if let Some(f) = self.first_frame.take() {
            return Ok(Frame::Video(VideoFrame {
                pts: f.timestamp().elapsed(),
                is_key: f.is_random_access_point(),
                data: f.into_data().into(),
                new_parameters: false,
            }));
        }
        let inner = self.inner.take().unwrap();
        let (mut inner, item, new_parameters) = self
            .rt_handle
            .block_on(
                self.rt_handle
                    .spawn(tokio::time::timeout(PACKET_TIMEOUT, inner.fetch_next())),
            )
            .expect("fetch_next task panicked, see earlier error")
            .map_err(|e| {
                err!(
                    DeadlineExceeded,
                    msg("unable to get next frame within {PACKET_TIMEOUT:?}"),
                    source(e)
                )
            })??;
        let mut new_video_parameters = false;
        if let Some(p) = new_parameters {
            let params = params_to_extra_data(&p)?;
            if params != inner.video_params {
                debug!(
                    "{}: parameter change:\nold: {:?}\nnew: {:?}",
                    &inner.label, &inner.video_params, &params
                );
                inner.video_params = params;
                new_video_parameters = true;
            }
        }
        let frame = match item {
            CodecItem::VideoFrame(v) => Frame::Video(VideoFrame {
                pts: v.timestamp().elapsed(),
                is_key: v.is_random_access_point(),
                data: v.into_data().into(),
                new_parameters: new_video_parameters,
            }),
            CodecItem::AudioFrame(a) => Frame::Audio(AudioFrame {
                pts: a.timestamp().elapsed(),
                data: a.data().to_vec().into(),
            }),
            _ => unreachable!("fetch_next returns only video and audio frames"),
        };
        self.inner = Some(inner);
        Ok(frame)
    }
}
