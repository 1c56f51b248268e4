// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-stream workers: connect to a source and drive a segment writer.

use crate::audio::TranscoderRegistry;
use crate::h264;
use crate::stream;
use crate::writer::{self, Writer, WriterConfig};
use base::clock::Clocks;
use base::shutdown;
use base::{Error, ErrorKind};
use db::Database;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Cap for the exponential reconnect backoff.
const MAX_BACKOFF_SECS: u64 = 30;

/// How often a paused or backing-off worker rechecks for commands.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Control messages from the manager to a worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Close the current segment at the next keyframe and start another.
    Rotate,

    /// Drop the connection and current segment, then idle until `Resume`.
    /// Used by the memory governor.
    Pause,

    Resume,

    /// Drain and stop for good.
    Stop,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Running,
    Reconnecting,
    Paused,
    Stopped,
    Error(String),
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Connecting => write!(f, "connecting"),
            StreamState::Running => write!(f, "running"),
            StreamState::Reconnecting => write!(f, "reconnecting"),
            StreamState::Paused => write!(f, "paused"),
            StreamState::Stopped => write!(f, "stopped"),
            StreamState::Error(reason) => write!(f, "error:{reason}"),
        }
    }
}

/// Shared worker state the manager reads: lifecycle state plus heartbeat.
pub struct StreamStatus {
    state: base::Mutex<StreamState>,

    /// Latest video pts seen, for staleness monitoring.
    pub last_pts: AtomicI64,

    /// Bytes committed to the current segment.
    pub bytes_written: AtomicU64,
}

impl StreamStatus {
    pub fn new() -> Self {
        StreamStatus {
            state: base::Mutex::new(StreamState::Connecting),
            last_pts: AtomicI64::new(-1),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state.lock().clone()
    }

    fn set_state(&self, s: StreamState) {
        *self.state.lock() = s;
    }
}

impl Default for StreamStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Common state that can be used by multiple [`Streamer`] instances.
pub struct Environment<'a, C: Clocks + Clone, D: writer::DirWriter + Clone> {
    pub opener: &'a Arc<dyn stream::Opener>,
    pub db: &'a Arc<Database>,
    pub dir: &'a D,
    pub registry: &'a Arc<TranscoderRegistry>,
    pub clocks: &'a C,
    pub shutdown_rx: &'a shutdown::Receiver,
}

/// Per-worker configuration, resolved from the config file.
#[derive(Clone)]
pub struct StreamerConfig {
    pub name: String,
    pub url: Url,
    pub creds: Option<retina::client::Credentials>,
    pub use_udp: bool,
    pub writer: WriterConfig,
    pub priority: u8,
}

enum Exit {
    Stopped,
    Paused,
}

/// Connects to one RTSP stream and writes segments via [`Writer`]. Meant to
/// be long-lived: it sleeps and retries with backoff after failures. Owns
/// clones of the shared environment so it can run on its own thread.
pub struct Streamer<C: Clocks + Clone, D: writer::DirWriter + Clone> {
    opener: Arc<dyn stream::Opener>,
    db: Arc<Database>,
    dir: D,
    registry: Arc<TranscoderRegistry>,
    clocks: C,
    shutdown_rx: shutdown::Receiver,
    cfg: StreamerConfig,
    status: Arc<StreamStatus>,
    cmds: mpsc::Receiver<WorkerCommand>,
    annexb_buf: Vec<u8>,
}

impl<C: Clocks + Clone, D: writer::DirWriter + Clone> Streamer<C, D> {
    pub fn new(
        env: &Environment<'_, C, D>,
        cfg: StreamerConfig,
        status: Arc<StreamStatus>,
        cmds: mpsc::Receiver<WorkerCommand>,
    ) -> Self {
        Streamer {
            opener: env.opener.clone(),
            db: env.db.clone(),
            dir: env.dir.clone(),
            registry: env.registry.clone(),
            clocks: env.clocks.clone(),
            shutdown_rx: env.shutdown_rx.clone(),
            cfg,
            status,
            cmds,
            annexb_buf: Vec::new(),
        }
    }

    pub fn short_name(&self) -> &str {
        &self.cfg.name
    }

    /// Runs until stopped by command or shutdown.
    pub fn run(&mut self) {
        let mut backoff_secs = 1;
        loop {
            if self.shutdown_rx.check().is_err() {
                break;
            }
            match self.drain_commands() {
                ControlFlow::Stop => break,
                ControlFlow::Continue => {}
            }
            self.status.set_state(StreamState::Connecting);
            match self.run_once(&mut backoff_secs) {
                Ok(Exit::Stopped) => break,
                Ok(Exit::Paused) => {
                    info!("{}: paused", self.cfg.name);
                    self.status.set_state(StreamState::Paused);
                    match self.wait_for_resume() {
                        ControlFlow::Stop => break,
                        ControlFlow::Continue => {
                            backoff_secs = 1;
                            continue;
                        }
                    }
                }
                Err(e) => {
                    // Persistent failures (bad credentials, no usable codec,
                    // a full disk) surface via status; transient ones just
                    // reconnect. Either way the worker keeps retrying, so a
                    // freed disk or fixed camera recovers without a restart.
                    let state = match e.kind() {
                        ErrorKind::Unauthenticated
                        | ErrorKind::FailedPrecondition
                        | ErrorKind::ResourceExhausted => StreamState::Error(e.to_string()),
                        _ => StreamState::Reconnecting,
                    };
                    warn!(
                        stream = %self.cfg.name,
                        err = %e.chain(),
                        "sleeping for {backoff_secs} s after error"
                    );
                    self.status.set_state(state);
                    if self.sleep_checking_commands(backoff_secs) == ControlFlow::Stop {
                        break;
                    }
                    backoff_secs = std::cmp::min(backoff_secs * 2, MAX_BACKOFF_SECS);
                }
            }
        }
        self.registry.remove(&self.cfg.name);
        self.status.set_state(StreamState::Stopped);
        info!("{}: shutting down", self.cfg.name);
    }

    /// One connection attempt and packet loop. Resets `backoff_secs` once
    /// the source is delivering.
    fn run_once(&mut self, backoff_secs: &mut u64) -> Result<Exit, Error> {
        info!("{}: opening input: {}", self.cfg.name, self.cfg.url);
        let mut src = {
            let _t = base::clock::TimerGuard::new(&self.clocks, || {
                format!("opening {}", self.cfg.url)
            });
            self.opener.open(
                self.cfg.name.clone(),
                self.cfg.url.clone(),
                stream::Options {
                    session: retina::client::SessionOptions::default()
                        .creds(self.cfg.creds.clone()),
                    transport: if self.cfg.use_udp {
                        retina::client::Transport::Udp(Default::default())
                    } else {
                        retina::client::Transport::Tcp(Default::default())
                    },
                },
            )?
        };
        debug!("{}: connected", self.cfg.name);
        *backoff_secs = 1;
        self.status.set_state(StreamState::Running);
        let mut w = Writer::new(
            &self.dir,
            &self.db,
            &self.clocks,
            &self.registry,
            self.cfg.writer.clone(),
        );

        loop {
            if self.shutdown_rx.check().is_err() {
                w.close(Some("shutdown"))?;
                return Ok(Exit::Stopped);
            }
            loop {
                match self.cmds.try_recv() {
                    Ok(WorkerCommand::Stop) => {
                        w.close(Some("stop"))?;
                        return Ok(Exit::Stopped);
                    }
                    Ok(WorkerCommand::Pause) => {
                        w.close(Some("pause"))?;
                        return Ok(Exit::Paused);
                    }
                    Ok(WorkerCommand::Rotate) => w.request_rotate(),
                    Ok(WorkerCommand::Resume) => {}
                    Err(mpsc::TryRecvError::Empty) => break,
                    Err(mpsc::TryRecvError::Disconnected) => {
                        w.close(Some("manager gone"))?;
                        return Ok(Exit::Stopped);
                    }
                }
            }

            let frame = {
                let _t = base::clock::TimerGuard::new(&self.clocks, || "getting next packet");
                src.next()?
            };
            match frame {
                stream::Frame::Video(v) => {
                    if v.new_parameters {
                        // New dimensions or parameter sets take effect at the
                        // next segment.
                        debug!("{}: video parameters changed; rotating", self.cfg.name);
                        w.request_rotate();
                    }
                    let transformed = h264::ensure_annex_b(&v.data, &mut self.annexb_buf)?;
                    let data: &[u8] = if transformed {
                        &self.annexb_buf
                    } else {
                        &v.data
                    };
                    let _t = base::clock::TimerGuard::new(&self.clocks, || {
                        format!("writing {} bytes", data.len())
                    });
                    w.write_video(src.video_params(), src.audio_params(), v.pts, v.is_key, data)?;
                    self.status.last_pts.store(v.pts, Ordering::Relaxed);
                    self.status
                        .bytes_written
                        .store(w.bytes_written(), Ordering::Relaxed);
                }
                stream::Frame::Audio(a) => {
                    w.write_audio(&a.data)?;
                }
            }
        }
    }

    fn drain_commands(&mut self) -> ControlFlow {
        loop {
            match self.cmds.try_recv() {
                Ok(WorkerCommand::Stop) => return ControlFlow::Stop,
                Ok(_) => {}
                Err(mpsc::TryRecvError::Empty) => return ControlFlow::Continue,
                Err(mpsc::TryRecvError::Disconnected) => return ControlFlow::Stop,
            }
        }
    }

    /// Blocks until `Resume` (or stop/shutdown) while paused.
    fn wait_for_resume(&mut self) -> ControlFlow {
        loop {
            if self.shutdown_rx.check().is_err() {
                return ControlFlow::Stop;
            }
            match self.cmds.recv_timeout(POLL_INTERVAL) {
                Ok(WorkerCommand::Resume) => return ControlFlow::Continue,
                Ok(WorkerCommand::Stop) => return ControlFlow::Stop,
                Ok(_) => {}
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => return ControlFlow::Stop,
            }
        }
    }

    /// Sleeps `secs`, waking early for stop commands and shutdown.
    fn sleep_checking_commands(&mut self, secs: u64) -> ControlFlow {
        for _ in 0..secs {
            if self.shutdown_rx.check().is_err() {
                return ControlFlow::Stop;
            }
            if let ControlFlow::Stop = self.drain_commands() {
                return ControlFlow::Stop;
            }
            self.clocks.sleep(POLL_INTERVAL);
        }
        ControlFlow::Continue
    }
}

#[derive(PartialEq, Eq)]
enum ControlFlow {
    Continue,
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testutil::mock_factory;
    use base::clock::SimulatedClocks;
    use base::time::Time;
    use db::testutil::TestDb;
    use std::collections::VecDeque;

    // 2015-04-25 00:00:00 UTC.
    const T0: i64 = 1_429_920_000;

    const AVC_EXTRADATA: [u8; 38] = [
        0x01, 0x4d, 0x00, 0x1f, 0xff, 0xe1, 0x00, 0x17, 0x67, 0x4d, 0x00, 0x1f, 0x9a, 0x66, 0x02,
        0x80, 0x2d, 0xff, 0x35, 0x01, 0x01, 0x01, 0x40, 0x00, 0x00, 0xfa, 0x00, 0x00, 0x1d, 0x4c,
        0x01, 0x01, 0x00, 0x04, 0x68, 0xee, 0x3c, 0x80,
    ];

    /// A scripted source: yields frames one second of simulated time apart.
    struct FakeStream {
        clocks: SimulatedClocks,
        video_params: h264::ExtraData,
        frames: VecDeque<(i64, bool)>,
    }

    impl stream::Stream for FakeStream {
        fn video_params(&self) -> &h264::ExtraData {
            &self.video_params
        }
        fn audio_params(&self) -> Option<&crate::audio::AudioParams> {
            None
        }
        fn next(&mut self) -> Result<stream::Frame, Error> {
            let Some((pts, is_key)) = self.frames.pop_front() else {
                return Err(base::err!(Unavailable, msg("end of stream")));
            };
            self.clocks.sleep(std::time::Duration::from_secs(1));
            let mut data = vec![0u8, 0, 0, 1, if is_key { 0x65 } else { 0x41 }];
            data.extend_from_slice(b"payload");
            Ok(stream::Frame::Video(stream::VideoFrame {
                pts,
                is_key,
                data: data.into(),
                new_parameters: false,
            }))
        }
    }

    struct MockOpener {
        streams: base::Mutex<Vec<FakeStream>>,

        /// Dropped (triggering shutdown) when the script runs out.
        shutdown_tx: base::Mutex<Option<base::shutdown::Sender>>,
    }

    impl stream::Opener for MockOpener {
        fn open(
            &self,
            _label: String,
            url: Url,
            _options: stream::Options,
        ) -> Result<Box<dyn stream::Stream>, Error> {
            assert_eq!(url.as_str(), "rtsp://test-camera/main");
            match self.streams.lock().pop() {
                Some(s) => Ok(Box::new(s)),
                None => {
                    self.shutdown_tx.lock().take();
                    Err(base::err!(Unavailable, msg("done")))
                }
            }
        }
    }

    fn streamer_config(segment_secs: u64) -> StreamerConfig {
        StreamerConfig {
            name: "test".to_owned(),
            url: Url::parse("rtsp://test-camera/main").unwrap(),
            creds: None,
            use_udp: false,
            writer: WriterConfig {
                stream_name: "test".to_owned(),
                trigger: db::TriggerKind::Scheduled,
                segment_duration: std::time::Duration::from_secs(segment_secs),
                max_segment_bytes: None,
                fps: 1.0,
            },
            priority: 5,
        }
    }

    #[test]
    fn segments_rotate_and_survive_reconnect() {
        db::testutil::init();
        let tdb = TestDb::new();
        let dir = tdb.archive_dir();
        let clocks = SimulatedClocks::new(Time(T0));
        let registry = Arc::new(TranscoderRegistry::new(mock_factory));
        let video_params = h264::ExtraData::parse(&AVC_EXTRADATA, 1280, 720).unwrap();

        // Two connections; the worker must reconnect between them. Keyframes
        // every third frame, one frame per simulated second.
        let mk = |start_pts: i64, n: i64| FakeStream {
            clocks: clocks.clone(),
            video_params: video_params.clone(),
            frames: (0..n)
                .map(|i| (start_pts + i * 90_000, i % 3 == 0))
                .collect(),
        };
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let opener = Arc::new(MockOpener {
            // Popped from the back.
            streams: base::Mutex::new(vec![mk(900_000, 6), mk(0, 6)]),
            shutdown_tx: base::Mutex::new(Some(shutdown_tx)),
        });
        let opener_dyn: Arc<dyn stream::Opener> = opener.clone();
        let env = Environment {
            opener: &opener_dyn,
            db: &tdb.db,
            dir: &dir,
            registry: &registry,
            clocks: &clocks,
            shutdown_rx: &shutdown_rx,
        };
        let status = Arc::new(StreamStatus::new());
        let (_cmd_tx, cmd_rx) = mpsc::channel();
        let mut s = Streamer::new(&env, streamer_config(3), status.clone(), cmd_rx);
        s.run();
        assert!(opener.streams.lock().is_empty());
        assert_eq!(status.state(), StreamState::Stopped);

        let (rows, _total) = tdb
            .db
            .lock()
            .list_recordings(
                &db::ListFilter::default(),
                db::SortField::StartTime,
                db::SortOrder::Asc,
                100,
                0,
            )
            .unwrap();
        // Each 6-frame connection rotates once (3 s segment duration,
        // keyframes at 0/3 s): two complete segments per connection.
        assert_eq!(rows.len(), 4);
        for pair in rows.windows(2) {
            assert!(pair[0].end_time.unwrap() <= pair[1].start_time);
        }
        for r in &rows {
            assert!(std::path::Path::new(r.file_path.as_ref().unwrap()).exists());
        }
    }

    #[test]
    fn stop_command_drains() {
        db::testutil::init();
        let tdb = TestDb::new();
        let dir = tdb.archive_dir();
        let clocks = SimulatedClocks::new(Time(T0));
        let registry = Arc::new(TranscoderRegistry::new(mock_factory));
        let video_params = h264::ExtraData::parse(&AVC_EXTRADATA, 1280, 720).unwrap();
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let opener = Arc::new(MockOpener {
            streams: base::Mutex::new(vec![FakeStream {
                clocks: clocks.clone(),
                video_params,
                frames: (0..100).map(|i| (i * 90_000, i % 3 == 0)).collect(),
            }]),
            shutdown_tx: base::Mutex::new(Some(shutdown_tx)),
        });
        let opener_dyn: Arc<dyn stream::Opener> = opener.clone();
        let env = Environment {
            opener: &opener_dyn,
            db: &tdb.db,
            dir: &dir,
            registry: &registry,
            clocks: &clocks,
            shutdown_rx: &shutdown_rx,
        };
        let status = Arc::new(StreamStatus::new());
        let (cmd_tx, cmd_rx) = mpsc::channel();
        // Stop is queued before the worker starts: it must exit without
        // consuming the whole script, finalizing anything it wrote.
        cmd_tx.send(WorkerCommand::Stop).unwrap();
        let mut s = Streamer::new(&env, streamer_config(3), status.clone(), cmd_rx);
        s.run();
        assert_eq!(status.state(), StreamState::Stopped);
        assert_eq!(opener.streams.lock().len(), 1, "never connected");
        drop(shutdown_rx);
    }
}
