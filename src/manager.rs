// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Supervision of stream workers: lifecycle, reload reconciliation, and the
//! memory governor.

use crate::audio::TranscoderRegistry;
use crate::stream;
use crate::streamer::{Environment, StreamState, StreamStatus, Streamer, StreamerConfig, WorkerCommand};
use base::clock::Clocks;
use base::shutdown;
use db::dir::ArchiveDir;
use db::Database;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

/// Gap between worker starts, bounding peak memory use at boot while the
/// RTSP sessions buffer their first GOPs.
const STARTUP_STAGGER: std::time::Duration = std::time::Duration::from_millis(150);

/// Memory governor thresholds. `high_rss_kb == 0` disables the governor.
#[derive(Clone, Copy, Debug)]
pub struct MemoryGovernorConfig {
    pub high_rss_kb: u64,
    pub low_rss_kb: u64,

    /// Samples over the high-water mark required before pausing a worker, so
    /// a transient allocation spike doesn't drop a stream.
    pub consecutive: u32,
}

impl Default for MemoryGovernorConfig {
    fn default() -> Self {
        MemoryGovernorConfig {
            high_rss_kb: 0,
            low_rss_kb: 0,
            consecutive: 3,
        }
    }
}

/// Reads this process's resident set size from `/proc/self/status`.
pub fn read_rss_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            return rest
                .trim()
                .trim_end_matches(" kB")
                .trim()
                .parse::<u64>()
                .ok();
        }
    }
    None
}

struct WorkerHandle {
    join: thread::JoinHandle<()>,
    tx: mpsc::Sender<WorkerCommand>,
    status: Arc<StreamStatus>,
    priority: u8,
    paused: bool,

    /// Captures the settings the worker was started with; a differing
    /// fingerprint on reload means stop-and-restart.
    fingerprint: String,
}

fn fingerprint(cfg: &StreamerConfig) -> String {
    format!(
        "{}|udp={}|user={}|seg={:?}|max={:?}|prio={}|trigger={}",
        cfg.url,
        cfg.use_udp,
        cfg.creds.as_ref().map(|c| c.username.as_str()).unwrap_or(""),
        cfg.writer.segment_duration,
        cfg.writer.max_segment_bytes,
        cfg.priority,
        cfg.writer.trigger.as_str(),
    )
}

/// Owns the map of stream name to worker.
pub struct RecordingManager<C: Clocks + Clone> {
    opener: Arc<dyn stream::Opener>,
    db: Arc<Database>,
    dir: ArchiveDir,
    registry: Arc<TranscoderRegistry>,
    clocks: C,
    shutdown_rx: shutdown::Receiver,
    rt_handle: tokio::runtime::Handle,
    workers: HashMap<String, WorkerHandle>,
    governor_cfg: MemoryGovernorConfig,
    over_high_count: u32,
}

impl<C: Clocks + Clone> RecordingManager<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opener: Arc<dyn stream::Opener>,
        db: Arc<Database>,
        dir: ArchiveDir,
        registry: Arc<TranscoderRegistry>,
        clocks: C,
        shutdown_rx: shutdown::Receiver,
        rt_handle: tokio::runtime::Handle,
        governor_cfg: MemoryGovernorConfig,
    ) -> Self {
        RecordingManager {
            opener,
            db,
            dir,
            registry,
            clocks,
            shutdown_rx,
            rt_handle,
            workers: HashMap::new(),
            governor_cfg,
            over_high_count: 0,
        }
    }

    /// Starts workers for every stream in `desired`, 150 ms apart.
    pub fn start_all(&mut self, desired: Vec<StreamerConfig>) {
        for (i, cfg) in desired.into_iter().enumerate() {
            if i != 0 {
                self.clocks.sleep(STARTUP_STAGGER);
            }
            self.start_worker(cfg);
        }
    }

    fn start_worker(&mut self, cfg: StreamerConfig) {
        let name = cfg.name.clone();
        if self.workers.contains_key(&name) {
            warn!(stream = %name, "worker already running; skipping start");
            return;
        }
        info!(stream = %name, "starting worker");
        let status = Arc::new(StreamStatus::new());
        let (tx, rx) = mpsc::channel();
        let fp = fingerprint(&cfg);
        let priority = cfg.priority;
        let handle = {
            let opener = self.opener.clone();
            let db = self.db.clone();
            let dir = self.dir.clone();
            let registry = self.registry.clone();
            let clocks = self.clocks.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            let rt_handle = self.rt_handle.clone();
            let status = status.clone();
            thread::Builder::new()
                .name(format!("s-{name}"))
                .spawn(move || {
                    let _enter = rt_handle.enter();
                    let env = Environment {
                        opener: &opener,
                        db: &db,
                        dir: &dir,
                        registry: &registry,
                        clocks: &clocks,
                        shutdown_rx: &shutdown_rx,
                    };
                    let mut s = Streamer::new(&env, cfg, status, rx);
                    s.run();
                })
                .expect("can't create worker thread")
        };
        self.workers.insert(
            name,
            WorkerHandle {
                join: handle,
                tx,
                status,
                priority,
                paused: false,
                fingerprint: fp,
            },
        );
    }

    /// Applies a new desired set of streams: stops workers that are gone or
    /// changed, starts workers that are new or changed.
    pub fn reconcile(&mut self, desired: Vec<StreamerConfig>) {
        let desired: HashMap<String, StreamerConfig> =
            desired.into_iter().map(|c| (c.name.clone(), c)).collect();

        let to_stop: Vec<String> = self
            .workers
            .iter()
            .filter(|(name, handle)| {
                match desired.get(*name) {
                    None => true,
                    Some(cfg) => fingerprint(cfg) != handle.fingerprint,
                }
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in to_stop {
            info!(stream = %name, "stopping worker for configuration change");
            if let Some(h) = self.workers.remove(&name) {
                let _ = h.tx.send(WorkerCommand::Stop);
                if h.join.join().is_err() {
                    warn!(stream = %name, "worker panicked");
                }
            }
        }

        let mut to_start: Vec<StreamerConfig> = desired
            .into_values()
            .filter(|cfg| !self.workers.contains_key(&cfg.name))
            .collect();
        to_start.sort_by(|a, b| a.name.cmp(&b.name));
        self.start_all(to_start);
    }

    /// Signals all workers and waits up to `deadline` for them to drain;
    /// stragglers are abandoned with a warning (the process is exiting).
    pub fn stop_all(&mut self, deadline: std::time::Duration) {
        for h in self.workers.values() {
            let _ = h.tx.send(WorkerCommand::Stop);
        }
        let start = self.clocks.monotonic();
        let mut workers = std::mem::take(&mut self.workers);
        while !workers.is_empty() {
            workers.retain(|name, h| {
                if h.join.is_finished() {
                    info!(stream = %name, "worker drained");
                    false
                } else {
                    true
                }
            });
            // `retain` can't join (it holds references); finished threads
            // have nothing left to run, so dropping their handles is safe.
            if workers.is_empty() {
                break;
            }
            if self.clocks.monotonic().saturating_sub(&start) >= deadline {
                for name in workers.keys() {
                    warn!(stream = %name, "worker did not drain before deadline; abandoning");
                }
                break;
            }
            self.clocks.sleep(std::time::Duration::from_millis(50));
        }
    }

    /// Current status per stream, for the operator surface.
    pub fn statuses(&self) -> Vec<(String, StreamState, i64, u64)> {
        let mut v: Vec<_> = self
            .workers
            .iter()
            .map(|(name, h)| {
                (
                    name.clone(),
                    h.status.state(),
                    h.status.last_pts.load(Ordering::Relaxed),
                    h.status.bytes_written.load(Ordering::Relaxed),
                )
            })
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        v
    }

    /// One memory-governor sample: pause the lowest-priority running worker
    /// after sustained pressure, resume the highest-priority paused worker
    /// once pressure clears.
    pub fn memory_tick(&mut self, rss_kb: Option<u64>) {
        let cfg = self.governor_cfg;
        if cfg.high_rss_kb == 0 {
            return;
        }
        let Some(rss) = rss_kb else { return };
        if rss > cfg.high_rss_kb {
            self.over_high_count += 1;
            if self.over_high_count >= cfg.consecutive {
                self.over_high_count = 0;
                if let Some((name, h)) = self
                    .workers
                    .iter_mut()
                    .filter(|(_, h)| !h.paused)
                    .min_by_key(|(name, h)| (h.priority, (*name).clone()))
                {
                    warn!(
                        stream = name,
                        rss_kb = rss,
                        "memory pressure: pausing lowest-priority worker"
                    );
                    let _ = h.tx.send(WorkerCommand::Pause);
                    h.paused = true;
                }
            }
            return;
        }
        self.over_high_count = 0;
        if rss < cfg.low_rss_kb {
            if let Some((name, h)) = self
                .workers
                .iter_mut()
                .filter(|(_, h)| h.paused)
                .max_by_key(|(name, h)| (h.priority, std::cmp::Reverse((*name).clone())))
            {
                info!(stream = %name, rss_kb = rss, "memory pressure cleared: resuming worker");
                let _ = h.tx.send(WorkerCommand::Resume);
                h.paused = false;
            }
        }
    }

    /// Sends an explicit rotate request to one stream's worker.
    pub fn rotate(&self, stream: &str) -> bool {
        match self.workers.get(stream) {
            Some(h) => h.tx.send(WorkerCommand::Rotate).is_ok(),
            None => false,
        }
    }
}

/// Drives periodic supervision until shutdown: memory governor samples and
/// configuration reloads delivered on `reload_rx`. Returns once shutdown is
/// requested; the caller should then `stop_all`.
pub fn run_supervisor<C: Clocks + Clone>(
    mgr: &mut RecordingManager<C>,
    shutdown_rx: &shutdown::Receiver,
    reload_rx: &mpsc::Receiver<Vec<StreamerConfig>>,
) {
    while shutdown_rx
        .wait_for(std::time::Duration::from_secs(1))
        .is_ok()
    {
        while let Ok(desired) = reload_rx.try_recv() {
            info!(streams = desired.len(), "applying configuration reload");
            mgr.reconcile(desired);
        }
        mgr.memory_tick(read_rss_kb());
    }
}
