// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Retention, quota, and reconciliation passes.
//!
//! Runs on a periodic tick and reconciles three sources of truth: the
//! catalog, the filesystem, and the configured budgets.
//!
//! * The retention pass deletes recordings past their age limit, keeping
//!   detection footage longest.
//! * The quota passes evict oldest-first while a stream (or the whole
//!   archive) is over its byte budget, measuring usage from the filesystem so
//!   out-of-band deletions self-heal.
//! * The orphan pass drops catalog rows whose file is gone; the stale pass
//!   cleans up incomplete rows left by crashed writer sessions.
//!
//! Protected recordings are never touched. Every delete is independent: one
//! failure is logged and skipped, never aborting the pass.

use base::clock::Clocks;
use base::shutdown;
use base::strutil::encode_size;
use base::time::{Duration, Time};
use db::dir::ArchiveDir;
use db::{Database, RecordingRow};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-stream knobs resolved from the configuration.
#[derive(Clone, Debug)]
pub struct StreamPolicy {
    pub name: String,

    /// Age limit in days for non-detection recordings; 0 keeps forever.
    pub retention_days: i64,

    /// Age limit for detection-triggered recordings; 0 or negative falls
    /// back to `retention_days`.
    pub detection_retention_days: i64,

    /// Per-stream byte budget; 0 disables the quota pass for this stream.
    pub max_storage_bytes: i64,
}

#[derive(Clone, Debug)]
pub struct GcConfig {
    pub tick: std::time::Duration,

    /// Orphan and stale reconciliation runs every this many ticks.
    pub ticks_per_reconcile: u32,

    /// Upper bound on items handled per pass per tick, keeping lock hold
    /// times and tick latency predictable.
    pub batch: usize,

    /// Master switch for the quota passes.
    pub auto_delete_oldest: bool,

    /// Archive-wide byte budget applied after per-stream quotas; 0 disables.
    pub global_max_bytes: i64,

    /// Incomplete rows older than this are treated as crash leftovers.
    pub stale_after: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            tick: std::time::Duration::from_secs(300),
            ticks_per_reconcile: 12,
            batch: 500,
            auto_delete_oldest: true,
            global_max_bytes: 0,
            stale_after: Duration::from_secs(600),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassStats {
    pub deleted: usize,
    pub skipped: usize,
    pub bytes_freed: i64,
}

impl PassStats {
    fn absorb(&mut self, other: PassStats) {
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.bytes_freed += other.bytes_freed;
    }
}

pub struct Gc<C: Clocks> {
    db: Arc<Database>,
    dir: ArchiveDir,
    cfg: GcConfig,
    streams: Vec<StreamPolicy>,
    clocks: C,
    orphan_cursor: std::cell::Cell<i64>,
}

impl<C: Clocks> Gc<C> {
    pub fn new(
        db: Arc<Database>,
        dir: ArchiveDir,
        cfg: GcConfig,
        streams: Vec<StreamPolicy>,
        clocks: C,
    ) -> Self {
        Gc {
            db,
            dir,
            cfg,
            streams,
            clocks,
            orphan_cursor: std::cell::Cell::new(0),
        }
    }

    /// Runs ticks until shutdown.
    pub fn run(&self, shutdown_rx: &shutdown::Receiver) {
        let mut tick_no = 0u32;
        loop {
            self.tick(tick_no);
            tick_no = tick_no.wrapping_add(1);
            if shutdown_rx.wait_for(self.cfg.tick).is_err() {
                info!("garbage collector shutting down");
                return;
            }
        }
    }

    /// One full pass over all streams.
    pub fn tick(&self, tick_no: u32) {
        let now = self.clocks.realtime();
        let mut stats = PassStats::default();
        for policy in &self.streams {
            stats.absorb(self.retention_pass(policy, now));
            if self.cfg.auto_delete_oldest {
                stats.absorb(self.quota_pass(policy));
            }
        }
        if self.cfg.auto_delete_oldest && self.cfg.global_max_bytes > 0 {
            stats.absorb(self.global_quota_pass());
        }
        if tick_no % self.cfg.ticks_per_reconcile == 0 {
            stats.absorb(self.orphan_pass());
            stats.absorb(self.stale_pass(now));
        }
        if stats.deleted > 0 || stats.skipped > 0 {
            info!(
                deleted = stats.deleted,
                skipped = stats.skipped,
                freed = %encode_size(stats.bytes_freed),
                "garbage collection tick complete"
            );
        }
    }

    /// Deletes the file (missing is fine) and then the row. Returns the
    /// freed size, or `None` if the row was skipped.
    fn delete_recording(&self, row: &RecordingRow) -> Option<i64> {
        if let Some(path) = &row.file_path {
            if let Err(e) = self.dir.unlink(Path::new(path)) {
                warn!(
                    recording = row.id,
                    path = %path,
                    err = %e.chain(),
                    "unable to delete file; skipping row"
                );
                return None;
            }
        }
        match self.db.lock().delete_recording(row.id) {
            Ok(()) => Some(row.size_bytes),
            Err(e) => {
                warn!(recording = row.id, err = %e.chain(), "unable to delete row");
                None
            }
        }
    }

    /// Age-based deletion for one stream. Non-detection recordings go first,
    /// then detection ones; oldest first within each class. Protection and
    /// unelapsed per-recording overrides are honored by the candidate query.
    pub fn retention_pass(&self, policy: &StreamPolicy, now: Time) -> PassStats {
        let mut stats = PassStats::default();
        if policy.retention_days <= 0 {
            return stats;
        }
        let detection_days = if policy.detection_retention_days > 0 {
            policy.detection_retention_days
        } else {
            policy.retention_days
        };
        let candidates = match self.db.lock().retention_candidates(
            &policy.name,
            policy.retention_days,
            detection_days,
            now,
            self.cfg.batch as i64,
        ) {
            Ok(c) => c,
            Err(e) => {
                warn!(stream = %policy.name, err = %e.chain(), "retention query failed");
                return stats;
            }
        };
        for row in &candidates {
            match self.delete_recording(row) {
                Some(freed) => {
                    stats.deleted += 1;
                    stats.bytes_freed += freed;
                }
                None => stats.skipped += 1,
            }
        }
        stats
    }

    /// Oldest-first eviction while the stream is over its byte budget.
    /// Usage is measured from the filesystem, not the catalog.
    pub fn quota_pass(&self, policy: &StreamPolicy) -> PassStats {
        let mut stats = PassStats::default();
        if policy.max_storage_bytes <= 0 {
            return stats;
        }
        let mut usage = match self.dir.stream_usage(&policy.name) {
            Ok(u) => u,
            Err(e) => {
                warn!(stream = %policy.name, err = %e.chain(), "usage scan failed");
                return stats;
            }
        };
        while usage > policy.max_storage_bytes && stats.deleted + stats.skipped < self.cfg.batch {
            let candidates = match self
                .db
                .lock()
                .quota_candidates(&policy.name, (stats.skipped + 1) as i64)
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(stream = %policy.name, err = %e.chain(), "quota query failed");
                    break;
                }
            };
            // Skipped rows come back from the query; step past them.
            let Some(row) = candidates.into_iter().nth(stats.skipped) else {
                break;
            };
            match self.delete_recording(&row) {
                Some(freed) => {
                    stats.deleted += 1;
                    stats.bytes_freed += freed;
                    usage -= freed;
                }
                None => stats.skipped += 1,
            }
        }
        stats
    }

    /// Archive-wide quota, applied after per-stream quotas: walks streams
    /// round-robin, evicting each stream's oldest unprotected recording in
    /// turn until the global budget is met.
    pub fn global_quota_pass(&self) -> PassStats {
        let mut stats = PassStats::default();
        let mut usage = 0i64;
        for policy in &self.streams {
            match self.dir.stream_usage(&policy.name) {
                Ok(u) => usage += u,
                Err(e) => {
                    warn!(stream = %policy.name, err = %e.chain(), "usage scan failed");
                }
            }
        }
        while usage > self.cfg.global_max_bytes && stats.deleted + stats.skipped < self.cfg.batch {
            let mut any = false;
            for policy in &self.streams {
                if usage <= self.cfg.global_max_bytes {
                    break;
                }
                let candidate = self
                    .db
                    .lock()
                    .quota_candidates(&policy.name, 1)
                    .ok()
                    .and_then(|mut v| v.pop());
                let Some(row) = candidate else { continue };
                any = true;
                match self.delete_recording(&row) {
                    Some(freed) => {
                        stats.deleted += 1;
                        stats.bytes_freed += freed;
                        usage -= freed;
                    }
                    None => stats.skipped += 1,
                }
            }
            if !any {
                break;
            }
        }
        stats
    }

    /// Removes rows whose file disappeared out-of-band. Scans are bounded and
    /// resume from a cursor, wrapping at the end of the table.
    pub fn orphan_pass(&self) -> PassStats {
        let mut stats = PassStats::default();
        let (orphans, cursor) = match self.db.lock().orphan_candidates(
            self.orphan_cursor.get(),
            self.cfg.batch,
            self.cfg.batch * 4,
        ) {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e.chain(), "orphan query failed");
                return stats;
            }
        };
        let wrapped = orphans.len() < self.cfg.batch;
        for row in &orphans {
            match self.db.lock().delete_recording(row.id) {
                Ok(()) => stats.deleted += 1,
                Err(e) => {
                    warn!(recording = row.id, err = %e.chain(), "unable to delete orphan row");
                    stats.skipped += 1;
                }
            }
        }
        self.orphan_cursor.set(if wrapped { 0 } else { cursor });
        if stats.deleted > 0 {
            info!(orphans = stats.deleted, "removed orphaned catalog rows");
        }
        stats
    }

    /// Cleans up incomplete rows (and their partial files) from writer
    /// sessions that can no longer finalize. A crashed session's file is
    /// never promoted to a complete recording: completeness is only ever
    /// granted through the writer's finalize path.
    pub fn stale_pass(&self, now: Time) -> PassStats {
        let mut stats = PassStats::default();
        let cutoff = match now.checked_sub(self.cfg.stale_after) {
            Some(c) => c,
            None => return stats,
        };
        let rows = match self
            .db
            .lock()
            .stale_incomplete(cutoff, self.cfg.batch as i64)
        {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e.chain(), "stale query failed");
                return stats;
            }
        };
        for row in &rows {
            match self.delete_recording(row) {
                Some(_) => stats.deleted += 1,
                None => stats.skipped += 1,
            }
        }
        if stats.deleted > 0 {
            info!(stale = stats.deleted, "removed stale incomplete recordings");
        }
        stats
    }
}
