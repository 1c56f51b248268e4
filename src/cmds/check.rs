// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to reconcile the catalog with the filesystem: a one-shot
//! orphan and stale pass, for use after manual archive surgery.

use crate::config::ConfigFile;
use crate::gc::{Gc, GcConfig};
use base::clock::{Clocks as _, RealClocks};
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use std::sync::Arc;

/// Checks catalog/filesystem consistency and removes orphaned rows.
#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
pub struct Args {
    /// Path to the configuration file.
    #[bpaf(long, argument("PATH"), fallback("/etc/nightjar-nvr.toml".into()))]
    config: PathBuf,

    /// Also delete recordings past retention, as the periodic collector
    /// would.
    #[bpaf(long)]
    enforce_retention: bool,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = ConfigFile::load(&args.config)?;
    let db = Arc::new(super::open_catalog(
        &config.db_path,
        super::OpenMode::ReadWrite,
    )?);
    let dir = db::dir::ArchiveDir::open(&config.storage_path, false)?;
    let clocks = RealClocks {};
    let now = clocks.realtime();
    let gc = Gc::new(
        db,
        dir,
        GcConfig {
            auto_delete_oldest: false,
            ..GcConfig::default()
        },
        config.stream_policies(),
        clocks,
    );

    let mut orphans = crate::gc::PassStats::default();
    // Each pass is bounded; repeat until one comes back empty, with a cap in
    // case some row fails to delete on every attempt.
    for _ in 0..1000 {
        let stats = gc.orphan_pass();
        if stats.deleted == 0 && stats.skipped == 0 {
            break;
        }
        orphans.deleted += stats.deleted;
        orphans.skipped += stats.skipped;
    }
    let stale = gc.stale_pass(now);
    println!(
        "orphaned rows removed: {}; stale sessions cleaned: {}; skipped: {}",
        orphans.deleted,
        stale.deleted,
        orphans.skipped + stale.skipped,
    );
    if args.enforce_retention {
        let mut deleted = 0;
        for policy in config.stream_policies() {
            deleted += gc.retention_pass(&policy, now).deleted;
        }
        println!("recordings past retention removed: {deleted}");
    }
    Ok(0)
}
