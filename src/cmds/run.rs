// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to run the recorder: stream workers plus the garbage
//! collector, until SIGINT/SIGTERM.

use crate::audio::{self, TranscoderRegistry};
use crate::config::ConfigFile;
use crate::gc::{Gc, GcConfig};
use crate::manager::{self, RecordingManager};
use crate::stream;
use base::clock::RealClocks;
use base::time::Duration;
use base::{bail, err, Error};
use bpaf::Bpaf;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Seconds workers get to drain on graceful shutdown before being abandoned.
const DRAIN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

/// Runs the recorder.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the configuration file. SIGHUP re-reads it and reconciles
    /// the running stream set.
    #[bpaf(long, argument("PATH"), fallback("/etc/nightjar-nvr.toml".into()))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = ConfigFile::load(&args.config)?;
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = config.worker_threads {
        builder.worker_threads(worker_threads);
    }
    let rt = builder
        .build()
        .map_err(|e| err!(Internal, msg("unable to build runtime"), source(e)))?;
    let r = rt.block_on(async_run(&args.config, &config));

    // In the graceful path everything has been drained with logging; in the
    // immediate path we don't want to wait for spawned tasks at all.
    rt.shutdown_background();
    r
}

async fn async_run(config_path: &std::path::Path, config: &ConfigFile) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    tokio::pin! {
        let int = signal(SignalKind::interrupt()).map_err(|e| err!(Internal, source(e)))?;
        let term = signal(SignalKind::terminate()).map_err(|e| err!(Internal, source(e)))?;
        let inner = inner(config_path, config, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)")),
        result = &mut inner => result,
    }
}

async fn inner(
    config_path: &std::path::Path,
    config: &ConfigFile,
    shutdown_rx: base::shutdown::Receiver,
) -> Result<i32, Error> {
    let clocks = RealClocks {};
    let db = Arc::new(super::open_catalog(
        &config.db_path,
        super::OpenMode::ReadWrite,
    )?);
    info!("catalog is loaded");

    let dir = db::dir::ArchiveDir::open(&config.storage_path, true)?
        .with_write_buffer_kb(config.buffer_size_kb);
    info!("archive root {} is writable", dir.root().display());

    let registry = Arc::new(TranscoderRegistry::new(audio::new_aac_encoder));
    let streamer_configs = config.streamer_configs()?;
    let n_streams = streamer_configs.len();

    let gc = Gc::new(
        db.clone(),
        dir.clone(),
        GcConfig {
            auto_delete_oldest: config.auto_delete_oldest,
            global_max_bytes: config.max_storage_size_mb << 20,
            stale_after: Duration::from_secs(std::cmp::max(
                600,
                2 * i64::from(config.segment_duration_s),
            )),
            ..GcConfig::default()
        },
        config.stream_policies(),
        clocks,
    );
    let gc_shutdown = shutdown_rx.clone();
    let gc_join = tokio::task::spawn_blocking(move || gc.run(&gc_shutdown));

    let mut mgr = RecordingManager::new(
        Arc::new(stream::OPENER),
        db,
        dir,
        registry,
        clocks,
        shutdown_rx.clone(),
        tokio::runtime::Handle::current(),
        config.governor_config(),
    );
    // Configuration reloads ride SIGHUP into the supervisor loop.
    let (reload_tx, reload_rx) = std::sync::mpsc::channel();
    {
        let config_path = config_path.to_owned();
        let mut hup =
            signal(SignalKind::hangup()).map_err(|e| err!(Internal, source(e)))?;
        tokio::spawn(async move {
            while hup.recv().await.is_some() {
                match ConfigFile::load(&config_path).and_then(|c| c.streamer_configs()) {
                    Ok(desired) => {
                        if reload_tx.send(desired).is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(
                        err = %e.chain(),
                        "ignoring SIGHUP: configuration does not load"
                    ),
                }
            }
        });
    }

    let sup_shutdown = shutdown_rx.clone();
    let workers_join = tokio::task::spawn_blocking(move || {
        mgr.start_all(streamer_configs);
        info!("all workers started");
        manager::run_supervisor(&mut mgr, &sup_shutdown, &reload_rx);
        info!("shutting down workers");
        mgr.stop_all(DRAIN_DEADLINE);
    });

    info!(streams = n_streams, "recorder is running");
    workers_join
        .await
        .map_err(|e| err!(Internal, msg("worker supervisor panicked"), source(e)))?;
    gc_join
        .await
        .map_err(|e| err!(Internal, msg("garbage collector panicked"), source(e)))?;
    info!("exiting");
    Ok(0)
}
