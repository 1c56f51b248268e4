// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand wrapping the export engine.

use crate::config::ConfigFile;
use crate::export::{export, ExportRequest};
use base::time::Time;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use std::sync::Arc;

/// Exports a time range of one stream into a single playable file.
#[derive(Bpaf, Debug)]
#[bpaf(command("export"))]
pub struct Args {
    /// Path to the configuration file.
    #[bpaf(long, argument("PATH"), fallback("/etc/nightjar-nvr.toml".into()))]
    config: PathBuf,

    /// Stream name to export.
    #[bpaf(long, argument("NAME"))]
    stream: String,

    /// Range start: seconds since epoch or e.g. 2006-01-02T15:04:05Z.
    #[bpaf(long, argument("TIME"))]
    start: String,

    /// Range end, same formats as --start.
    #[bpaf(long, argument("TIME"))]
    end: String,

    /// Output file path.
    #[bpaf(positional("DEST"))]
    dest: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = ConfigFile::load(&args.config)?;
    let db = Arc::new(super::open_catalog(
        &config.db_path,
        super::OpenMode::ReadOnly,
    )?);
    let start = Time::parse(&args.start)?;
    let end = Time::parse(&args.end)?;
    let summary = export(
        &db,
        &ExportRequest {
            stream: args.stream,
            range: start..end,
            dest: args.dest,
        },
    )?;
    println!(
        "wrote {} bytes ({} video samples from {} segments) to {}",
        summary.bytes,
        summary.video_samples,
        summary.segments,
        summary.path.display(),
    );
    Ok(0)
}
