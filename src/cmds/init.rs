// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to create the catalog schema and archive tree.

use crate::config::ConfigFile;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

/// Initializes the catalog database and archive directory.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    /// Path to the configuration file.
    #[bpaf(long, argument("PATH"), fallback("/etc/nightjar-nvr.toml".into()))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = ConfigFile::load(&args.config)?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut conn = super::open_conn(&config.db_path, super::OpenMode::Create)?;

    // Check if the catalog has already been initialized.
    let already: i64 = conn
        .query_row(
            "select count(*) from sqlite_master where type = 'table' and name = 'meta'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);
    if already != 0 {
        let _ = db::Database::new(conn)?;
        info!("catalog is already initialized");
    } else {
        db::init(&mut conn)?;
        info!("initialized catalog at {}", config.db_path.display());
    }

    let dir = db::dir::ArchiveDir::open(&config.storage_path, true)?;
    info!("archive root ready at {}", dir.root().display());
    Ok(0)
}
