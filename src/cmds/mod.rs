// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{err, Error};
use std::path::Path;
use tracing::info;

pub mod check;
pub mod export;
pub mod init;
pub mod run;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum OpenMode {
    ReadOnly,
    ReadWrite,
    Create,
}

/// Opens the catalog database. Failures map to "catalog unreachable".
pub(crate) fn open_conn(db_path: &Path, mode: OpenMode) -> Result<rusqlite::Connection, Error> {
    info!(
        "opening {} in {:?} mode with SQLite version {}",
        db_path.display(),
        mode,
        rusqlite::version()
    );
    let conn = rusqlite::Connection::open_with_flags(
        db_path,
        match mode {
            OpenMode::ReadOnly => rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
            OpenMode::ReadWrite => rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE,
            OpenMode::Create => {
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            }
        } |
        // rusqlite::Connection is not Sync, so there's no reason to tell
        // SQLite3 to use the serialized threading mode.
        rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| {
        err!(
            Unavailable,
            msg("unable to open catalog {}", db_path.display()),
            source(e)
        )
    })?;
    Ok(conn)
}

/// Opens an initialized catalog. Version mismatches and missing schemas also
/// count as "catalog unreachable" for exit-status purposes.
pub(crate) fn open_catalog(db_path: &Path, mode: OpenMode) -> Result<db::Database, Error> {
    let conn = open_conn(db_path, mode)?;
    db::Database::new(conn).map_err(|e| e.map_kind(base::ErrorKind::Unavailable))
}
