// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving the catalog. Used for tests of
//! both this crate and the binary crate.

use crate::db;
use crate::dir;
use std::sync::Arc;
use tempfile::TempDir;

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests: sets up logging.
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
    });
}

pub struct TestDb {
    pub db: Arc<db::Database>,
    pub tmpdir: TempDir,
}

impl TestDb {
    /// Creates a catalog backed by an in-memory SQLite database, plus a temp
    /// directory for tests that need files on disk.
    pub fn new() -> Self {
        let tmpdir = tempfile::Builder::new()
            .prefix("nightjar-nvr-test")
            .tempdir()
            .unwrap();
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        db::init(&mut conn).unwrap();
        let db = Arc::new(db::Database::new(conn).unwrap());
        TestDb { db, tmpdir }
    }

    /// An [`dir::ArchiveDir`] rooted in this test's temp directory.
    pub fn archive_dir(&self) -> dir::ArchiveDir {
        dir::ArchiveDir::open(self.tmpdir.path(), true).unwrap()
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}
