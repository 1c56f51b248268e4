// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The on-disk archive tree.
//!
//! Layout: `<root>/<stream_name>/<YYYY>/<MM>/<DD>/<HHMMSS>-<trigger>.mp4`,
//! with date components in UTC. Each stream's worker is the only writer under
//! its subtree; only the garbage collector deletes from it.

use base::time::Time;
use base::{bail, err, Error, ErrorKind};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Handle to the archive root.
#[derive(Clone, Debug)]
pub struct ArchiveDir {
    root: PathBuf,

    /// Capacity callers should give their segment write buffers.
    write_buffer_bytes: usize,
}

impl ArchiveDir {
    /// Opens the archive root, creating it if requested.
    ///
    /// The root is made world-writable to match the permissive layout used on
    /// appliance devices where sibling services index the tree. Verifies
    /// writability with a probe file so a misconfigured mount fails at
    /// startup rather than at the first segment.
    pub fn open(root: &Path, create: bool) -> Result<Self, Error> {
        if create {
            fs::create_dir_all(root)
                .map_err(|e| err!(PermissionDenied, msg("unable to create archive root {}", root.display()), source(e)))?;
            if let Err(e) = fs::set_permissions(root, fs::Permissions::from_mode(0o777)) {
                warn!(err = %e, "unable to make archive root {} world-writable", root.display());
            }
        } else if !root.is_dir() {
            bail!(
                PermissionDenied,
                msg("archive root {} is not a directory", root.display())
            );
        }
        let probe = root.join(".nightjar-write-probe");
        fs::write(&probe, b"")
            .and_then(|()| fs::remove_file(&probe))
            .map_err(|e| {
                err!(
                    PermissionDenied,
                    msg("archive root {} is not writable", root.display()),
                    source(e),
                )
            })?;
        Ok(ArchiveDir {
            root: root.to_owned(),
            write_buffer_bytes: 1 << 20,
        })
    }

    pub fn with_write_buffer_kb(mut self, kb: u32) -> Self {
        self.write_buffer_bytes = kb as usize * 1024;
        self
    }

    pub fn write_buffer_bytes(&self) -> usize {
        self.write_buffer_bytes
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stream_root(&self, stream_name: &str) -> PathBuf {
        self.root.join(stream_name)
    }

    /// Computes the segment path for a recording starting at `start` (UTC).
    pub fn segment_path(&self, stream_name: &str, start: Time, trigger: &str) -> PathBuf {
        let ts = jiff::Timestamp::from_second(start.0).unwrap_or_default();
        let dt = ts.to_zoned(jiff::tz::TimeZone::UTC);
        self.root.join(stream_name).join(format!(
            "{:04}/{:02}/{:02}/{:02}{:02}{:02}-{trigger}.mp4",
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second(),
        ))
    }

    /// Creates the file at `path` (and any missing parent directories, mode
    /// 0755). Fails if the file already exists: paths have one-second
    /// resolution, and a collision means two writers for one stream.
    pub fn create_segment(&self, path: &Path) -> Result<fs::File, Error> {
        let parent = path
            .parent()
            .ok_or_else(|| err!(InvalidArgument, msg("segment path {} has no parent", path.display())))?;
        fs::create_dir_all(parent)?;
        let f = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                let kind = if e.kind() == io::ErrorKind::AlreadyExists {
                    ErrorKind::AlreadyExists
                } else if e.raw_os_error() == Some(libc::ENOSPC) {
                    ErrorKind::ResourceExhausted
                } else {
                    ErrorKind::Unknown
                };
                err!(Unknown, msg("unable to create segment {}", path.display()), source(e))
                    .map_kind(kind)
            })?;
        Ok(f)
    }

    /// `fsync`s the directory containing `path`, making a just-written file's
    /// directory entry durable.
    pub fn sync_parent(&self, path: &Path) -> Result<(), Error> {
        let parent = path
            .parent()
            .ok_or_else(|| err!(InvalidArgument, msg("segment path {} has no parent", path.display())))?;
        let d = fs::File::open(parent)?;
        d.sync_all()?;
        Ok(())
    }

    /// Deletes the file at `path`. A missing file is not an error: returns
    /// `Ok(false)` so reconciliation passes can treat it as already done.
    pub fn unlink(&self, path: &Path) -> Result<bool, Error> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(err!(Unknown, msg("unable to delete {}", path.display()), source(e))),
        }
    }

    /// Sums the sizes of regular files under the stream's subtree. Preferred
    /// over catalog totals for quota decisions so manual deletions and
    /// crash-truncated files self-heal.
    pub fn stream_usage(&self, stream_name: &str) -> Result<i64, Error> {
        fn walk(dir: &Path, total: &mut i64) -> io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let md = entry.metadata()?;
                if md.is_dir() {
                    walk(&entry.path(), total)?;
                } else if md.is_file() {
                    *total += i64::try_from(md.len()).unwrap_or(i64::MAX);
                }
            }
            Ok(())
        }
        let mut total = 0;
        let root = self.stream_root(stream_name);
        match walk(&root, &mut total) {
            Ok(()) => Ok(total),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(err!(Unknown, msg("unable to walk {}", root.display()), source(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn segment_path_layout() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let dir = ArchiveDir::open(tmp.path(), true).unwrap();
        // 2015-04-25 12:34:56 UTC.
        let p = dir.segment_path("front", Time(1_429_965_296), "scheduled");
        assert_eq!(
            p,
            tmp.path().join("front/2015/04/25/123456-scheduled.mp4")
        );
    }

    #[test]
    fn create_segment_makes_parents_and_rejects_duplicates() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let dir = ArchiveDir::open(tmp.path(), true).unwrap();
        let p = dir.segment_path("front", Time(1_429_965_296), "manual");
        drop(dir.create_segment(&p).unwrap());
        assert!(p.exists());
        let e = dir.create_segment(&p).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn unlink_tolerates_missing() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let dir = ArchiveDir::open(tmp.path(), true).unwrap();
        let p = tmp.path().join("front/nope.mp4");
        assert!(!dir.unlink(&p).unwrap());
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, b"x").unwrap();
        assert!(dir.unlink(&p).unwrap());
    }

    #[test]
    fn stream_usage_sums_files() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let dir = ArchiveDir::open(tmp.path(), true).unwrap();
        assert_eq!(dir.stream_usage("front").unwrap(), 0);
        let day = tmp.path().join("front/2015/04/25");
        std::fs::create_dir_all(&day).unwrap();
        std::fs::write(day.join("a.mp4"), vec![0u8; 100]).unwrap();
        std::fs::write(day.join("b.mp4"), vec![0u8; 50]).unwrap();
        assert_eq!(dir.stream_usage("front").unwrap(), 150);
    }

    #[test]
    fn open_rejects_unwritable_root() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let ro = tmp.path().join("ro");
        std::fs::create_dir(&ro).unwrap();
        std::fs::set_permissions(&ro, std::fs::Permissions::from_mode(0o555)).unwrap();
        // Skip when running as root, which ignores permission bits.
        if unsafe { libc::geteuid() } != 0 {
            let e = ArchiveDir::open(&ro, false).unwrap_err();
            assert_eq!(e.kind(), ErrorKind::PermissionDenied);
        }
    }
}
