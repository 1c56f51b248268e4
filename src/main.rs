// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{Error, ErrorKind};
use bpaf::Bpaf;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod audio;
mod cmds;
mod config;
mod export;
mod gc;
mod h264;
mod manager;
mod mp4;
mod stream;
mod streamer;
mod writer;

/// Nightjar NVR: security camera network video recorder.
#[derive(Bpaf, Debug)]
#[bpaf(options, version)]
enum Args {
    // See docstrings of `cmds::*::Args` structs for a description of the
    // respective subcommands.
    Check(#[bpaf(external(cmds::check::args))] cmds::check::Args),
    Export(#[bpaf(external(cmds::export::args))] cmds::export::Args),
    Init(#[bpaf(external(cmds::init::args))] cmds::init::Args),
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Check(a) => cmds::check::run(a),
            Args::Export(a) => cmds::export::run(a),
            Args::Init(a) => cmds::init::run(a),
            Args::Run(a) => cmds::run::run(a),
        }
    }
}

/// Maps a failure to the documented exit statuses: 1 for configuration
/// problems, 2 when the catalog is unreachable, 3 when the storage root is
/// unusable.
fn exit_code(e: &Error) -> i32 {
    match e.kind() {
        ErrorKind::Unavailable => 2,
        ErrorKind::PermissionDenied => 3,
        _ => 1,
    }
}

fn main() {
    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked as
    // `target/debug/nightjar-nvr`: `nightjar-nvr`), falling back to the crate
    // name if conversion to a path/UTF-8 string fails.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(exit_code(&e));
        }
        Ok(rv) => {
            debug!("exiting with status {rv}");
            std::process::exit(rv)
        }
    }
}
