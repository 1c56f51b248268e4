// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Classified errors with a cause chain.
//!
//! Construction goes through the [`err!`](crate::err) and
//! [`bail!`](crate::bail) macros, which take an [`ErrorKind`] variant name
//! followed by optional `msg(...)` and `source(...)` parts:
//!
//! ```
//! use nightjar_base::{bail, err, Error, ErrorKind};
//! fn check(name: &str) -> Result<(), Error> {
//!     if name.is_empty() {
//!         bail!(InvalidArgument, msg("empty stream name"));
//!     }
//!     Ok(())
//! }
//! let e = check("").unwrap_err();
//! assert_eq!(e.kind(), ErrorKind::InvalidArgument);
//! assert_eq!(e.chain().to_string(), "InvalidArgument: empty stream name");
//! ```

use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// a nice general-purpose classification of errors.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug)]
struct Inner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<BoxedError>,
}

/// An error with a classification, an optional message, and an optional cause.
#[derive(Debug)]
pub struct Error(Box<Inner>);

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error(Box::new(Inner {
            kind,
            msg: None,
            source: None,
        }))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /// Returns the message set via `msg(...)`, if any.
    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns a `Display` impl which writes the full cause chain,
    /// `kind: msg: cause: cause`.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }

    /// Replaces the kind, keeping message and cause.
    pub fn map_kind(mut self, kind: ErrorKind) -> Self {
        self.0.kind = kind;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.0.msg.as_deref(), self.0.source.as_deref()) {
            (Some(m), _) => write!(f, "{}: {m}", self.0.kind),
            (None, Some(s)) => write!(f, "{}: {s}", self.0.kind),
            (None, None) => write!(f, "{}", self.0.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// See [`Error::chain`].
pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.0.kind)?;
        if let Some(m) = self.0.0.msg.as_deref() {
            write!(f, ": {m}")?;
        }
        let mut cur: Option<&(dyn std::error::Error + 'static)> =
            self.0.0.source.as_ref().map(|s| s.as_ref() as _);
        while let Some(e) = cur {
            write!(f, ": {e}")?;
            cur = e.source();
        }
        Ok(())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match e.kind() {
            IoKind::NotFound => ErrorKind::NotFound,
            IoKind::PermissionDenied => ErrorKind::PermissionDenied,
            IoKind::AlreadyExists => ErrorKind::AlreadyExists,
            IoKind::TimedOut | IoKind::WouldBlock => ErrorKind::DeadlineExceeded,
            IoKind::InvalidInput | IoKind::InvalidData => ErrorKind::InvalidArgument,
            IoKind::UnexpectedEof => ErrorKind::DataLoss,
            _ => ErrorKind::Unknown,
        };
        let mut b = Error::new(kind);
        b.0.source = Some(Box::new(e));
        b
    }
}

/// A part accepted by [`err!`](crate::err): either `msg(...)` or `source(...)`.
/// Not implemented outside this crate.
pub trait ErrorBuilder {
    fn apply(self, e: Error) -> Error;
}

#[doc(hidden)]
pub struct MsgPart(pub String);

impl ErrorBuilder for MsgPart {
    fn apply(self, mut e: Error) -> Error {
        e.0.msg = Some(self.0);
        e
    }
}

#[doc(hidden)]
pub struct SourcePart(pub BoxedError);

impl ErrorBuilder for SourcePart {
    fn apply(self, mut e: Error) -> Error {
        e.0.source = Some(self.0);
        e
    }
}

/// Constructs an [`Error`] from an [`ErrorKind`] variant name and optional
/// `msg(...)`/`source(...)` parts.
#[macro_export]
macro_rules! err {
    ($kind:ident) => { $crate::Error::new($crate::ErrorKind::$kind) };
    ($kind:ident, msg($($msg:tt)*) $(,)?) => {
        $crate::ErrorBuilder::apply(
            $crate::MsgPart(format!($($msg)*)),
            $crate::Error::new($crate::ErrorKind::$kind),
        )
    };
    ($kind:ident, source($src:expr) $(,)?) => {
        $crate::ErrorBuilder::apply(
            $crate::SourcePart(Box::new($src)),
            $crate::Error::new($crate::ErrorKind::$kind),
        )
    };
    ($kind:ident, msg($($msg:tt)*), source($src:expr) $(,)?) => {
        $crate::ErrorBuilder::apply(
            $crate::SourcePart(Box::new($src)),
            $crate::ErrorBuilder::apply(
                $crate::MsgPart(format!($($msg)*)),
                $crate::Error::new($crate::ErrorKind::$kind),
            ),
        )
    };
    ($kind:ident, source($src:expr), msg($($msg:tt)*) $(,)?) => {
        $crate::err!($kind, msg($($msg)*), source($src))
    };
}

/// Returns an [`Error`] built as by [`err!`](crate::err).
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => { return Err($crate::err!($($t)*).into()) };
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, keeping it as the cause.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BoxedError>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| {
            let mut err = Error::new(k);
            err.0.source = Some(e.into());
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as nightjar_base;

    #[test]
    fn chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let e = nightjar_base::err!(Unavailable, msg("write failed"), source(io));
        assert_eq!(e.kind(), ErrorKind::Unavailable);
        assert_eq!(e.chain().to_string(), "Unavailable: write failed: disk on fire");
    }

    #[test]
    fn io_error_kind_mapping() {
        let e: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        let e: Error = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert_eq!(e.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn err_kind_annotates() {
        let r: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "nope"));
        let e = r.err_kind(ErrorKind::Internal).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Internal);
        assert_eq!(e.chain().to_string(), "Internal: nope");
    }
}
