// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// In addition, as a special exception, the copyright holders give
// permission to link the code of portions of this program with the
// OpenSSL library under certain conditions as described in each
// individual source file, and distribute linked combinations including
// the two.
//
// You must obey the GNU General Public License in all respects for all
// of the code used other than OpenSSL. If you modify file(s) with this
// exception, you may extend this exception to your version of the
// file(s), but you are not obligated to do so. If you do not wish to do
// so, delete this exception statement from your version. If you delete
// this exception statement from all source files in the program, then
// also delete it here.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Tagged errors: every `Error` carries an [`ErrorKind`] alongside the usual
//! source chain, so callers can match on category without parsing messages.

use std::fmt;
use std::sync::Arc;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/0e00c430827e81d61e1e7164ef04ca21ccbfaa77/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link for descriptions of
/// each error.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
#[rustfmt::skip]
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
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        })
    }
}

struct Inner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

/// A tagged, chainable error.
///
/// Construct via the [`err!`] and [`bail!`] macros rather than directly;
/// they fill in `msg`/`source` positionally so call sites stay terse.
#[derive(Clone)]
pub struct Error(Arc<Inner>);

impl Error {
    pub fn new(
        kind: ErrorKind,
        msg: Option<String>,
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error(Arc::new(Inner { kind, msg, source }))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn wrap<E: Into<Error>>(kind: ErrorKind, e: E) -> Self {
        let e = e.into();
        Error::new(kind, None, Some(Arc::new(e)))
    }

    /// Returns a display wrapper that prints the full cause chain, one `caused by:` per line.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.0.kind, self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.0.msg, &self.0.source) {
            (Some(m), _) => write!(f, "{}", m),
            (None, Some(s)) => write!(f, "{}", s),
            (None, None) => write!(f, "{}", self.0.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0
            .source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.0.kind(), self.0)?;
        let mut cur: Option<&(dyn std::error::Error + 'static)> =
            std::error::Error::source(self.0);
        while let Some(e) = cur {
            write!(f, "\ncaused by: {}", e)?;
            cur = e.source();
        }
        Ok(())
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error::new(kind, None, None)
    }
}

/// Extension methods for `Result`, letting any std error be tagged with a kind.
pub trait ResultExt<T> {
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k, None, Some(Arc::new(e))))
    }
}

/// Builds an [`Error`] of the given kind.
///
/// ```ignore
/// err!(NotFound, msg("camera {} not found", id))
/// err!(Internal, source(e))
/// err!(Internal, msg("while opening {}", path), source(e))
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident, msg($($arg:tt)+), source($src:expr)) => {
        $crate::Error::new(
            $crate::ErrorKind::$kind,
            Some(format!($($arg)+)),
            Some(::std::sync::Arc::new($src)),
        )
    };
    ($kind:ident, msg($($arg:tt)+)) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($arg)+)), None)
    };
    ($kind:ident, source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, Some(::std::sync::Arc::new($src)))
    };
}

/// Like [`err!`], but returns immediately.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)+) => {
        return Err($crate::err!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_msg() {
        let e: Error = err!(NotFound, msg("camera {} not found", "foo"));
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.to_string(), "camera foo not found");
    }

    #[test]
    fn chain_includes_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e: Error = err!(Internal, msg("flush failed"), source(io_err));
        let chained = e.chain().to_string();
        assert!(chained.contains("flush failed"));
        assert!(chained.contains("disk full"));
    }
}
