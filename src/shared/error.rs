// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Typed errors shared by all subsystems.
//!
//! Every error carries an [`ErrorKind`] tag which callers inspect to decide
//! how to react (reject a credential, log at debug, map to an exit code, ...).
//! The tag survives wrapping: [`Error::wrap`] keeps the kind of the inner error
//! unless a new one is given explicitly.
//!
//! # Exit codes
//!
//! When a task on an SSH channel fails, the error is mapped to an exit code
//! with [`exit_code_of`]:
//!
//! | Condition | Code |
//! |---|---|
//! | cancelled | [`EXIT_CODE_CANCELLED`] (61) |
//! | [`ErrorKind::User`] | [`EXIT_CODE_USER`] (62) |
//! | anything else | [`EXIT_CODE_SYSTEM`] (63) |

use std::fmt;
use std::io;

/// Exit code reported when the task was cancelled.
pub const EXIT_CODE_CANCELLED: i32 = 61;

/// Exit code reported for user-classified failures.
pub const EXIT_CODE_USER: i32 = 62;

/// Exit code reported for system-classified failures.
pub const EXIT_CODE_SYSTEM: i32 = 63;

/// Classification tag of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorKind {
    #[default]
    Unknown,
    /// Bad credentials or user cancellation.
    User,
    /// Policy forbids the action.
    Permission,
    /// Malformed configuration or input.
    Config,
    /// Reachability or timeouts towards an identity provider or daemon.
    Network,
    /// Filesystem or daemon internals.
    System,
    /// The session or one of its resources was invalidated.
    Expired,
    /// The requested record does not exist.
    NotFound,
}

impl ErrorKind {
    /// Create a new error of this kind.
    pub fn error(self, message: impl Into<String>) -> Error {
        Error::new(self, message)
    }

    /// Returns `true` if `err` (or anything in its chain) is an [`Error`] of this kind.
    pub fn is(self, err: &(dyn std::error::Error + 'static)) -> bool {
        kind_of(err) == Some(self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unknown => "unknown",
            ErrorKind::User => "user",
            ErrorKind::Permission => "permission",
            ErrorKind::Config => "config",
            ErrorKind::Network => "network",
            ErrorKind::System => "system",
            ErrorKind::Expired => "expired",
            ErrorKind::NotFound => "not-found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An error tagged with an [`ErrorKind`].
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    /// Message may be shown verbatim to the SSH client.
    user_facing: bool,
    #[source]
    source: Option<BoxError>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            user_facing: false,
            source: None,
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::User, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message)
    }

    pub fn expired(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Expired, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Wrap `source` with a message.
    ///
    /// The kind is inherited from `source` if it is (or wraps) an [`Error`],
    /// otherwise `fallback` is used.
    pub fn wrap<E>(fallback: ErrorKind, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let kind = kind_of(&source).unwrap_or(fallback);
        let message = format!("{}: {}", message.into(), source);
        Self {
            kind,
            message,
            user_facing: false,
            source: Some(Box::new(source)),
        }
    }

    /// Attach a source without changing kind or message.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Mark the message as safe to present to the client.
    pub fn user_facing(mut self) -> Self {
        self.user_facing = true;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_user_facing(&self) -> bool {
        self.user_facing
    }

    /// Prefix the message, keeping kind and source.
    pub fn context(mut self, prefix: impl fmt::Display) -> Self {
        self.message = format!("{prefix}: {}", self.message);
        self
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => ErrorKind::Network,
            _ => ErrorKind::System,
        };
        Self {
            kind,
            message: err.to_string(),
            user_facing: false,
            source: Some(Box::new(err)),
        }
    }
}

/// Result alias used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Find the first [`ErrorKind`] in the source chain of `err`.
pub fn kind_of(err: &(dyn std::error::Error + 'static)) -> Option<ErrorKind> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(typed) = e.downcast_ref::<Error>() {
            return Some(typed.kind);
        }
        current = e.source();
    }
    None
}

/// Find the first [`ErrorKind`] in an [`anyhow::Error`] chain.
pub fn kind_of_anyhow(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain().find_map(|e| e.downcast_ref::<Error>().map(Error::kind))
}

/// Errors which are expected during normal teardown and must not be escalated.
///
/// EOF on a drained channel, EIO on a closed PTY, resets and broken pipes from
/// a client that went away.
pub fn is_silent(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if is_silent_io(io_err) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// Same as [`is_silent`] for an [`anyhow::Error`] chain.
pub fn is_silent_anyhow(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        e.downcast_ref::<io::Error>().is_some_and(is_silent_io)
    })
}

fn is_silent_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    ) || err.raw_os_error() == Some(libc::EIO)
}

/// Map the outcome of a channel task to the exit code reported to the client.
///
/// `code` is the child's own code; negative values are internal sentinels
/// (`-1` failure, `-2` cancelled) and are replaced based on `err`.
pub fn exit_code_of(code: i32, err: Option<&Error>, cancelled: bool) -> i32 {
    if code >= 0 {
        return code;
    }
    if cancelled || code == -2 {
        return EXIT_CODE_CANCELLED;
    }
    match err.map(Error::kind) {
        Some(ErrorKind::User) => EXIT_CODE_USER,
        _ => EXIT_CODE_SYSTEM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_inherits_kind() {
        let inner = Error::user("bad password");
        let outer = Error::wrap(ErrorKind::System, "cannot authorize", inner);
        assert_eq!(outer.kind(), ErrorKind::User);
        assert_eq!(outer.to_string(), "cannot authorize: bad password");
    }

    #[test]
    fn test_wrap_uses_fallback_for_foreign_errors() {
        let inner = io::Error::new(io::ErrorKind::Other, "boom");
        let outer = Error::wrap(ErrorKind::System, "cannot write", inner);
        assert_eq!(outer.kind(), ErrorKind::System);
    }

    #[test]
    fn test_kind_of_anyhow_chain() {
        let err = anyhow::Error::new(Error::expired("session gone")).context("while restoring");
        assert_eq!(kind_of_anyhow(&err), Some(ErrorKind::Expired));
        assert!(ErrorKind::Expired.is(err.root_cause()));
    }

    #[test]
    fn test_silent_errors() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(is_silent(&eof));

        let eio = io::Error::from_raw_os_error(libc::EIO);
        assert!(is_silent(&eio));

        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(!is_silent(&other));
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code_of(0, None, false), 0);
        assert_eq!(exit_code_of(17, Some(&Error::system("x")), false), 17);
        assert_eq!(exit_code_of(-1, None, true), EXIT_CODE_CANCELLED);
        assert_eq!(exit_code_of(-2, None, false), EXIT_CODE_CANCELLED);
        assert_eq!(exit_code_of(-1, Some(&Error::user("x")), false), EXIT_CODE_USER);
        assert_eq!(exit_code_of(-1, Some(&Error::system("x")), false), EXIT_CODE_SYSTEM);
        assert_eq!(exit_code_of(-1, None, false), EXIT_CODE_SYSTEM);
    }
}
