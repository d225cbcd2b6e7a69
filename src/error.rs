//! Defines the error type for the virtual machine monitor.

use std::error::Error as StdError;
use std::fmt;
use std::result::Result as StdResult;

/// Failure categories the migration core distinguishes. The origin of a
/// failure does not matter for recovery, only its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorKind {
    /// A stream read/write/accept/connect failed or came up short.
    Transport,
    /// A received record did not carry the magic expected at its position.
    Desync,
    /// The peer rejected our configuration, or no device accepted a record.
    ConfigMismatch,
    /// An allocation needed for the session could not be satisfied.
    Exhausted,
    InvalidParam,
    NotFound,
}

type DynError = dyn StdError + Send + Sync;

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    phase: Option<&'static str>,
    inner: Option<Box<DynError>>,
}

pub type Result<T> = StdResult<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> StdResult<(), fmt::Error> {
        match self.phase {
            Some(phase) => write!(f, "{:?} failure in phase `{}`", self.kind, phase)?,
            None => write!(f, "{:?} failure", self.kind)?,
        }
        if let Some(inner) = &self.inner {
            write!(f, ": {}", inner)?;
        }
        Ok(())
    }
}

impl Error {
    pub fn new(kind: ErrorKind, inner: Box<DynError>) -> Self {
        Self {
            kind,
            phase: None,
            inner: Some(inner),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Migration phase the error surfaced in (`negotiate`, `header`,
    /// `memory`, `devices`, `tsc`, `close`).
    pub fn phase(&self) -> Option<&'static str> {
        self.phase
    }

    pub fn in_phase(mut self, phase: &'static str) -> Self {
        if self.phase.is_none() {
            self.phase = Some(phase);
        }
        self
    }

    pub fn into_inner(self) -> Option<Box<DynError>> {
        self.inner
    }
}

impl ErrorKind {
    pub fn wrap(self, inner: Box<DynError>) -> Error {
        Error::new(self, inner)
    }

    pub fn msg(self, text: &'static str) -> Error {
        Error::new(self, text.into())
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            phase: None,
            inner: None,
        }
    }
}

impl<T> From<ErrorKind> for Result<T> {
    fn from(val: ErrorKind) -> Self {
        Err(val.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        ErrorKind::Transport.wrap(Box::new(e))
    }
}
