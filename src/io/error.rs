//! Error types for the I/O resilience wrappers.

use std::fmt;
use std::io;

use serde::Serialize;
use thiserror::Error;

/// Classification attached to every intercepted I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    /// Recoverable: connection reset, broken pipe, unexpected end of stream,
    /// descriptor fault. Absorbed locally with an empty or zero result.
    Transient,

    /// Outside the anticipated set. Re-raised unchanged.
    Unexpected,

    /// A write-mode open failed under conditions recoverable for reads.
    /// Always re-raised so data loss is never silent.
    WriteFault,
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Unexpected => write!(f, "unexpected"),
            Self::WriteFault => write!(f, "write fault"),
        }
    }
}

/// A classified file or socket error that propagates to the caller.
#[derive(Debug, Error)]
#[error("{operation} {target} failed ({class}): {source}")]
pub struct IoFault {
    /// How the fault was classified.
    pub class: FaultClass,
    /// The intercepted operation, e.g. `open`.
    pub operation: &'static str,
    /// Path or peer the operation targeted.
    pub target: String,
    /// The original error.
    #[source]
    pub source: io::Error,
}

impl IoFault {
    pub(crate) fn new(
        class: FaultClass,
        operation: &'static str,
        target: impl Into<String>,
        source: io::Error,
    ) -> Self {
        Self {
            class,
            operation,
            target: target.into(),
            source,
        }
    }

    /// The `io::ErrorKind` of the original error.
    #[must_use]
    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

impl From<IoFault> for io::Error {
    fn from(fault: IoFault) -> Self {
        fault.source
    }
}

/// Errors raised by the URL-fetch primitive. Always re-raised.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The URL could not be parsed or has no host.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
    },

    /// The HTTP client could not be constructed.
    #[error("could not build HTTP client: {source}")]
    Client {
        /// The builder error.
        #[source]
        source: reqwest::Error,
    },

    /// Connection-level failure (DNS, refused, reset, TLS, truncated body).
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL being fetched.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Connect or read timeout elapsed.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL being fetched.
        url: String,
    },

    /// The server answered with a non-success status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL being fetched.
        url: String,
        /// The status code.
        status: u16,
    },
}

impl FetchError {
    pub(crate) fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Classification of this error.
    ///
    /// Connection-level failures and timeouts are the stream faults the
    /// other wrappers absorb; here they are only classified, never absorbed.
    #[must_use]
    pub fn class(&self) -> FaultClass {
        match self {
            Self::Timeout { .. } => FaultClass::Transient,
            Self::Network { source, .. } if source.is_connect() || source.is_body() => {
                FaultClass::Transient
            }
            Self::Network { .. }
            | Self::InvalidUrl { .. }
            | Self::Client { .. }
            | Self::HttpStatus { .. } => FaultClass::Unexpected,
        }
    }
}
