// Copyright 2015-2018 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error types for the crate

use std::time::Duration;
use std::{fmt, io};

use hickory_proto::op::Message;
use hickory_proto::ProtoError;
use http::StatusCode;
use thiserror::Error;

/// An alias for results returned by functions of this crate
pub type Result<T> = ::std::result::Result<T, Error>;

/// The error kind for errors that get returned in the crate
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The upstream URL could not be parsed or has an unsupported shape
    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),

    /// None of the configured ALPN tokens selects a usable TCP-based HTTP version
    #[error("HTTP/1.1 and HTTP/2 are not supported by this upstream")]
    NoSupportedHttpVersion,

    /// HTTP/3 was not part of the configured versions
    #[error("HTTP/3 support is not enabled")]
    H3NotEnabled,

    /// Probe sentinel: the TLS handshake finished before the QUIC handshake
    #[error("TLS was faster than QUIC, prefer it")]
    TlsFaster,

    /// The bootstrap dial handler failed to open a connection
    #[error("bootstrapping {addr}: {source}")]
    Bootstrap {
        /// Redacted address of the upstream
        addr: String,
        /// The underlying dial error
        source: io::Error,
    },

    /// An underlying I/O error
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A wait or an exchange exceeded the configured deadline
    #[error("timeout exceeded: {elapsed:?}")]
    Timeout {
        /// How long the operation ran before it was given up on
        elapsed: Duration,
    },

    /// The QUIC endpoint rejected the connection attempt up front
    #[error("opening quic connection: {0}")]
    QuicConnect(#[from] quinn::ConnectError),

    /// The QUIC connection failed during or after the handshake
    #[error("quic connection: {0}")]
    QuicConnection(#[from] quinn::ConnectionError),

    /// The server rejected 0-RTT data; the stored session is stale
    #[error("quic 0-RTT rejected by the server")]
    ZeroRttRejected,

    /// An HTTP/2 protocol error
    #[error("h2: {0}")]
    H2(#[from] h2::Error),

    /// An HTTP/3 connection-level error
    #[error("h3 connection: {0}")]
    H3Connection(#[from] h3::error::ConnectionError),

    /// An HTTP/3 stream-level error
    #[error("h3 stream: {0}")]
    H3Stream(#[from] h3::error::StreamError),

    /// The DNS query could not be serialized
    #[error("packing message: {0}")]
    Pack(#[source] ProtoError),

    /// The response body is not a valid DNS message
    #[error("unpacking response from {addr}: {source}")]
    Unpack {
        /// Redacted address of the upstream
        addr: String,
        /// The decode failure
        source: ProtoError,
    },

    /// The HTTP request could not be constructed
    #[error("creating http request to {addr}: {source}")]
    Request {
        /// Redacted address of the upstream
        addr: String,
        /// The request-build failure
        source: http::Error,
    },

    /// The server answered with a non-200 status
    #[error("expected status 200, got {status} from {addr}")]
    BadStatus {
        /// The status the server returned
        status: StatusCode,
        /// Redacted address of the upstream
        addr: String,
    },

    /// The response id does not match the request id; the parsed response
    /// rides along for callers that want it anyway
    #[error("response id {found} does not match request id {expected}")]
    IdMismatch {
        /// The id the request carried on the wire
        expected: u16,
        /// The id the response carried
        found: u16,
        /// The response that failed the check
        response: Box<Message>,
    },

    /// The upstream has been closed
    #[error("upstream is closed")]
    Closed,

    /// An error with an arbitrary message, referenced as &'static str
    #[error("{0}")]
    Message(&'static str),

    /// An error with an arbitrary message, stored as String
    #[error("{0}")]
    Msg(String),
}

/// The error type for errors that get returned in the crate
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    /// A failure that happened while cleaning up after `kind`, kept so
    /// operators can see both
    deferred: Option<Box<Error>>,
}

impl Error {
    /// Get the kind of the error
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Attaches a cleanup failure to this error without replacing it.
    pub(crate) fn with_deferred(mut self, deferred: Option<Error>) -> Self {
        self.deferred = deferred.map(Box::new);
        self
    }

    /// True for failures that a fresh client is likely to get past: I/O or
    /// exchange timeouts, QUIC handshake/idle timeouts, and a rejected
    /// 0-RTT attempt.
    pub fn is_transient(&self) -> bool {
        match &self.kind {
            ErrorKind::Timeout { .. } | ErrorKind::ZeroRttRejected => true,
            ErrorKind::Io(err) => err.kind() == io::ErrorKind::TimedOut,
            ErrorKind::Bootstrap { source, .. } => source.kind() == io::ErrorKind::TimedOut,
            ErrorKind::QuicConnection(err) => matches!(err, quinn::ConnectionError::TimedOut),
            _ => false,
        }
    }

    pub(crate) fn is_zero_rtt_rejected(&self) -> bool {
        matches!(self.kind, ErrorKind::ZeroRttRejected)
    }

    /// Rewrites the caller's id back onto an id-mismatch error so the
    /// response it carries matches what the caller sent.
    pub(crate) fn restore_id(mut self, id: u16) -> Self {
        if let ErrorKind::IdMismatch {
            expected, response, ..
        } = &mut self.kind
        {
            *expected = id;
            response.set_id(id);
        }
        self
    }

    /// For [`ErrorKind::IdMismatch`], takes the parsed response out of the
    /// error; `None` for every other kind.
    pub fn into_response(self) -> Option<Message> {
        match self.kind {
            ErrorKind::IdMismatch { response, .. } => Some(*response),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.deferred {
            Some(deferred) => write!(f, "{}; deferred: {deferred}", self.kind),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            deferred: None,
        }
    }
}

impl From<&'static str> for Error {
    fn from(msg: &'static str) -> Self {
        ErrorKind::Message(msg).into()
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        ErrorKind::Msg(msg).into()
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        ErrorKind::from(err).into()
    }
}

impl From<quinn::ConnectError> for Error {
    fn from(err: quinn::ConnectError) -> Self {
        ErrorKind::from(err).into()
    }
}

impl From<quinn::ConnectionError> for Error {
    fn from(err: quinn::ConnectionError) -> Self {
        ErrorKind::from(err).into()
    }
}

impl From<h2::Error> for Error {
    fn from(err: h2::Error) -> Self {
        ErrorKind::from(err).into()
    }
}

impl From<h3::error::ConnectionError> for Error {
    fn from(err: h3::error::ConnectionError) -> Self {
        ErrorKind::from(err).into()
    }
}

impl From<h3::error::StreamError> for Error {
    fn from(err: h3::error::StreamError) -> Self {
        ErrorKind::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_transient() {
        let err = Error::from(ErrorKind::Timeout {
            elapsed: Duration::from_secs(5),
        });
        assert!(err.is_transient());

        let err = Error::from(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(err.is_transient());

        let err = Error::from(ErrorKind::QuicConnection(quinn::ConnectionError::TimedOut));
        assert!(err.is_transient());

        let err = Error::from(ErrorKind::ZeroRttRejected);
        assert!(err.is_transient());
    }

    #[test]
    fn test_terminal_errors_are_not_transient() {
        let err = Error::from(ErrorKind::BadStatus {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            addr: "https://dns.example/dns-query".into(),
        });
        assert!(!err.is_transient());

        let err = Error::from(ErrorKind::Closed);
        assert!(!err.is_transient());

        let err = Error::from(io::Error::new(io::ErrorKind::ConnectionRefused, "nope"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_deferred_errors_keep_both_messages() {
        let err = Error::from(ErrorKind::BadStatus {
            status: StatusCode::BAD_GATEWAY,
            addr: "https://dns.example/dns-query".into(),
        })
        .with_deferred(Some(Error::from(ErrorKind::Closed)));

        let rendered = err.to_string();
        assert!(rendered.contains("502"));
        assert!(rendered.contains("deferred"));
        assert!(rendered.contains("closed"));
    }
}
