// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the node runtime.
//!
//! Every failure carries a primary [`ErrorKind`] plus an optional chain of
//! underlying errors. The chain is what gets rendered for diagnostics: a
//! failed `requestTopic` may read
//! `Transport: connect to 10.0.0.7:42111 refused: caused by: Timeout: ...`.

use std::fmt;
use std::io;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, RosError>;

/// Primary failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection refused, reset, or peer closed mid-frame.
    Transport,

    /// A deadline elapsed before the operation completed.
    Timeout,

    /// TCPROS handshake header invalid (missing field, md5/type mismatch).
    ProtocolHeader,

    /// TCPROS frame invalid (truncated, length exceeds limit).
    ProtocolFrame,

    /// XMLRPC envelope malformed, unsupported type, or fault response.
    XmlrpcCodec,

    /// Registry failure (slot exhausted, duplicate registration).
    Registry,

    /// API misuse (destroyed node, invalid slot index).
    Usage,

    /// Operation abandoned by shutdown before completion.
    Cancelled,

    /// The remote service handler reported an application error.
    ServiceFailed,
}

impl ErrorKind {
    /// Stable short name, used in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "Transport",
            Self::Timeout => "Timeout",
            Self::ProtocolHeader => "ProtocolHeader",
            Self::ProtocolFrame => "ProtocolFrame",
            Self::XmlrpcCodec => "XmlrpcCodec",
            Self::Registry => "Registry",
            Self::Usage => "Usage",
            Self::Cancelled => "Cancelled",
            Self::ServiceFailed => "ServiceFailed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error pack: primary kind, human detail, optional cause chain.
#[derive(Debug)]
pub struct RosError {
    kind: ErrorKind,
    detail: String,
    cause: Option<Box<RosError>>,
}

impl RosError {
    /// Create an error with a primary kind and detail text.
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            cause: None,
        }
    }

    /// Attach an underlying error to the chain.
    pub fn with_cause(mut self, cause: RosError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Primary failure kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Detail text for the primary kind.
    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Underlying error, if any.
    pub fn cause(&self) -> Option<&RosError> {
        self.cause.as_deref()
    }

    /// Shorthand constructors for the common kinds.
    pub fn transport(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, detail)
    }

    pub fn protocol_header(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolHeader, detail)
    }

    pub fn protocol_frame(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolFrame, detail)
    }

    pub fn xmlrpc(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::XmlrpcCodec, detail)
    }

    pub fn registry(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Registry, detail)
    }

    pub fn usage(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Usage, detail)
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, detail)
    }

    pub fn service_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceFailed, detail)
    }

    /// Classify an I/O error from a socket operation.
    pub fn from_io(e: io::Error, what: &str) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Transport,
        };
        Self::new(kind, format!("{}: {}", what, e))
    }
}

impl fmt::Display for RosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)?;
        let mut next = self.cause.as_deref();
        while let Some(err) = next {
            write!(f, ": caused by: {}: {}", err.kind, err.detail)?;
            next = err.cause.as_deref();
        }
        Ok(())
    }
}

impl std::error::Error for RosError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c.as_ref() as _)
    }
}
