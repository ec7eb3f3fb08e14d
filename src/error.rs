//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Top-level error types for Meridian RPC.
//!
//! Errors are layered the same way the framework is:
//!
//! 1. **Framing**: malformed frames ([`ProtocolError`]) tear the connection
//!    down.
//! 2. **Codec**: payload encode/decode failures ([`CodecError`]) fail the
//!    call that produced them.
//! 3. **Service**: errors raised by the remote handler travel back in
//!    response metadata and surface as [`Error::Service`]. Failure-handling
//!    policies never retry them.
//! 4. **Transport and lifecycle**: everything that invalidates a connection
//!    or a client ([`Error::Shutdown`], [`Error::UnexpectedEof`], I/O).
//!
//! [`ProtocolError`]: crate::protocol::ProtocolError
//! [`CodecError`]: crate::codec::CodecError

use crate::codec::CodecError;
use crate::protocol::ProtocolError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Unified error type for client and server operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection was closed by a local `close` call.
    #[error("connection is shut down")]
    Shutdown,

    /// The connection ended mid-stream without a local close.
    #[error("unexpected EOF")]
    UnexpectedEof,

    /// The wire advertised a serializer id with no registered codec.
    #[error("codec {0} is unsupported")]
    UnsupportedCodec(u8),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A payload could not be serialized or deserialized.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// An error raised on the server side, carried back in response
    /// metadata under the sentinel key. Never retried by fail-over
    /// policies.
    #[error("{0}")]
    Service(String),

    /// The circuit breaker is open and rejected the call outright.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The half-open circuit breaker is already probing at capacity.
    #[error("too many requests")]
    TooManyRequests,

    /// The call's deadline elapsed before a response arrived.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The selector produced no usable target.
    #[error("no server available")]
    NoServer,

    /// The `XClient` was closed before or during the call.
    #[error("xclient is shut down")]
    XClientShutdown,

    /// The server's accept loop stopped because the server was closed.
    #[error("server closed")]
    ServerClosed,

    /// The requested listener or dial network is not supported.
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// Service registration was rejected.
    #[error("registration: {0}")]
    Registration(String),

    /// An underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Several independent failures, e.g. from closing a set of cached
    /// clients or from a registration hook pipeline.
    #[error(transparent)]
    Multi(#[from] MultiError),
}

impl Error {
    /// Returns `true` if this error originated inside the remote handler.
    ///
    /// Service errors are definitive outcomes: retrying the same call would
    /// deterministically fail again, so fail-over policies skip them.
    #[must_use]
    pub const fn is_service_error(&self) -> bool {
        matches!(self, Self::Service(_))
    }

    /// Returns `true` if the error invalidates the connection it occurred
    /// on, meaning a cached client should be evicted.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Shutdown | Self::UnexpectedEof | Self::Io(_) | Self::Protocol(_)
        )
    }
}

/// A collection of independent errors reported as one.
#[derive(Debug, Default)]
pub struct MultiError {
    /// The collected errors, in the order they were observed.
    pub errors: Vec<Error>,
}

impl MultiError {
    /// Creates a multi-error from the given list.
    #[must_use]
    pub fn new(errors: Vec<Error>) -> Self {
        Self { errors }
    }

    /// Adds another error to the collection.
    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    /// Returns `true` if at least one error was collected.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "no errors");
        }
        write!(f, "{} errors:", self.errors.len())?;
        for err in &self.errors {
            write!(f, " [{}]", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
