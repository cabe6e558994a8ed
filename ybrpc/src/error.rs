//
// Copyright 2026 YBRPC Project Authors. All Rights Reserved.
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

//! Error types for the RPC reactor core.
//!
//! Every fallible operation in this crate returns [`RpcError`] through the
//! crate-wide [`Result`] alias. The variants form the error taxonomy of the
//! wire and reactor layers:
//!
//! - **Wire / socket failures** ([`RpcError::Network`], [`RpcError::Corruption`])
//!   tear down the affected connection; every in-flight call on it fails with
//!   the originating status. Nothing is retried at this layer.
//! - **Deadlines** ([`RpcError::TimedOut`]) apply to outbound calls and to
//!   connection negotiation.
//! - **Shutdown** ([`RpcError::ServiceUnavailable`]) is the status every task
//!   and call receives when it races against a closing reactor.
//! - **Remote failures** ([`RpcError::Remote`]) carry the error status a peer
//!   sent in an `is_error` response.
//!
//! `RpcError` is `Clone` because a single teardown status fans out to every
//! call and timer on a connection.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors produced by the reactor, connection, and wire-codec layers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// A socket-level or framing-level failure: oversized frame, malformed
    /// length prefix, duplicate call id, or an I/O error on the socket.
    ///
    /// The connection carrying the failure is torn down.
    #[error("network error: {0}")]
    Network(String),

    /// A structurally invalid message: missing or uninitialized required
    /// header fields, truncated varints, out-of-bounds sidecar offsets.
    #[error("corruption: {0}")]
    Corruption(String),

    /// A deadline elapsed before an outbound call received its response or
    /// before connection negotiation completed.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// The reactor is shutting down; the operation was rejected or aborted.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The remote peer responded with `is_error = true`.
    #[error("remote error (code {code}): {message}")]
    Remote {
        /// Application-defined error code from the remote error status.
        code: u32,
        /// Human-readable message from the remote error status.
        message: String,
    },

    /// Establishing the TCP connection failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The operation was cancelled before it ran; used when a timer loses the
    /// race against its completion, or a pending unit of work is withdrawn.
    #[error("aborted: {0}")]
    Aborted(String),
}

impl RpcError {
    /// Wraps an [`io::Error`] observed on a socket as a [`RpcError::Network`]
    /// status, preserving the operation that failed.
    pub fn from_io(operation: &str, err: &io::Error) -> Self {
        RpcError::Network(format!("{operation}: {err}"))
    }

    /// Wraps a failed connect attempt as [`RpcError::Connect`].
    pub fn from_connect(remote: &std::net::SocketAddr, err: &io::Error) -> Self {
        RpcError::Connect(format!("connect to {remote}: {err}"))
    }

    /// The status handed to tasks and calls that race against reactor
    /// shutdown.
    pub fn service_unavailable() -> Self {
        RpcError::ServiceUnavailable("reactor is shutting down".to_string())
    }

    /// Returns `true` for [`RpcError::TimedOut`].
    #[must_use]
    pub const fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// Returns `true` for [`RpcError::ServiceUnavailable`].
    #[must_use]
    pub const fn is_service_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_))
    }

    /// Returns `true` for [`RpcError::Network`].
    #[must_use]
    pub const fn is_network_error(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_preserves_operation() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset");
        let err = RpcError::from_io("read", &io_err);
        assert!(err.is_network_error());
        assert!(err.to_string().contains("read"));
        assert!(err.to_string().contains("peer reset"));
    }

    #[test]
    fn test_kind_predicates() {
        assert!(RpcError::TimedOut("t".into()).is_timed_out());
        assert!(RpcError::service_unavailable().is_service_unavailable());
        assert!(!RpcError::Corruption("c".into()).is_network_error());
    }

    #[test]
    fn test_clone_and_eq() {
        let err = RpcError::Remote {
            code: 7,
            message: "no such method".into(),
        };
        assert_eq!(err.clone(), err);
    }
}
