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

//! Connection negotiation.
//!
//! Between `connect`/`accept` and a connection turning `Open`, its bytes
//! belong to the [`Negotiator`]; the reactor does not run the wire codec
//! until negotiation succeeds. The negotiator is an opaque hook (an
//! authenticating implementation can do arbitrary handshake rounds) and
//! the reactor enforces the deadline from the outside, cancelling the
//! negotiation with `TimedOut` when it expires.
//!
//! The default [`ConnectionHeaderNegotiator`] implements the protocol's
//! minimal handshake: the client sends a 4-byte connection header (magic
//! plus version), the server validates it.

use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::connection::Direction;
use crate::error::{Result, RpcError};

/// Connection header a client sends first on every connection: the magic
/// `"YB"`, the protocol version, and a reserved byte.
pub const CONNECTION_HEADER: [u8; 4] = *b"YB\x01\0";

/// Handshake hook invoked once per connection before it opens.
///
/// Runs on the reactor thread as a cooperative future; implementations
/// must not block the thread. The `deadline` is advisory; the reactor
/// aborts negotiations that outlive it regardless.
#[async_trait]
pub trait Negotiator: Send + Sync + 'static {
    /// Performs the handshake on `stream`. Returning an error destroys the
    /// connection with that status.
    async fn negotiate(
        &self,
        stream: &mut TcpStream,
        direction: Direction,
        deadline: Instant,
    ) -> Result<()>;
}

/// Default negotiator: exchanges and validates the 4-byte connection
/// header.
#[derive(Debug, Default)]
pub struct ConnectionHeaderNegotiator;

#[async_trait]
impl Negotiator for ConnectionHeaderNegotiator {
    async fn negotiate(
        &self,
        stream: &mut TcpStream,
        direction: Direction,
        _deadline: Instant,
    ) -> Result<()> {
        match direction {
            Direction::Client => {
                stream
                    .write_all(&CONNECTION_HEADER)
                    .await
                    .map_err(|e| RpcError::from_io("write connection header", &e))?;
                stream
                    .flush()
                    .await
                    .map_err(|e| RpcError::from_io("flush connection header", &e))?;
            }
            Direction::Server => {
                let mut header = [0u8; 4];
                stream
                    .read_exact(&mut header)
                    .await
                    .map_err(|e| RpcError::from_io("read connection header", &e))?;
                if header[..2] != CONNECTION_HEADER[..2] {
                    return Err(RpcError::Network(format!(
                        "invalid connection header magic: {:02x}{:02x}",
                        header[0], header[1]
                    )));
                }
                if header[2] != CONNECTION_HEADER[2] {
                    return Err(RpcError::Network(format!(
                        "unsupported protocol version {}",
                        header[2]
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Negotiator that opens every connection immediately. Useful in tests and
/// for trusted in-process links.
#[derive(Debug, Default)]
pub struct NoopNegotiator;

#[async_trait]
impl Negotiator for NoopNegotiator {
    async fn negotiate(
        &self,
        _stream: &mut TcpStream,
        _direction: Direction,
        _deadline: Instant,
    ) -> Result<()> {
        Ok(())
    }
}
