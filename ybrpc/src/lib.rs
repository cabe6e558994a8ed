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

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

//! # YBRPC: a reactor-core RPC subsystem
//!
//! A pool of single-threaded event loops ([`Reactor`]s) that own TCP
//! connections, drive outbound and inbound call processing over a framed,
//! call-id multiplexed wire protocol, and coordinate cross-thread work via
//! task queues.
//!
//! ## Architecture
//!
//! - **[`protocol`]**: the wire codec: length-prefixed frames, varint
//!   request/response headers, sidecar payloads.
//! - **Connections**: one per socket, owned by exactly one reactor thread;
//!   internally lock-free because nothing else may touch them.
//! - **[`Reactor`]**: the thread-safe handle foreign threads use to post
//!   [`ReactorTask`]s, queue [`OutboundCall`]s, register accepted sockets,
//!   and initiate shutdown; the paired event loop drains the queues on its
//!   own thread.
//! - **[`DelayedTask`]**: single-shot timers with exactly-once
//!   fire-or-abort semantics, the cancellation primitive for call
//!   timeouts and negotiation deadlines.
//! - **[`Messenger`]**: the pool; hashes outbound connections onto
//!   reactors, spreads inbound sockets round-robin, aggregates metrics,
//!   and fans out introspection and shutdown.
//!
//! ## Threading model
//!
//! N reactor threads, each a cooperative single-threaded loop. Connection
//! state and call maps are `!Send`; the compiler guarantees no foreign
//! thread reaches them. The only cross-thread surfaces are each reactor's
//! pending-task list and outbound-call queue (mutex-guarded), its
//! `closing` flag, its waker, and each delayed task's done-slot.
//!
//! ## Guarantees
//!
//! - Every [`OutboundCall`]'s callback fires exactly once: response,
//!   timeout, teardown, or shutdown.
//! - Every [`DelayedTask`] callback runs exactly once, with `Ok(())` iff
//!   its timer fired before any abort.
//! - Tasks posted by one thread run in post order; per connection, writes
//!   happen in queue order and inbound calls are parsed in wire order.
//! - After [`Messenger::shutdown`] returns, nothing injected later runs:
//!   it is aborted with [`RpcError::ServiceUnavailable`].

mod call;
mod config;
mod connection;
mod error;
mod introspection;
mod messenger;
mod metrics;
mod negotiation;
pub mod protocol;
mod reactor;

pub use call::{
    CallResponse, InboundCall, InboundCallHandler, OutboundCall, OutboundCallState,
    ResponseCallback, UnroutableHandler,
};
pub use config::MessengerConfig;
pub use connection::{ConnectionId, Direction, Protocol, UserCredentials};
pub use error::{Result, RpcError};
pub use introspection::{
    CallInProgress, ConnectionInfo, DumpRunningRpcsRequest, DumpRunningRpcsResponse,
};
pub use messenger::{Messenger, MessengerBuilder};
pub use metrics::{MessengerMetricsSnapshot, ReactorMetrics, ReactorMetricsSnapshot};
pub use negotiation::{
    ConnectionHeaderNegotiator, Negotiator, NoopNegotiator, CONNECTION_HEADER,
};
pub use protocol::{ErrorStatus, RemoteMethod, RpcMessage};
pub use reactor::{DelayedTask, DelayedTaskFn, Reactor, ReactorTask, ReactorThread};
