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

//! Introspection of running RPCs.
//!
//! [`Messenger::dump_running_rpcs`](crate::Messenger::dump_running_rpcs)
//! fans a [`DumpRunningRpcsRequest`] out to every reactor and merges each
//! reactor's view of its connections and in-flight calls. Callable from any
//! thread; each reactor assembles its slice of the answer on its own
//! thread.

use serde::Serialize;

/// Parameters of a running-RPC dump.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpRunningRpcsRequest {
    /// Include each call's trace buffer in the dump.
    pub include_traces: bool,
}

/// Every connection and in-flight call across a messenger's reactors.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DumpRunningRpcsResponse {
    /// One entry per live connection.
    pub connections: Vec<ConnectionInfo>,
}

/// A live connection and its in-flight calls.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Name of the reactor that owns the connection.
    pub reactor: String,
    /// Remote peer address.
    pub remote_address: String,
    /// `"client"` or `"server"`.
    pub direction: String,
    /// Connection state at dump time.
    pub state: String,
    /// Calls currently in flight on this connection.
    pub calls_in_flight: Vec<CallInProgress>,
}

/// A single in-flight call.
#[derive(Debug, Clone, Serialize)]
pub struct CallInProgress {
    /// Call id within the connection.
    pub call_id: i32,
    /// Fully-qualified method name.
    pub method: String,
    /// Lifecycle state of the call.
    pub state: String,
    /// Microseconds since the call was created (outbound) or received
    /// (inbound).
    pub micros_elapsed: u64,
    /// Trace buffer, present when the request asked for traces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}
