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

//! Inbound (server-side) calls.
//!
//! The reactor parses a request frame into an [`InboundCall`] and hands it
//! to the messenger's [`InboundCallHandler`]; the handler (typically a
//! service-dispatch pool, out of scope here) eventually responds. The
//! response is serialized on the responding thread and queued back onto the
//! owning connection through the reactor's task queue, so connection state
//! is still only ever touched by the reactor thread.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::introspection::CallInProgress;
use crate::protocol::{self, ErrorStatus, RemoteMethod, RequestHeader, RpcMessage};
use crate::reactor::{task, Reactor};

/// Sink for parsed inbound calls, implemented by the service-dispatch
/// layer.
///
/// Invoked on the reactor thread; implementations must hand the call off
/// quickly (responding inline is allowed; the response is re-queued through
/// the reactor rather than written directly).
pub trait InboundCallHandler: Send + Sync + 'static {
    /// Accepts a parsed call for execution.
    fn queue_inbound(&self, call: Arc<InboundCall>);
}

/// Fallback handler for messengers with no service layer: answers every
/// call with an error status.
#[derive(Debug, Default)]
pub struct UnroutableHandler;

impl InboundCallHandler for UnroutableHandler {
    fn queue_inbound(&self, call: Arc<InboundCall>) {
        let status = ErrorStatus::new(
            format!("service {} not registered", call.remote_method().service()),
            ErrorStatus::CODE_NO_SUCH_SERVICE,
        );
        call.respond_failure(&status);
    }
}

impl ErrorStatus {
    /// Error code reported when no service layer is registered.
    pub const CODE_NO_SUCH_SERVICE: u32 = 1;
}

/// A server-side call being handled.
///
/// Lives in the owning connection's `calls_being_handled` map from parse
/// until the response is queued for write; the handler holds it across
/// threads in the meantime.
pub struct InboundCall {
    header: RequestHeader,
    body: Bytes,
    sidecars: Mutex<Vec<Bytes>>,
    time_received: Instant,
    remote: SocketAddr,
    conn_serial: u64,
    reactor: Weak<Reactor>,
    responded: AtomicBool,
    trace: Mutex<Vec<(Duration, String)>>,
}

impl InboundCall {
    pub(crate) fn new(
        header: RequestHeader,
        body: Bytes,
        remote: SocketAddr,
        conn_serial: u64,
        reactor: Weak<Reactor>,
        time_received: Instant,
    ) -> Arc<Self> {
        let call = Arc::new(Self {
            header,
            body,
            sidecars: Mutex::new(Vec::new()),
            time_received,
            remote,
            conn_serial,
            reactor,
            responded: AtomicBool::new(false),
            trace: Mutex::new(Vec::new()),
        });
        call.record_trace("received");
        call
    }

    /// The call id from the request header.
    #[must_use]
    pub fn call_id(&self) -> i32 {
        self.header.call_id
    }

    /// The method the client invoked.
    #[must_use]
    pub fn remote_method(&self) -> &RemoteMethod {
        &self.header.remote_method
    }

    /// The serialized request message.
    #[must_use]
    pub fn serialized_request(&self) -> &Bytes {
        &self.body
    }

    /// Attaches a sidecar to the eventual response, returning its index in
    /// the response's sidecar list.
    pub fn add_sidecar(&self, sidecar: Bytes) -> u32 {
        let mut sidecars = self.sidecars.lock();
        sidecars.push(sidecar);
        (sidecars.len() - 1) as u32
    }

    /// Address of the calling peer.
    #[must_use]
    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    /// When the request frame was parsed.
    #[must_use]
    pub fn time_received(&self) -> Instant {
        self.time_received
    }

    /// The latest instant by which the client still cares about an answer,
    /// derived from `timeout_millis`. `None` when the client set no
    /// deadline.
    #[must_use]
    pub fn client_deadline(&self) -> Option<Instant> {
        match self.header.timeout_millis {
            0 => None,
            millis => Some(self.time_received + Duration::from_millis(u64::from(millis))),
        }
    }

    /// Appends an event to the call's trace buffer.
    pub fn record_trace(&self, event: impl Into<String>) {
        self.trace
            .lock()
            .push((self.time_received.elapsed(), event.into()));
    }

    /// Responds with a successful message, appending any sidecars attached
    /// via [`InboundCall::add_sidecar`].
    pub fn respond_success(&self, response: &dyn RpcMessage) {
        let sidecars = std::mem::take(&mut *self.sidecars.lock());
        let frame = protocol::serialize_response(self.call_id(), response, &sidecars, false);
        self.send_response(frame);
    }

    /// Responds with an error status.
    pub fn respond_failure(&self, status: &ErrorStatus) {
        let frame = protocol::serialize_response(self.call_id(), status, &[], true);
        self.send_response(frame);
    }

    fn send_response(&self, frame: Bytes) {
        if self.responded.swap(true, Ordering::AcqRel) {
            warn!(call = %self, "ignoring duplicate response to inbound call");
            return;
        }
        self.record_trace("responded");
        self.log_timing();
        let Some(reactor) = self.reactor.upgrade() else {
            // Reactor already gone; the connection went with it.
            return;
        };
        let serial = self.conn_serial;
        let call_id = self.call_id();
        reactor.schedule_task(task::functor(move |thread| {
            thread.queue_server_response(serial, call_id, frame);
        }));
    }

    fn log_timing(&self) {
        let Some(reactor) = self.reactor.upgrade() else {
            return;
        };
        let config = reactor.config();
        let total = self.time_received.elapsed();
        let total_ms = total.as_millis() as u64;

        if self.header.timeout_millis > 0 {
            let threshold_ms = u64::from(self.header.timeout_millis) * 3 / 4;
            if total_ms > threshold_ms {
                warn!(
                    call = %self,
                    total_ms,
                    client_timeout_ms = self.header.timeout_millis,
                    trace = %self.dump_trace(),
                    "inbound call ran close to its client timeout"
                );
                return;
            }
        }
        if config.dump_all_traces || total > config.slow_call_threshold {
            info!(call = %self, total_ms, trace = %self.dump_trace(), "inbound call trace");
        }
    }

    fn dump_trace(&self) -> String {
        let trace = self.trace.lock();
        let mut out = String::new();
        for (offset, event) in trace.iter() {
            if !out.is_empty() {
                out.push_str("; ");
            }
            out.push_str(&format!("{}us {}", offset.as_micros(), event));
        }
        out
    }

    pub(crate) fn dump(&self, include_traces: bool) -> CallInProgress {
        CallInProgress {
            call_id: self.call_id(),
            method: self.remote_method().to_string(),
            state: if self.responded.load(Ordering::Acquire) {
                "responded".to_string()
            } else {
                "handling".to_string()
            },
            micros_elapsed: self.time_received.elapsed().as_micros() as u64,
            trace: include_traces.then(|| self.dump_trace()),
        }
    }
}

impl std::fmt::Display for InboundCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "call {} from {} (request call id {})",
            self.remote_method(),
            self.remote,
            self.call_id()
        )
    }
}

impl std::fmt::Debug for InboundCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundCall")
            .field("call_id", &self.call_id())
            .field("method", &self.remote_method().to_string())
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}
