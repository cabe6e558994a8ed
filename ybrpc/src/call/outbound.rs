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

//! Outbound (client-side) calls.
//!
//! An [`OutboundCall`] is created on any thread, handed to the messenger,
//! and from then on owned by one reactor: the reactor assigns its call id,
//! serializes it onto a connection's write queue, and completes it when the
//! response frame arrives, or fails it on timeout, connection teardown, or
//! reactor shutdown. The completion callback fires exactly once either way.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::connection::ConnectionId;
use crate::error::{Result, RpcError};
use crate::introspection::CallInProgress;
use crate::protocol::RemoteMethod;
use crate::reactor::DelayedTask;

/// A successfully received call response: the main message plus any
/// sidecars the server attached.
#[derive(Debug, Clone)]
pub struct CallResponse {
    /// The serialized response message.
    pub body: Bytes,
    /// Sidecars in wire order.
    pub sidecars: Vec<Bytes>,
}

/// Completion callback of an [`OutboundCall`]. Invoked exactly once, with
/// the response or a terminal status.
pub type ResponseCallback = Box<dyn FnOnce(Result<CallResponse>) + Send + 'static>;

/// Lifecycle of an outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundCallState {
    /// Created; not yet picked up by a reactor.
    Ready,
    /// A reactor assigned a call id and queued the serialized frame.
    Queued,
    /// The frame was flushed to the socket; awaiting the response.
    SentAwaitingResponse,
    /// The response arrived and the callback fired.
    Completed,
    /// The deadline elapsed first.
    TimedOut,
    /// The call failed terminally (connection teardown, shutdown, remote
    /// error).
    Failed,
}

impl fmt::Display for OutboundCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "ready",
            Self::Queued => "queued",
            Self::SentAwaitingResponse => "sent_awaiting_response",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A client call in flight.
///
/// Shared between the issuing thread, the owning reactor, and the call's
/// timeout timer; the callback slot is the single linearization point, so
/// whoever takes it delivers the one and only completion.
pub struct OutboundCall {
    conn_id: ConnectionId,
    remote_method: RemoteMethod,
    body: Bytes,
    timeout: Option<Duration>,
    created_at: Instant,
    // 0 until the reactor assigns an id at queue time.
    call_id: AtomicI32,
    state: Mutex<OutboundCallState>,
    callback: Mutex<Option<ResponseCallback>>,
    timeout_task: Mutex<Option<Arc<DelayedTask>>>,
}

impl OutboundCall {
    /// Creates a call addressed to `conn_id`, invoking `callback` on
    /// completion. A `timeout` of `None` waits indefinitely.
    pub fn new(
        conn_id: ConnectionId,
        remote_method: RemoteMethod,
        body: Bytes,
        timeout: Option<Duration>,
        callback: ResponseCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn_id,
            remote_method,
            body,
            timeout,
            created_at: Instant::now(),
            call_id: AtomicI32::new(0),
            state: Mutex::new(OutboundCallState::Ready),
            callback: Mutex::new(Some(callback)),
            timeout_task: Mutex::new(None),
        })
    }

    /// The connection this call is routed over.
    #[must_use]
    pub fn conn_id(&self) -> &ConnectionId {
        &self.conn_id
    }

    /// The method being invoked.
    #[must_use]
    pub fn remote_method(&self) -> &RemoteMethod {
        &self.remote_method
    }

    /// The serialized request body.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The caller-requested timeout, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The call id assigned at queue time; `None` before then.
    #[must_use]
    pub fn call_id(&self) -> Option<i32> {
        match self.call_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> OutboundCallState {
        *self.state.lock()
    }

    /// Time since the call was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn set_call_id(&self, id: i32) {
        debug_assert!(id > 0, "call ids start at 1");
        self.call_id.store(id, Ordering::Release);
        *self.state.lock() = OutboundCallState::Queued;
    }

    pub(crate) fn mark_sent(&self) {
        let mut state = self.state.lock();
        if *state == OutboundCallState::Queued {
            *state = OutboundCallState::SentAwaitingResponse;
        }
    }

    pub(crate) fn set_timeout_task(&self, task: Arc<DelayedTask>) {
        *self.timeout_task.lock() = Some(task);
    }

    fn cancel_timeout_task(&self) {
        let task = self.timeout_task.lock().take();
        if let Some(task) = task {
            task.abort(RpcError::Aborted("call finished".to_string()));
        }
    }

    /// Delivers the response. No-op if the call already completed.
    pub(crate) fn complete(&self, response: CallResponse) {
        let Some(callback) = self.callback.lock().take() else {
            return;
        };
        *self.state.lock() = OutboundCallState::Completed;
        self.cancel_timeout_task();
        callback(Ok(response));
    }

    /// Fails the call with `status`. No-op if the call already completed.
    pub(crate) fn fail(&self, status: RpcError) {
        let Some(callback) = self.callback.lock().take() else {
            return;
        };
        *self.state.lock() = if status.is_timed_out() {
            OutboundCallState::TimedOut
        } else {
            OutboundCallState::Failed
        };
        self.cancel_timeout_task();
        callback(Err(status));
    }

    /// Whether the callback has already fired.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.callback.lock().is_none()
    }

    pub(crate) fn dump(&self) -> CallInProgress {
        CallInProgress {
            call_id: self.call_id().unwrap_or(0),
            method: self.remote_method.to_string(),
            state: self.state().to_string(),
            micros_elapsed: self.elapsed().as_micros() as u64,
            trace: None,
        }
    }
}

impl fmt::Debug for OutboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundCall")
            .field("conn_id", &self.conn_id)
            .field("method", &self.remote_method)
            .field("call_id", &self.call_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::UserCredentials;
    use std::sync::mpsc;

    fn test_call(callback: ResponseCallback) -> Arc<OutboundCall> {
        let conn_id = ConnectionId::new(
            "127.0.0.1:7100".parse().unwrap(),
            UserCredentials::default(),
        );
        OutboundCall::new(
            conn_id,
            RemoteMethod::new("TestService", "Ping"),
            Bytes::from_static(b"ping"),
            None,
            callback,
        )
    }

    #[test]
    fn test_callback_fires_once() {
        let (tx, rx) = mpsc::channel();
        let call = test_call(Box::new(move |res| tx.send(res).unwrap()));

        call.complete(CallResponse {
            body: Bytes::from_static(b"pong"),
            sidecars: Vec::new(),
        });
        // Late failure loses the race and must not fire the callback again.
        call.fail(RpcError::TimedOut("too late".into()));

        let first = rx.recv().unwrap();
        assert_eq!(&first.unwrap().body[..], b"pong");
        assert!(rx.try_recv().is_err());
        assert_eq!(call.state(), OutboundCallState::Completed);
        assert!(call.is_finished());
    }

    #[test]
    fn test_fail_sets_timed_out_state() {
        let call = test_call(Box::new(|res| {
            assert!(res.unwrap_err().is_timed_out());
        }));
        call.fail(RpcError::TimedOut("deadline elapsed".into()));
        assert_eq!(call.state(), OutboundCallState::TimedOut);
    }

    #[test]
    fn test_state_progression() {
        let call = test_call(Box::new(|_| {}));
        assert_eq!(call.state(), OutboundCallState::Ready);
        assert_eq!(call.call_id(), None);

        call.set_call_id(1);
        assert_eq!(call.state(), OutboundCallState::Queued);
        assert_eq!(call.call_id(), Some(1));

        call.mark_sent();
        assert_eq!(call.state(), OutboundCallState::SentAwaitingResponse);
    }
}
