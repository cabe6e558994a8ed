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

//! Connections: one per TCP socket, owned by exactly one reactor thread.
//!
//! A connection owns its inbound buffer, its queue of serialized outbound
//! frames, and its in-flight call maps. All of that state is `!Send`
//! (`Rc`, `RefCell`, `Cell`), so the compiler enforces the load-bearing
//! invariant that only the owning reactor thread ever touches it. Foreign
//! threads reach a connection exclusively through the reactor's task queue.
//!
//! Each connection is driven by one local task on its reactor: the driver
//! establishes the socket (for client connections), runs negotiation
//! against the configured [`Negotiator`](crate::Negotiator), and then
//! services readiness events, reading frames into calls and flushing the
//! write queue with vectored writes. Write interest is only declared while
//! the outbound queue is non-empty.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::call::{CallResponse, InboundCall, OutboundCall};
use crate::error::{Result, RpcError};
use crate::introspection::ConnectionInfo;
use crate::protocol::{self, ErrorStatus};
use crate::reactor::thread::ReactorThread;
use crate::reactor::DelayedTask;

const READ_CHUNK: usize = 64 * 1024;
const MAX_WRITE_VECTORS: usize = 64;

/// Identity of the user a client connection acts for. Part of the
/// connection key, so calls with different credentials never share a
/// socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserCredentials {
    real_user: String,
}

impl UserCredentials {
    /// Credentials for the given user name.
    pub fn new(real_user: impl Into<String>) -> Self {
        Self {
            real_user: real_user.into(),
        }
    }

    /// The user name.
    #[must_use]
    pub fn real_user(&self) -> &str {
        &self.real_user
    }
}

impl Default for UserCredentials {
    fn default() -> Self {
        Self::new("anonymous")
    }
}

/// Wire protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    /// The YB framed protocol implemented by this crate.
    #[default]
    Yb,
}

/// Key identifying a client connection: where it goes, who it acts for,
/// and what it speaks. Immutable once constructed.
///
/// # Examples
///
/// ```rust
/// use ybrpc::{ConnectionId, UserCredentials};
///
/// let a = ConnectionId::new("127.0.0.1:7100".parse().unwrap(), UserCredentials::default());
/// let b = ConnectionId::new("127.0.0.1:7100".parse().unwrap(), UserCredentials::new("admin"));
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    remote: SocketAddr,
    credentials: UserCredentials,
    protocol: Protocol,
}

impl ConnectionId {
    /// Connection key for `remote` with the default wire protocol.
    pub fn new(remote: SocketAddr, credentials: UserCredentials) -> Self {
        Self {
            remote,
            credentials,
            protocol: Protocol::default(),
        }
    }

    /// The remote address.
    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// The credentials calls on this connection act under.
    #[must_use]
    pub fn credentials(&self) -> &UserCredentials {
        &self.credentials
    }

    /// The wire protocol.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.credentials.real_user(), self.remote)
    }
}

/// Which side of the connection this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We connected out; responses to our calls flow back in.
    Client,
    /// The peer connected to us; we parse requests and send responses.
    Server,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Server => "server",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Negotiating,
    Open,
    Closing,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Negotiating => "negotiating",
            Self::Open => "open",
            Self::Closing => "closing",
        })
    }
}

/// A live TCP connection with its framing state and call maps.
///
/// Reactor-thread only; see the module docs for the threading contract.
pub(crate) struct Connection {
    serial: u64,
    remote: SocketAddr,
    conn_id: Option<ConnectionId>,
    direction: Direction,
    state: Cell<ConnState>,
    inbound: RefCell<BytesMut>,
    outbound: RefCell<VecDeque<(Bytes, Option<Arc<OutboundCall>>)>>,
    calls_awaiting_response: RefCell<HashMap<i32, Arc<OutboundCall>>>,
    calls_being_handled: RefCell<HashMap<i32, Arc<InboundCall>>>,
    next_call_id: Cell<i32>,
    last_activity: Cell<Instant>,
    negotiation_timer: RefCell<Option<Arc<DelayedTask>>>,
    negotiation_timed_out: Cell<bool>,
    close_status: RefCell<Option<RpcError>>,
    write_wake: Notify,
    close_wake: Notify,
}

impl Connection {
    pub(crate) fn new_client(serial: u64, conn_id: ConnectionId, now: Instant) -> Rc<Self> {
        Self::new(serial, conn_id.remote(), Some(conn_id), Direction::Client, now)
    }

    pub(crate) fn new_server(serial: u64, remote: SocketAddr, now: Instant) -> Rc<Self> {
        Self::new(serial, remote, None, Direction::Server, now)
    }

    fn new(
        serial: u64,
        remote: SocketAddr,
        conn_id: Option<ConnectionId>,
        direction: Direction,
        now: Instant,
    ) -> Rc<Self> {
        Rc::new(Self {
            serial,
            remote,
            conn_id,
            direction,
            state: Cell::new(ConnState::Negotiating),
            inbound: RefCell::new(BytesMut::new()),
            outbound: RefCell::new(VecDeque::new()),
            calls_awaiting_response: RefCell::new(HashMap::new()),
            calls_being_handled: RefCell::new(HashMap::new()),
            next_call_id: Cell::new(1),
            last_activity: Cell::new(now),
            negotiation_timer: RefCell::new(None),
            negotiation_timed_out: Cell::new(false),
            close_status: RefCell::new(None),
            write_wake: Notify::new(),
            close_wake: Notify::new(),
        })
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn conn_id(&self) -> Option<&ConnectionId> {
        self.conn_id.as_ref()
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn state(&self) -> ConnState {
        self.state.get()
    }

    pub(crate) fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn last_activity_time(&self) -> Instant {
        self.last_activity.get()
    }

    fn touch(&self, now: Instant) {
        self.last_activity.set(now);
    }

    /// True iff no calls are in flight and nothing is waiting to be
    /// written.
    pub(crate) fn is_idle(&self) -> bool {
        self.calls_awaiting_response.borrow().is_empty()
            && self.calls_being_handled.borrow().is_empty()
            && self.outbound.borrow().is_empty()
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.outbound.borrow().is_empty()
    }

    /// Assigns the next call id, serializes the request, and queues it for
    /// write. Works in `Negotiating` too: frames accumulate and flush once
    /// the connection opens.
    pub(crate) fn queue_outbound_call(&self, thread: &ReactorThread, call: Arc<OutboundCall>) {
        if self.state.get() == ConnState::Closing {
            call.fail(
                self.close_status
                    .borrow()
                    .clone()
                    .unwrap_or_else(RpcError::service_unavailable),
            );
            return;
        }

        let call_id = self.next_call_id.get();
        self.next_call_id.set(call_id + 1);
        call.set_call_id(call_id);

        let timeout_millis = call
            .timeout()
            .map(|t| u32::try_from(t.as_millis()).unwrap_or(u32::MAX))
            .unwrap_or(0);
        let frame = protocol::serialize_request(
            call_id,
            call.remote_method(),
            timeout_millis,
            call.body(),
        );

        self.calls_awaiting_response
            .borrow_mut()
            .insert(call_id, call.clone());
        self.outbound.borrow_mut().push_back((frame, Some(call.clone())));
        thread.schedule_call_expiration(self.serial, call_id, &call);
        self.write_wake.notify_one();
    }

    pub(crate) fn remove_awaiting(&self, call_id: i32) {
        self.calls_awaiting_response.borrow_mut().remove(&call_id);
    }

    /// Queues a serialized response frame and erases the inbound call it
    /// answers. Responses for connections already closing are dropped.
    pub(crate) fn queue_response(&self, call_id: i32, frame: Bytes) {
        self.calls_being_handled.borrow_mut().remove(&call_id);
        if self.state.get() == ConnState::Closing {
            return;
        }
        self.outbound.borrow_mut().push_back((frame, None));
        self.write_wake.notify_one();
    }

    /// Drains the socket into the inbound buffer, then consumes every
    /// complete frame.
    pub(crate) fn handle_readable(&self, stream: &TcpStream, thread: &ReactorThread) -> Result<()> {
        let mut closed = false;
        {
            let mut buf = self.inbound.borrow_mut();
            loop {
                buf.reserve(READ_CHUNK);
                match stream.try_read_buf(&mut *buf) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(_) => self.touch(thread.cur_time()),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(RpcError::from_io("recv", &e)),
                }
            }
        }
        self.process_inbound(thread)?;
        if closed {
            return Err(RpcError::Network("connection closed by remote".to_string()));
        }
        Ok(())
    }

    fn process_inbound(&self, thread: &ReactorThread) -> Result<()> {
        let max_message_size = thread.reactor().config().max_message_size;
        loop {
            let frame = {
                let mut buf = self.inbound.borrow_mut();
                protocol::extract_frame(&mut buf, max_message_size)?
            };
            let Some(payload) = frame else {
                return Ok(());
            };
            match self.direction {
                Direction::Client => self.handle_call_response(payload)?,
                Direction::Server => self.handle_inbound_call(payload, thread)?,
            }
        }
    }

    fn handle_call_response(&self, payload: Bytes) -> Result<()> {
        let (header, body) = protocol::parse_response(&payload)?;
        let call = self
            .calls_awaiting_response
            .borrow_mut()
            .remove(&header.call_id);
        let Some(call) = call else {
            debug!(
                conn = %self,
                call_id = header.call_id,
                "response for unknown call id, ignoring"
            );
            return Ok(());
        };
        let (msg, sidecars) = protocol::split_sidecars(body, &header.sidecar_offsets)?;
        if header.is_error {
            let status = ErrorStatus::decode(&msg)?;
            call.fail(RpcError::Remote {
                code: status.code,
                message: status.message,
            });
        } else {
            call.complete(CallResponse {
                body: msg,
                sidecars,
            });
        }
        Ok(())
    }

    fn handle_inbound_call(&self, payload: Bytes, thread: &ReactorThread) -> Result<()> {
        let (header, body) = protocol::parse_request(&payload)?;
        let call_id = header.call_id;
        if self.calls_being_handled.borrow().contains_key(&call_id) {
            warn!(
                conn = %self,
                call_id,
                "received call id already being processed, dropping connection"
            );
            return Err(RpcError::Network(format!(
                "received duplicate call id: {call_id}"
            )));
        }
        let call = InboundCall::new(
            header,
            body,
            self.remote,
            self.serial,
            thread.reactor_weak(),
            Instant::now(),
        );
        self.calls_being_handled.borrow_mut().insert(call_id, call.clone());
        thread.handler().queue_inbound(call);
        Ok(())
    }

    /// Flushes queued frames with vectored writes, preserving any partial
    /// remainder at the front of the queue.
    pub(crate) fn handle_writable(&self, stream: &TcpStream, thread: &ReactorThread) -> Result<()> {
        loop {
            let mut queue = self.outbound.borrow_mut();
            if queue.is_empty() {
                return Ok(());
            }
            let slices: Vec<io::IoSlice<'_>> = queue
                .iter()
                .take(MAX_WRITE_VECTORS)
                .map(|(frame, _)| io::IoSlice::new(frame))
                .collect();
            match stream.try_write_vectored(&slices) {
                Ok(0) => return Ok(()),
                Ok(mut written) => {
                    self.touch(thread.cur_time());
                    while written > 0 {
                        let (frame, call) = queue
                            .front_mut()
                            .expect("written bytes exceed queued frames");
                        if written >= frame.len() {
                            written -= frame.len();
                            if let Some(call) = call.take() {
                                call.mark_sent();
                            }
                            queue.pop_front();
                        } else {
                            frame.advance(written);
                            written = 0;
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(RpcError::from_io("send", &e)),
            }
        }
    }

    /// Marks the connection `Closing`, fails every in-flight call with
    /// `status`, cancels associated timers, and wakes the driver so the
    /// socket gets closed. Idempotent.
    pub(crate) fn shutdown(&self, status: RpcError) {
        if self.state.get() == ConnState::Closing {
            return;
        }
        self.state.set(ConnState::Closing);
        *self.close_status.borrow_mut() = Some(status.clone());
        self.abort_negotiation_timer();

        let awaiting: Vec<Arc<OutboundCall>> = self
            .calls_awaiting_response
            .borrow_mut()
            .drain()
            .map(|(_, call)| call)
            .collect();
        self.calls_being_handled.borrow_mut().clear();
        self.outbound.borrow_mut().clear();
        for call in awaiting {
            call.fail(status.clone());
        }
        self.close_wake.notify_one();
    }

    pub(crate) fn set_negotiation_timer(&self, timer: Arc<DelayedTask>) {
        *self.negotiation_timer.borrow_mut() = Some(timer);
    }

    pub(crate) fn abort_negotiation_timer(&self) {
        if let Some(timer) = self.negotiation_timer.borrow_mut().take() {
            timer.abort(RpcError::Aborted("negotiation finished".to_string()));
        }
    }

    pub(crate) fn mark_negotiation_timed_out(&self) {
        self.negotiation_timed_out.set(true);
        self.close_wake.notify_one();
    }

    fn negotiation_cancel_status(&self) -> RpcError {
        if self.negotiation_timed_out.get() {
            RpcError::TimedOut("connection negotiation timed out".to_string())
        } else {
            self.close_status
                .borrow()
                .clone()
                .unwrap_or_else(RpcError::service_unavailable)
        }
    }

    pub(crate) fn mark_open(&self) {
        debug_assert_eq!(self.state.get(), ConnState::Negotiating);
        self.state.set(ConnState::Open);
    }

    pub(crate) async fn write_wake_notified(&self) {
        self.write_wake.notified().await;
    }

    pub(crate) async fn close_wake_notified(&self) {
        self.close_wake.notified().await;
    }

    pub(crate) fn dump(&self, reactor_name: &str, include_traces: bool) -> ConnectionInfo {
        let calls_in_flight = match self.direction {
            Direction::Client => self
                .calls_awaiting_response
                .borrow()
                .values()
                .map(|call| call.dump())
                .collect(),
            Direction::Server => self
                .calls_being_handled
                .borrow()
                .values()
                .map(|call| call.dump(include_traces))
                .collect(),
        };
        ConnectionInfo {
            reactor: reactor_name.to_string(),
            remote_address: self.remote.to_string(),
            direction: self.direction.to_string(),
            state: self.state.get().to_string(),
            calls_in_flight,
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Client => write!(f, "client connection to {}", self.remote),
            Direction::Server => write!(f, "server connection from {}", self.remote),
        }
    }
}

/// Driver task of one connection: connect (client side), negotiate, then
/// service readiness events until the connection closes. Exactly one
/// driver runs per registered connection, and it is the only place the
/// socket lives.
pub(crate) async fn run_connection(
    thread: Rc<ReactorThread>,
    conn: Rc<Connection>,
    stream: Option<TcpStream>,
    deadline: Instant,
) {
    let stream = match establish(&thread, &conn, stream, deadline).await {
        Ok(stream) => {
            if thread.complete_connection_negotiation(&conn, Ok(())) {
                Some(stream)
            } else {
                None
            }
        }
        Err(status) => {
            thread.complete_connection_negotiation(&conn, Err(status));
            None
        }
    };
    if let Some(stream) = stream {
        io_loop(&thread, &conn, &stream).await;
    }
    thread.finish_connection(&conn);
}

async fn establish(
    thread: &Rc<ReactorThread>,
    conn: &Rc<Connection>,
    stream: Option<TcpStream>,
    deadline: Instant,
) -> Result<TcpStream> {
    let mut stream = match stream {
        Some(stream) => stream,
        None => {
            let remote = conn.remote();
            tokio::select! {
                res = TcpStream::connect(remote) => {
                    res.map_err(|e| RpcError::from_connect(&remote, &e))?
                }
                () = conn.close_wake_notified() => {
                    return Err(conn.negotiation_cancel_status());
                }
            }
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn = %conn, error = %e, "failed to set TCP_NODELAY");
    }

    let negotiator = thread.negotiator();
    tokio::select! {
        res = negotiator.negotiate(&mut stream, conn.direction(), deadline) => {
            res.map(|()| stream)
        }
        () = conn.close_wake_notified() => Err(conn.negotiation_cancel_status()),
    }
}

async fn io_loop(thread: &Rc<ReactorThread>, conn: &Rc<Connection>, stream: &TcpStream) {
    loop {
        if conn.state() == ConnState::Closing {
            return;
        }
        let interest = if conn.has_pending_writes() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        tokio::select! {
            ready = stream.ready(interest) => {
                let ready = match ready {
                    Ok(ready) => ready,
                    Err(e) => {
                        thread.destroy_connection(conn, RpcError::from_io("poll socket", &e));
                        return;
                    }
                };
                if ready.is_writable() {
                    if let Err(status) = conn.handle_writable(stream, thread) {
                        thread.destroy_connection(conn, status);
                        return;
                    }
                }
                if ready.is_readable() || ready.is_read_closed() {
                    if let Err(status) = conn.handle_readable(stream, thread) {
                        thread.destroy_connection(conn, status);
                        return;
                    }
                }
            }
            () = conn.write_wake_notified() => {}
            () = conn.close_wake_notified() => {}
        }
    }
}
