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

//! The reactor thread: one OS thread running one single-threaded event
//! loop.
//!
//! The loop multiplexes three wake sources: the cross-thread task queue's
//! waker, a periodic coarse timer (clock refresh plus keepalive scan), and
//! an internal nudge used while draining connections at shutdown. All
//! connection registries live here in `RefCell`s; the structure is `!Send`,
//! so nothing outside this thread can reach them; foreign threads go
//! through [`Reactor`](crate::Reactor) instead.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak as RcWeak};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::call::{InboundCallHandler, OutboundCall};
use crate::connection::{run_connection, ConnState, Connection, ConnectionId};
use crate::error::RpcError;
use crate::introspection::{ConnectionInfo, DumpRunningRpcsRequest};
use crate::negotiation::Negotiator;
use crate::reactor::delayed::{DelayedTask, DelayedTaskFn};
use crate::reactor::{task, Reactor};

/// Thread-side state of a reactor: the connection registries, scheduled
/// delayed tasks, and the coarse clock.
///
/// Handed to every [`ReactorTask::run`](crate::ReactorTask::run); only ever
/// touched on the reactor's own thread.
pub struct ReactorThread {
    reactor: Arc<Reactor>,
    self_weak: RcWeak<ReactorThread>,
    client_conns: RefCell<HashMap<ConnectionId, Rc<Connection>>>,
    server_conns: RefCell<HashMap<u64, Rc<Connection>>>,
    waiting_conns: RefCell<HashMap<u64, Rc<Connection>>>,
    scheduled_tasks: RefCell<HashMap<i64, Arc<DelayedTask>>>,
    cur_time: Cell<Instant>,
    last_keepalive_scan: Cell<Instant>,
    next_serial: Cell<u64>,
    stopping: Cell<bool>,
    stop_wake: Notify,
}

impl ReactorThread {
    /// The owning reactor handle.
    #[must_use]
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// The coarse monotonic clock, refreshed every
    /// `coarse_timer_granularity`.
    #[must_use]
    pub fn cur_time(&self) -> Instant {
        self.cur_time.get()
    }

    /// Schedules `func` to run on this reactor after `delay`, or to be
    /// aborted exactly once if the reactor shuts down first.
    pub fn schedule_delayed(&self, delay: Duration, func: DelayedTaskFn) -> Arc<DelayedTask> {
        let task = DelayedTask::new(self.reactor.next_task_id(), delay, func);
        self.arm_delayed(task.clone());
        task
    }

    fn rc(&self) -> Rc<ReactorThread> {
        self.self_weak
            .upgrade()
            .expect("reactor thread outlived by its own state")
    }

    pub(crate) fn reactor_weak(&self) -> Weak<Reactor> {
        Arc::downgrade(&self.reactor)
    }

    pub(crate) fn negotiator(&self) -> Arc<dyn Negotiator> {
        self.reactor.negotiator()
    }

    pub(crate) fn handler(&self) -> Arc<dyn InboundCallHandler> {
        self.reactor.handler()
    }

    fn next_serial(&self) -> u64 {
        let serial = self.next_serial.get();
        self.next_serial.set(serial + 1);
        serial
    }

    /// Arms a delayed task's single-shot timer. A task aborted before it
    /// got here is never armed.
    pub(crate) fn arm_delayed(&self, task: Arc<DelayedTask>) {
        if task.is_done() {
            return;
        }
        if self.stopping.get() {
            task.abort(RpcError::service_unavailable());
            return;
        }
        self.scheduled_tasks
            .borrow_mut()
            .insert(task.id(), task.clone());
        let thread = self.rc();
        tokio::task::spawn_local(async move {
            let fired = tokio::select! {
                () = tokio::time::sleep(task.delay()) => true,
                () = task.cancelled() => false,
            };
            thread.scheduled_tasks.borrow_mut().remove(&task.id());
            if fired {
                if let Some(func) = task.take_func() {
                    func(Ok(()));
                }
            }
        });
    }

    /// Arms the per-call expiration timer that fails an outbound call with
    /// `TimedOut` when its deadline passes before the response.
    pub(crate) fn schedule_call_expiration(
        &self,
        serial: u64,
        call_id: i32,
        call: &Arc<OutboundCall>,
    ) {
        let Some(timeout) = call.timeout() else {
            return;
        };
        let reactor = self.reactor_weak();
        let timed_call = call.clone();
        let task = self.schedule_delayed(
            timeout,
            Box::new(move |status| {
                if status.is_ok() {
                    timed_call.fail(RpcError::TimedOut(format!(
                        "{} timed out after {timeout:?}",
                        timed_call.remote_method()
                    )));
                    // The map entry is cleaned up back on the reactor thread.
                    if let Some(reactor) = reactor.upgrade() {
                        reactor.schedule_task(task::functor(move |thread| {
                            thread.expire_outbound_call(serial, call_id);
                        }));
                    }
                }
            }),
        );
        call.set_timeout_task(task);
    }

    fn expire_outbound_call(&self, serial: u64, call_id: i32) {
        let conn = self
            .client_conns
            .borrow()
            .values()
            .find(|conn| conn.serial() == serial)
            .cloned();
        if let Some(conn) = conn {
            conn.remove_awaiting(call_id);
        }
    }

    /// Moves cross-thread queued calls onto their connections.
    pub(crate) fn process_outbound_queue(&self) {
        for call in self.reactor.drain_outbound_queue() {
            self.assign_outbound_call(call);
        }
    }

    pub(crate) fn assign_outbound_call(&self, call: Arc<OutboundCall>) {
        if self.stopping.get() {
            call.fail(RpcError::service_unavailable());
            return;
        }
        let now = Instant::now();
        let deadline = call
            .timeout()
            .map_or(now + self.reactor.config().negotiation_timeout, |t| now + t);
        let conn = self.find_or_start_connection(call.conn_id().clone(), deadline);
        conn.queue_outbound_call(self, call);
    }

    /// Returns the open or opening connection for `conn_id`, creating one
    /// (socket, non-blocking connect, negotiation with `deadline`) if none
    /// is registered.
    fn find_or_start_connection(&self, conn_id: ConnectionId, deadline: Instant) -> Rc<Connection> {
        if let Some(conn) = self.client_conns.borrow().get(&conn_id) {
            return conn.clone();
        }
        debug!(reactor = self.reactor.name(), %conn_id, "starting new client connection");
        let conn = Connection::new_client(self.next_serial(), conn_id.clone(), self.cur_time.get());
        self.client_conns.borrow_mut().insert(conn_id, conn.clone());
        self.reactor.metrics().record_client_connection_opened();
        self.start_connection_negotiation(&conn, deadline);
        tokio::task::spawn_local(run_connection(self.rc(), conn.clone(), None, deadline));
        conn
    }

    /// Adopts an accepted socket as a server connection and starts its
    /// negotiation.
    pub(crate) fn register_inbound_socket(&self, socket: std::net::TcpStream, remote: SocketAddr) {
        if self.stopping.get() {
            debug!(%remote, "dropping inbound socket, reactor is stopping");
            return;
        }
        if let Err(e) = socket.set_nonblocking(true) {
            warn!(%remote, error = %e, "failed to make inbound socket non-blocking");
            return;
        }
        let stream = match tokio::net::TcpStream::from_std(socket) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%remote, error = %e, "failed to register inbound socket");
                return;
            }
        };
        let conn = Connection::new_server(self.next_serial(), remote, self.cur_time.get());
        self.server_conns
            .borrow_mut()
            .insert(conn.serial(), conn.clone());
        self.reactor.metrics().record_server_connection_opened();
        let deadline = Instant::now() + self.reactor.config().negotiation_timeout;
        self.start_connection_negotiation(&conn, deadline);
        tokio::task::spawn_local(run_connection(self.rc(), conn, Some(stream), deadline));
    }

    /// Arms the negotiation deadline: a delayed task that, if it fires
    /// while the connection is still negotiating, forces the negotiation
    /// to fail with `TimedOut`.
    pub(crate) fn start_connection_negotiation(&self, conn: &Rc<Connection>, deadline: Instant) {
        let serial = conn.serial();
        let reactor = self.reactor_weak();
        let delay = deadline.saturating_duration_since(Instant::now());
        let timer = self.schedule_delayed(
            delay,
            Box::new(move |status| {
                if status.is_ok() {
                    if let Some(reactor) = reactor.upgrade() {
                        reactor.schedule_task(task::functor(move |thread| {
                            thread.fail_negotiation(serial);
                        }));
                    }
                }
            }),
        );
        conn.set_negotiation_timer(timer);
    }

    fn fail_negotiation(&self, serial: u64) {
        let Some(conn) = self.find_by_serial(serial) else {
            return;
        };
        if conn.state() != ConnState::Negotiating {
            return;
        }
        conn.mark_negotiation_timed_out();
    }

    /// Finalizes negotiation: transitions the connection to `Open` (queued
    /// outbound calls start flushing) or destroys it with the failure
    /// status. Returns whether the connection opened.
    pub(crate) fn complete_connection_negotiation(
        &self,
        conn: &Rc<Connection>,
        status: crate::error::Result<()>,
    ) -> bool {
        conn.abort_negotiation_timer();
        if conn.state() == ConnState::Closing {
            return false;
        }
        match status {
            Ok(()) if !self.stopping.get() => {
                debug!(conn = %conn, "connection negotiation complete");
                conn.mark_open();
                true
            }
            Ok(()) => {
                self.destroy_connection(conn, RpcError::service_unavailable());
                false
            }
            Err(status) => {
                warn!(conn = %conn, %status, "connection negotiation failed");
                self.destroy_connection(conn, status);
                false
            }
        }
    }

    fn find_by_serial(&self, serial: u64) -> Option<Rc<Connection>> {
        if let Some(conn) = self.server_conns.borrow().get(&serial) {
            return Some(conn.clone());
        }
        if let Some(conn) = self.waiting_conns.borrow().get(&serial) {
            return Some(conn.clone());
        }
        self.client_conns
            .borrow()
            .values()
            .find(|conn| conn.serial() == serial)
            .cloned()
    }

    /// Unregisters `conn`, parks it in `waiting_conns` until its driver
    /// exits, and shuts it down with `status`, failing every in-flight
    /// call.
    pub(crate) fn destroy_connection(&self, conn: &Rc<Connection>, status: RpcError) {
        if conn.state() == ConnState::Closing {
            return;
        }
        debug!(conn = %conn, %status, "destroying connection");
        match conn.direction() {
            crate::connection::Direction::Client => {
                if let Some(conn_id) = conn.conn_id() {
                    if self.client_conns.borrow_mut().remove(conn_id).is_some() {
                        self.reactor.metrics().record_client_connection_closed();
                    }
                }
            }
            crate::connection::Direction::Server => {
                if self.server_conns.borrow_mut().remove(&conn.serial()).is_some() {
                    self.reactor.metrics().record_server_connection_closed();
                }
            }
        }
        self.waiting_conns
            .borrow_mut()
            .insert(conn.serial(), conn.clone());
        conn.shutdown(status);
    }

    /// Called by a connection's driver as its last act; releases the
    /// connection and re-evaluates shutdown progress.
    pub(crate) fn finish_connection(&self, conn: &Rc<Connection>) {
        debug_assert_eq!(conn.state(), ConnState::Closing);
        self.waiting_conns.borrow_mut().remove(&conn.serial());
        self.check_ready_to_stop();
    }

    /// Routes a serialized response back onto the server connection it
    /// belongs to; the response is dropped if the connection went away.
    pub(crate) fn queue_server_response(&self, serial: u64, call_id: i32, frame: Bytes) {
        let conn = self.server_conns.borrow().get(&serial).cloned();
        match conn {
            Some(conn) => conn.queue_response(call_id, frame),
            None => debug!(serial, call_id, "dropping response for departed connection"),
        }
    }

    fn scan_idle_connections(&self) {
        if self.stopping.get() {
            return;
        }
        let config = self.reactor.config();
        let keepalive = config.keepalive_timeout;
        let now = self.cur_time.get();
        if now.saturating_duration_since(self.last_keepalive_scan.get())
            < config.coarse_timer_granularity
        {
            return;
        }
        self.last_keepalive_scan.set(now);

        let mut victims = Vec::new();
        for conn in self.client_conns.borrow().values() {
            if Self::is_expired(conn, now, keepalive) {
                victims.push(conn.clone());
            }
        }
        for conn in self.server_conns.borrow().values() {
            if Self::is_expired(conn, now, keepalive) {
                victims.push(conn.clone());
            }
        }
        for conn in victims {
            info!(conn = %conn, "destroying idle connection past keepalive timeout");
            self.destroy_connection(
                &conn,
                RpcError::Network("connection idle beyond keepalive timeout".to_string()),
            );
        }
    }

    fn is_expired(conn: &Rc<Connection>, now: Instant, keepalive: Duration) -> bool {
        conn.state() == ConnState::Open
            && conn.is_idle()
            && now.saturating_duration_since(conn.last_activity_time()) > keepalive
    }

    /// Thread-side half of shutdown: fails queued calls, moves every
    /// connection into the draining set, and aborts all scheduled delayed
    /// tasks. The loop exits once the draining set empties.
    pub(crate) fn shutdown_internal(&self) {
        if self.stopping.replace(true) {
            return;
        }
        info!(reactor = self.reactor.name(), "reactor shutting down");
        let status = RpcError::service_unavailable();

        for call in self.reactor.drain_outbound_queue() {
            call.fail(status.clone());
        }

        let client: Vec<Rc<Connection>> = self
            .client_conns
            .borrow_mut()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in client {
            self.reactor.metrics().record_client_connection_closed();
            self.waiting_conns
                .borrow_mut()
                .insert(conn.serial(), conn.clone());
            conn.shutdown(status.clone());
        }
        let server: Vec<Rc<Connection>> = self
            .server_conns
            .borrow_mut()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in server {
            self.reactor.metrics().record_server_connection_closed();
            self.waiting_conns
                .borrow_mut()
                .insert(conn.serial(), conn.clone());
            conn.shutdown(status.clone());
        }

        let tasks: Vec<Arc<DelayedTask>> = self
            .scheduled_tasks
            .borrow_mut()
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in tasks {
            task.abort(status.clone());
        }
        self.check_ready_to_stop();
    }

    fn check_ready_to_stop(&self) {
        if self.stopping.get() && self.no_connections() {
            self.stop_wake.notify_one();
        }
    }

    fn no_connections(&self) -> bool {
        self.client_conns.borrow().is_empty()
            && self.server_conns.borrow().is_empty()
            && self.waiting_conns.borrow().is_empty()
    }

    /// Collects this reactor's slice of a running-RPC dump.
    pub(crate) fn dump_running_rpcs(&self, req: DumpRunningRpcsRequest) -> Vec<ConnectionInfo> {
        let name = self.reactor.name();
        let mut connections = Vec::new();
        for conn in self.client_conns.borrow().values() {
            connections.push(conn.dump(name, req.include_traces));
        }
        for conn in self.server_conns.borrow().values() {
            connections.push(conn.dump(name, req.include_traces));
        }
        connections
    }

    async fn main_loop(self: Rc<Self>) {
        let granularity = self.reactor.config().coarse_timer_granularity;
        let mut tick = tokio::time::interval(granularity);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(reactor = self.reactor.name(), "reactor thread running");
        loop {
            tokio::select! {
                () = self.reactor.task_queue_notified() => {
                    for task in self.reactor.drain_task_queue() {
                        task.run(&self);
                    }
                }
                _ = tick.tick() => {
                    self.cur_time.set(Instant::now());
                    self.scan_idle_connections();
                }
                () = self.stop_wake.notified() => {}
            }
            if self.stopping.get() && self.no_connections() {
                break;
            }
        }
    }
}

/// Entry point of a reactor's OS thread: builds the single-threaded
/// runtime, runs the event loop to completion, then aborts any tasks that
/// were already queued when the loop decided to exit.
pub(crate) fn run_reactor_thread(reactor: Arc<Reactor>) {
    reactor.set_thread_id(std::thread::current().id());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build reactor runtime");

    let now = Instant::now();
    let thread = Rc::new_cyclic(|self_weak| ReactorThread {
        reactor: reactor.clone(),
        self_weak: self_weak.clone(),
        client_conns: RefCell::new(HashMap::new()),
        server_conns: RefCell::new(HashMap::new()),
        waiting_conns: RefCell::new(HashMap::new()),
        scheduled_tasks: RefCell::new(HashMap::new()),
        cur_time: Cell::new(now),
        last_keepalive_scan: Cell::new(now),
        next_serial: Cell::new(1),
        stopping: Cell::new(false),
        stop_wake: Notify::new(),
    });

    let local = LocalSet::new();
    local.block_on(&runtime, thread.main_loop());

    for task in reactor.drain_task_queue() {
        task.abort(RpcError::service_unavailable());
    }
    debug!(reactor = reactor.name(), "reactor thread exited");
}
