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

//! The messenger: a pool of reactors behind one handle.
//!
//! Outbound calls hash their [`ConnectionId`] onto a reactor, so repeated
//! calls to the same remote under the same credentials share one
//! connection. Inbound sockets are spread round-robin; once registered, a
//! socket lives on its reactor until torn down. The messenger also carries
//! the pool-wide surfaces: listening, delayed-task scheduling, running-RPC
//! introspection, metrics aggregation, and shutdown.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::call::{InboundCallHandler, OutboundCall, UnroutableHandler};
use crate::config::MessengerConfig;
use crate::error::{Result, RpcError};
use crate::introspection::{DumpRunningRpcsRequest, DumpRunningRpcsResponse};
use crate::metrics::MessengerMetricsSnapshot;
use crate::negotiation::{ConnectionHeaderNegotiator, Negotiator};
use crate::reactor::{DelayedTask, DelayedTaskFn, Reactor, ScheduleDelayedTask};

/// Handle to a reactor pool. Cheap to clone; all operations are callable
/// from any thread.
///
/// # Examples
///
/// ```rust,no_run
/// use bytes::Bytes;
/// use ybrpc::{
///     ConnectionId, Messenger, OutboundCall, RemoteMethod, UserCredentials,
/// };
///
/// let messenger = Messenger::builder("client").reactor_count(2).build();
/// let conn_id = ConnectionId::new("127.0.0.1:7100".parse().unwrap(), UserCredentials::default());
/// let call = OutboundCall::new(
///     conn_id,
///     RemoteMethod::new("EchoService", "Echo"),
///     Bytes::from_static(b"hello"),
///     Some(std::time::Duration::from_secs(5)),
///     Box::new(|result| println!("{result:?}")),
/// );
/// messenger.queue_outbound_call(call);
/// messenger.shutdown();
/// ```
#[derive(Clone)]
pub struct Messenger {
    core: Arc<MessengerCore>,
}

pub(crate) struct MessengerCore {
    name: String,
    config: Arc<MessengerConfig>,
    reactors: Vec<Arc<Reactor>>,
    next_inbound: AtomicUsize,
    next_schedule: AtomicUsize,
    next_scheduled_id: AtomicI64,
    scheduled: Mutex<HashMap<i64, Arc<DelayedTask>>>,
    closing: AtomicBool,
}

impl Messenger {
    /// Starts building a messenger with the given name.
    pub fn builder(name: impl Into<String>) -> MessengerBuilder {
        MessengerBuilder::new(name)
    }

    /// The messenger's name; reactor threads are named after it.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The shared configuration.
    #[must_use]
    pub fn config(&self) -> &MessengerConfig {
        &self.core.config
    }

    /// Number of reactors in the pool.
    #[must_use]
    pub fn reactor_count(&self) -> usize {
        self.core.reactors.len()
    }

    /// Whether shutdown has been initiated.
    #[must_use]
    pub fn closing(&self) -> bool {
        self.core.closing.load(Ordering::Acquire)
    }

    /// Queues an outbound call onto the reactor owning its connection.
    /// The call's callback fires exactly once: with the response, or with
    /// a terminal status if the call cannot be delivered.
    pub fn queue_outbound_call(&self, call: Arc<OutboundCall>) {
        self.reactor_for(call.conn_id()).queue_outbound_call(call);
    }

    fn reactor_for(&self, conn_id: &crate::ConnectionId) -> &Arc<Reactor> {
        let mut hasher = DefaultHasher::new();
        conn_id.hash(&mut hasher);
        let index = (hasher.finish() % self.core.reactors.len() as u64) as usize;
        &self.core.reactors[index]
    }

    /// Assigns an accepted socket to a reactor (round-robin) as a server
    /// connection. If the messenger is shutting down the socket is closed.
    pub fn register_inbound_socket(&self, socket: std::net::TcpStream, remote: SocketAddr) {
        self.core.register_inbound_socket(socket, remote);
    }

    /// Binds `addr` and accepts connections for the lifetime of the
    /// messenger, registering each accepted socket on a reactor. Returns
    /// the bound local address (useful with port `0`).
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| RpcError::Network(format!("bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RpcError::from_io("local_addr", &e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| RpcError::from_io("set listener non-blocking", &e))?;

        let core = Arc::downgrade(&self.core);
        self.core.reactors[0].run_on_reactor_thread(move |_thread| -> Result<()> {
            let listener = tokio::net::TcpListener::from_std(listener)
                .map_err(|e| RpcError::from_io("register listener", &e))?;
            tokio::task::spawn_local(accept_loop(listener, core));
            Ok(())
        })??;
        debug!(addr = %local_addr, "messenger listening");
        Ok(local_addr)
    }

    /// Schedules `func` to run `delay` from now on one of the reactors,
    /// returning an id usable with [`Messenger::abort_on_reactor`]. The
    /// callback receives `Ok(())` when the timer fires, or the abort
    /// status; it is invoked exactly once either way.
    pub fn schedule_on_reactor(&self, delay: Duration, func: DelayedTaskFn) -> i64 {
        let core = &self.core;
        let id = core.next_scheduled_id.fetch_add(1, Ordering::Relaxed);
        let index = core.next_schedule.fetch_add(1, Ordering::Relaxed) % core.reactors.len();
        let reactor = &core.reactors[index];

        let registry = Arc::downgrade(core);
        let wrapped: DelayedTaskFn = Box::new(move |status| {
            if let Some(core) = registry.upgrade() {
                core.scheduled.lock().remove(&id);
            }
            func(status);
        });
        let task = DelayedTask::new(reactor.next_task_id(), delay, wrapped);
        core.scheduled.lock().insert(id, task.clone());
        reactor.schedule_task(Box::new(ScheduleDelayedTask::new(task)));
        id
    }

    /// Aborts a task scheduled with [`Messenger::schedule_on_reactor`].
    /// Returns `false` if it already fired, aborted, or never existed.
    pub fn abort_on_reactor(&self, id: i64) -> bool {
        let task = self.core.scheduled.lock().remove(&id);
        match task {
            Some(task) => task.abort(RpcError::Aborted("task aborted by caller".to_string())),
            None => false,
        }
    }

    /// Enumerates every connection and in-flight call across the pool.
    pub fn dump_running_rpcs(
        &self,
        req: DumpRunningRpcsRequest,
    ) -> Result<DumpRunningRpcsResponse> {
        let mut response = DumpRunningRpcsResponse::default();
        for reactor in &self.core.reactors {
            response.connections.extend(reactor.dump_running_rpcs(req)?);
        }
        Ok(response)
    }

    /// Connection gauges aggregated over the pool.
    #[must_use]
    pub fn metrics(&self) -> MessengerMetricsSnapshot {
        MessengerMetricsSnapshot::aggregate(
            self.core
                .reactors
                .iter()
                .map(|reactor| reactor.metrics().snapshot())
                .collect(),
        )
    }

    /// Shuts down every reactor and blocks until their threads exit.
    /// After this returns, every in-flight call has been failed with
    /// `ServiceUnavailable` and no further injected work will run.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.core.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(messenger = %self.core.name, "messenger shutting down");
        for reactor in &self.core.reactors {
            reactor.shutdown();
        }
        for reactor in &self.core.reactors {
            reactor.join();
        }
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("name", &self.core.name)
            .field("reactors", &self.core.reactors.len())
            .field("closing", &self.closing())
            .finish()
    }
}

impl MessengerCore {
    fn register_inbound_socket(&self, socket: std::net::TcpStream, remote: SocketAddr) {
        let index = self.next_inbound.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        self.reactors[index].register_inbound_socket(socket, remote);
    }
}

impl Drop for MessengerCore {
    fn drop(&mut self) {
        // Last handle gone: make sure the reactor threads wind down even if
        // the owner never called shutdown(). No join here.
        for reactor in &self.reactors {
            reactor.shutdown();
        }
    }
}

async fn accept_loop(listener: tokio::net::TcpListener, core: Weak<MessengerCore>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let Some(core) = core.upgrade() else {
                    return;
                };
                match stream.into_std() {
                    Ok(stream) => core.register_inbound_socket(stream, remote),
                    Err(e) => warn!(%remote, error = %e, "failed to adopt accepted socket"),
                }
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Builder for [`Messenger`], carrying all of its tunables.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use ybrpc::Messenger;
///
/// let messenger = Messenger::builder("my-service")
///     .reactor_count(2)
///     .keepalive_timeout(Duration::from_secs(30))
///     .build();
/// assert_eq!(messenger.reactor_count(), 2);
/// messenger.shutdown();
/// ```
pub struct MessengerBuilder {
    name: String,
    config: MessengerConfig,
    negotiator: Arc<dyn Negotiator>,
    handler: Arc<dyn InboundCallHandler>,
}

impl MessengerBuilder {
    /// Starts a builder with default configuration, the connection-header
    /// negotiator, and a handler that rejects every inbound call.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: MessengerConfig::default(),
            negotiator: Arc::new(ConnectionHeaderNegotiator),
            handler: Arc::new(UnroutableHandler),
        }
    }

    /// Sets the number of reactor threads (minimum 1).
    #[must_use]
    pub fn reactor_count(mut self, count: usize) -> Self {
        self.config.reactor_count = count.max(1);
        self
    }

    /// Sets the maximum wire frame size.
    #[must_use]
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.config.max_message_size = bytes;
        self
    }

    /// Sets how long a connection may sit idle before the keepalive scan
    /// destroys it.
    #[must_use]
    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.config.keepalive_timeout = timeout;
        self
    }

    /// Sets the coarse timer granularity.
    #[must_use]
    pub fn coarse_timer_granularity(mut self, granularity: Duration) -> Self {
        self.config.coarse_timer_granularity = granularity;
        self
    }

    /// Sets the negotiation deadline for new connections.
    #[must_use]
    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.config.negotiation_timeout = timeout;
        self
    }

    /// Sets the slow-call logging threshold.
    #[must_use]
    pub fn slow_call_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_threshold = threshold;
        self
    }

    /// Logs every inbound call's trace on completion.
    #[must_use]
    pub fn dump_all_traces(mut self, enabled: bool) -> Self {
        self.config.dump_all_traces = enabled;
        self
    }

    /// Replaces the connection negotiator.
    #[must_use]
    pub fn negotiator(mut self, negotiator: Arc<dyn Negotiator>) -> Self {
        self.negotiator = negotiator;
        self
    }

    /// Installs the sink inbound calls are dispatched to.
    #[must_use]
    pub fn inbound_handler(mut self, handler: Arc<dyn InboundCallHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Spawns the reactor pool and returns its handle.
    #[must_use]
    pub fn build(self) -> Messenger {
        let config = Arc::new(self.config);
        let reactors: Vec<Arc<Reactor>> = (0..config.reactor_count)
            .map(|index| {
                Reactor::spawn(
                    format!("{}-reactor-{index}", self.name),
                    config.clone(),
                    self.negotiator.clone(),
                    self.handler.clone(),
                )
            })
            .collect();
        Messenger {
            core: Arc::new(MessengerCore {
                name: self.name,
                config,
                reactors,
                next_inbound: AtomicUsize::new(0),
                next_schedule: AtomicUsize::new(0),
                next_scheduled_id: AtomicI64::new(1),
                scheduled: Mutex::new(HashMap::new()),
                closing: AtomicBool::new(false),
            }),
        }
    }
}
