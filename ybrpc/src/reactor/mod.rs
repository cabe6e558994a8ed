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

//! Reactors: single-threaded event loops plus their thread-safe handles.
//!
//! [`Reactor`] is the façade foreign threads use to post tasks, queue
//! outbound calls, register accepted sockets, initiate shutdown. The only
//! cross-thread surfaces are the pending-task list and the outbound-call
//! queue, each behind its own mutex, the `closing` flag, and the async
//! waker. Everything else lives in
//! [`ReactorThread`](crate::reactor::thread::ReactorThread) and is touched
//! solely by the loop itself.
//!
//! Once `closing` flips, every subsequent task or call injection is
//! rejected and aborted with [`RpcError::ServiceUnavailable`]; the flag is
//! set under the pending-task lock, so no task can slip in behind the
//! shutdown task.

pub(crate) mod delayed;
pub(crate) mod task;
pub(crate) mod thread;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread::{JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::call::{InboundCallHandler, OutboundCall};
use crate::config::MessengerConfig;
use crate::error::{Result, RpcError};
use crate::introspection::{ConnectionInfo, DumpRunningRpcsRequest};
use crate::metrics::ReactorMetrics;
use crate::negotiation::Negotiator;

pub use delayed::{DelayedTask, DelayedTaskFn};
pub(crate) use delayed::ScheduleDelayedTask;
pub use task::{functor, ReactorTask};
pub use thread::ReactorThread;

/// Thread-safe handle to one reactor. All operations may be called from
/// any thread; work is marshalled onto the reactor's own thread through
/// the task queue and its waker.
pub struct Reactor {
    name: String,
    config: Arc<MessengerConfig>,
    negotiator: Arc<dyn Negotiator>,
    handler: Arc<dyn InboundCallHandler>,
    closing: AtomicBool,
    pending_tasks: Mutex<Vec<Box<dyn ReactorTask>>>,
    waker: Notify,
    outbound_queue: Mutex<Vec<Arc<OutboundCall>>>,
    next_task_id: AtomicI64,
    metrics: ReactorMetrics,
    thread_id: OnceLock<ThreadId>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// Creates the reactor and spawns its event-loop thread.
    pub(crate) fn spawn(
        name: String,
        config: Arc<MessengerConfig>,
        negotiator: Arc<dyn Negotiator>,
        handler: Arc<dyn InboundCallHandler>,
    ) -> Arc<Self> {
        let reactor = Arc::new(Self {
            name: name.clone(),
            config,
            negotiator,
            handler,
            closing: AtomicBool::new(false),
            pending_tasks: Mutex::new(Vec::new()),
            waker: Notify::new(),
            outbound_queue: Mutex::new(Vec::new()),
            next_task_id: AtomicI64::new(1),
            metrics: ReactorMetrics::new(),
            thread_id: OnceLock::new(),
            join_handle: Mutex::new(None),
        });
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn({
                let reactor = reactor.clone();
                move || thread::run_reactor_thread(reactor)
            })
            .expect("failed to spawn reactor thread");
        *reactor.join_handle.lock() = Some(handle);
        reactor
    }

    /// The reactor's name, also its thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared messenger configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<MessengerConfig> {
        &self.config
    }

    /// This reactor's connection gauges.
    #[must_use]
    pub fn metrics(&self) -> &ReactorMetrics {
        &self.metrics
    }

    /// Whether shutdown has been initiated. Monotonic: once `true`, never
    /// `false` again.
    #[must_use]
    pub fn closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Whether the calling thread is this reactor's event-loop thread.
    #[must_use]
    pub fn is_current_thread(&self) -> bool {
        self.thread_id.get() == Some(&std::thread::current().id())
    }

    pub(crate) fn set_thread_id(&self, id: ThreadId) {
        let _ = self.thread_id.set(id);
    }

    pub(crate) fn next_task_id(&self) -> i64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn negotiator(&self) -> Arc<dyn Negotiator> {
        self.negotiator.clone()
    }

    pub(crate) fn handler(&self) -> Arc<dyn InboundCallHandler> {
        self.handler.clone()
    }

    /// Posts a task to run on the reactor thread. If the reactor is
    /// closing, the task is aborted immediately with `ServiceUnavailable`
    /// instead.
    pub fn schedule_task(&self, task: Box<dyn ReactorTask>) {
        {
            let mut pending = self.pending_tasks.lock();
            if !self.closing.load(Ordering::Acquire) {
                pending.push(task);
                drop(pending);
                self.waker.notify_one();
                return;
            }
        }
        task.abort(RpcError::service_unavailable());
    }

    pub(crate) fn drain_task_queue(&self) -> Vec<Box<dyn ReactorTask>> {
        std::mem::take(&mut *self.pending_tasks.lock())
    }

    pub(crate) async fn task_queue_notified(&self) {
        self.waker.notified().await;
    }

    /// Queues an outbound call for assignment to a connection. Fails the
    /// call with `ServiceUnavailable` if the reactor is closing.
    pub fn queue_outbound_call(&self, call: Arc<OutboundCall>) {
        {
            let mut queue = self.outbound_queue.lock();
            if !self.closing.load(Ordering::Acquire) {
                queue.push(call);
                drop(queue);
                self.schedule_task(task::functor(|thread| thread.process_outbound_queue()));
                return;
            }
        }
        call.fail(RpcError::service_unavailable());
    }

    pub(crate) fn drain_outbound_queue(&self) -> Vec<Arc<OutboundCall>> {
        std::mem::take(&mut *self.outbound_queue.lock())
    }

    /// Hands an accepted socket to the reactor as a new server connection.
    /// If the reactor is already shut down, the socket is simply closed.
    pub fn register_inbound_socket(&self, socket: std::net::TcpStream, remote: SocketAddr) {
        self.schedule_task(Box::new(RegisterInboundTask { socket, remote }));
    }

    /// Runs `f` on the reactor thread and blocks until it completes.
    /// Returns `ServiceUnavailable` if the reactor shuts down first.
    ///
    /// Must not be called from the reactor thread itself.
    pub fn run_on_reactor_thread<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReactorThread) -> T + Send + 'static,
        T: Send + 'static,
    {
        debug_assert!(
            !self.is_current_thread(),
            "run_on_reactor_thread would deadlock on the reactor thread"
        );
        let (tx, rx) = mpsc::channel();
        self.schedule_task(Box::new(RunOnReactorTask { f, tx }));
        match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(RpcError::service_unavailable()),
        }
    }

    /// Enumerates this reactor's connections and in-flight calls.
    pub fn dump_running_rpcs(&self, req: DumpRunningRpcsRequest) -> Result<Vec<ConnectionInfo>> {
        self.run_on_reactor_thread(move |thread| thread.dump_running_rpcs(req))
    }

    /// Initiates shutdown: flips `closing` and posts the shutdown task.
    /// Idempotent; pair with [`Reactor::join`] to wait for the drain.
    pub fn shutdown(&self) {
        let mut pending = self.pending_tasks.lock();
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        // Queued behind any tasks that made it in before the flag flipped.
        pending.push(task::functor(|thread| thread.shutdown_internal()));
        drop(pending);
        self.waker.notify_one();
    }

    /// Blocks until the reactor thread has exited.
    pub fn join(&self) {
        let handle = self.join_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("name", &self.name)
            .field("closing", &self.closing())
            .finish_non_exhaustive()
    }
}

struct RegisterInboundTask {
    socket: std::net::TcpStream,
    remote: SocketAddr,
}

impl ReactorTask for RegisterInboundTask {
    fn run(self: Box<Self>, thread: &ReactorThread) {
        let this = *self;
        thread.register_inbound_socket(this.socket, this.remote);
    }

    fn abort(self: Box<Self>, status: RpcError) {
        // Dropping the socket closes it.
        debug!(remote = %self.remote, %status, "closing inbound socket");
    }
}

struct RunOnReactorTask<F, T> {
    f: F,
    tx: mpsc::Sender<Result<T>>,
}

impl<F, T> ReactorTask for RunOnReactorTask<F, T>
where
    F: FnOnce(&ReactorThread) -> T + Send + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>, thread: &ReactorThread) {
        let this = *self;
        let _ = this.tx.send(Ok((this.f)(thread)));
    }

    fn abort(self: Box<Self>, status: RpcError) {
        let _ = self.tx.send(Err(status));
    }
}
