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

//! Units of work injected into a reactor from other threads.
//!
//! A [`ReactorTask`] is posted through
//! [`Reactor::schedule_task`](crate::Reactor::schedule_task) and runs on
//! the reactor's own thread, where it may freely touch connection state.
//! If the reactor shuts down before the task runs, [`ReactorTask::abort`]
//! is invoked instead, on whichever thread observes the shutdown, with
//! [`RpcError::ServiceUnavailable`]. Exactly one of `run` and `abort` is
//! called for every task.

use crate::error::RpcError;
use crate::reactor::thread::ReactorThread;

/// A unit of work executed on a reactor thread.
pub trait ReactorTask: Send + 'static {
    /// Runs the task. `thread` is guaranteed to be the current thread's
    /// reactor.
    fn run(self: Box<Self>, thread: &ReactorThread);

    /// Aborts the task because the reactor shut down before it could run.
    /// May be invoked from any thread.
    fn abort(self: Box<Self>, status: RpcError);
}

struct FunctorTask<F> {
    f: F,
}

impl<F> ReactorTask for FunctorTask<F>
where
    F: FnOnce(&ReactorThread) + Send + 'static,
{
    fn run(self: Box<Self>, thread: &ReactorThread) {
        (self.f)(thread);
    }

    fn abort(self: Box<Self>, _status: RpcError) {}
}

/// Wraps a closure as a [`ReactorTask`] whose abort is a no-op.
pub fn functor<F>(f: F) -> Box<dyn ReactorTask>
where
    F: FnOnce(&ReactorThread) + Send + 'static,
{
    Box::new(FunctorTask { f })
}
