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

//! Single-shot delayed tasks with exactly-once fire-or-abort semantics.
//!
//! A [`DelayedTask`] wraps a callback that is invoked exactly once: with
//! `Ok(())` when its timer fires on the reactor thread, or with the abort
//! status when [`DelayedTask::abort`] wins the race, from any thread,
//! including before the timer was ever armed. The callback slot behind a
//! mutex is the linearization point: taking it decides the winner, and a
//! task aborted before arming never arms its timer afterwards.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Result, RpcError};
use crate::reactor::task::ReactorTask;
use crate::reactor::thread::ReactorThread;

/// Callback of a [`DelayedTask`]; receives `Ok(())` iff the timer fired.
pub type DelayedTaskFn = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// A scheduled callback that fires once or aborts once, never both.
pub struct DelayedTask {
    id: i64,
    delay: Duration,
    func: Mutex<Option<DelayedTaskFn>>,
    cancelled: Notify,
}

impl DelayedTask {
    pub(crate) fn new(id: i64, delay: Duration, func: DelayedTaskFn) -> Arc<Self> {
        Arc::new(Self {
            id,
            delay,
            func: Mutex::new(Some(func)),
            cancelled: Notify::new(),
        })
    }

    /// Identifier of this task within its reactor.
    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    pub(crate) fn delay(&self) -> Duration {
        self.delay
    }

    /// Aborts the task, invoking its callback with `status` on the calling
    /// thread. Returns `false` if the callback already ran (the timer
    /// fired first, or another abort won), in which case this is a no-op.
    pub fn abort(&self, status: RpcError) -> bool {
        let func = self.func.lock().take();
        match func {
            Some(func) => {
                // Wake the armed timer (if any) so the reactor drops its
                // bookkeeping entry without waiting out the full delay.
                self.cancelled.notify_one();
                func(Err(status));
                true
            }
            None => false,
        }
    }

    /// Whether the callback has already been claimed by a fire or an abort.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.func.lock().is_none()
    }

    pub(crate) fn take_func(&self) -> Option<DelayedTaskFn> {
        self.func.lock().take()
    }

    pub(crate) async fn cancelled(&self) {
        self.cancelled.notified().await;
    }
}

impl std::fmt::Debug for DelayedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedTask")
            .field("id", &self.id)
            .field("delay", &self.delay)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Reactor task that arms a [`DelayedTask`] once it reaches the reactor
/// thread; aborting it (reactor already closing) aborts the delayed task
/// itself.
pub(crate) struct ScheduleDelayedTask(Arc<DelayedTask>);

impl ScheduleDelayedTask {
    pub(crate) fn new(task: Arc<DelayedTask>) -> Self {
        Self(task)
    }
}

impl ReactorTask for ScheduleDelayedTask {
    fn run(self: Box<Self>, thread: &ReactorThread) {
        thread.arm_delayed(self.0);
    }

    fn abort(self: Box<Self>, status: RpcError) {
        self.0.abort(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_abort_invokes_callback_once() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        let task = DelayedTask::new(
            1,
            Duration::from_secs(60),
            Box::new(move |status| {
                assert!(status.is_err());
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(!task.is_done());
        assert!(task.abort(RpcError::Aborted("cancelled".into())));
        assert!(task.is_done());
        assert!(!task.abort(RpcError::Aborted("again".into())));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_racing_aborts_have_one_winner() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        let task = DelayedTask::new(
            2,
            Duration::from_secs(60),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut handles = Vec::new();
        let wins = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let task = task.clone();
            let wins = wins.clone();
            handles.push(thread::spawn(move || {
                if task.abort(RpcError::service_unavailable()) {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fire_beats_late_abort() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        let task = DelayedTask::new(
            3,
            Duration::from_millis(1),
            Box::new(move |status| {
                assert!(status.is_ok());
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // Simulate the timer path claiming the callback first.
        let func = task.take_func().unwrap();
        func(Ok(()));

        assert!(!task.abort(RpcError::Aborted("late".into())));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }
}
