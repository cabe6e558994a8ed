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

//! Shutdown semantics and cross-thread task injection.

use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ybrpc::{ConnectionId, Messenger, OutboundCall, RemoteMethod, UserCredentials};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

fn start_silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[test]
fn test_shutdown_fails_all_in_flight_calls() {
    init_logging();
    let addr = start_silent_server();
    let client = Messenger::builder("drain-client").reactor_count(2).build();

    // 100 calls spread over 10 connections (10 distinct users to the same
    // remote), none of which will ever be answered.
    let (tx, rx) = mpsc::channel();
    for user in 0..10 {
        let conn_id = ConnectionId::new(addr, UserCredentials::new(format!("user-{user}")));
        for _ in 0..10 {
            let tx = tx.clone();
            let call = OutboundCall::new(
                conn_id.clone(),
                RemoteMethod::new("MuteService", "Never"),
                Bytes::from_static(b"going nowhere"),
                None,
                Box::new(move |result| {
                    tx.send(result).expect("test receiver dropped");
                }),
            );
            client.queue_outbound_call(call);
        }
    }
    // Let the connections establish and the frames flush.
    std::thread::sleep(Duration::from_millis(200));

    client.shutdown();

    for _ in 0..100 {
        let result = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("a callback never fired");
        assert!(result.unwrap_err().is_service_unavailable());
    }
    assert!(rx.try_recv().is_err(), "more callbacks than calls");

    // The pool is drained: no connections remain.
    let metrics = client.metrics();
    assert_eq!(metrics.num_client_connections, 0);
    assert_eq!(metrics.num_server_connections, 0);
}

#[test]
fn test_work_injected_after_shutdown_is_aborted() {
    init_logging();
    let client = Messenger::builder("late-client").reactor_count(1).build();
    client.shutdown();

    let (tx, rx) = mpsc::channel();
    let conn_id = ConnectionId::new("127.0.0.1:1".parse().unwrap(), UserCredentials::default());
    let call = OutboundCall::new(
        conn_id,
        RemoteMethod::new("AnyService", "Any"),
        Bytes::new(),
        None,
        Box::new(move |result| {
            tx.send(result).expect("test receiver dropped");
        }),
    );
    client.queue_outbound_call(call);
    let result = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("callback never fired");
    assert!(result.unwrap_err().is_service_unavailable());

    let (task_tx, task_rx) = mpsc::channel();
    client.schedule_on_reactor(
        Duration::from_millis(1),
        Box::new(move |status| {
            task_tx.send(status).expect("test receiver dropped");
        }),
    );
    let status = task_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("delayed task callback never fired");
    assert!(status.unwrap_err().is_service_unavailable());
}

#[test]
fn test_cross_thread_fan_in_runs_every_task_once() {
    init_logging();
    let messenger = Messenger::builder("fan-in").reactor_count(4).build();
    let counter = Arc::new(AtomicUsize::new(0));

    const THREADS: usize = 8;
    const TASKS_PER_THREAD: usize = 1_000;

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let messenger = messenger.clone();
        let counter = counter.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..TASKS_PER_THREAD {
                let counter = counter.clone();
                messenger.schedule_on_reactor(
                    Duration::ZERO,
                    Box::new(move |status| {
                        status.expect("task aborted unexpectedly");
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while counter.load(Ordering::SeqCst) < THREADS * TASKS_PER_THREAD {
        assert!(Instant::now() < deadline, "fan-in tasks did not all run");
        std::thread::sleep(Duration::from_millis(10));
    }
    // Quiesce, then check nothing ran twice.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(counter.load(Ordering::SeqCst), THREADS * TASKS_PER_THREAD);

    messenger.shutdown();
}

#[test]
fn test_delayed_task_fire_and_abort() {
    init_logging();
    let messenger = Messenger::builder("timers").reactor_count(1).build();

    // Abort wins: the callback sees the abort status, and a second abort
    // reports the task as already done.
    let (tx, rx) = mpsc::channel();
    let id = messenger.schedule_on_reactor(
        Duration::from_secs(60),
        Box::new(move |status| {
            tx.send(status).expect("test receiver dropped");
        }),
    );
    assert!(messenger.abort_on_reactor(id));
    let status = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("abort callback never fired");
    assert!(status.is_err());
    assert!(!messenger.abort_on_reactor(id));

    // Fire wins: the callback sees Ok, and aborting afterwards is a no-op.
    let (tx, rx) = mpsc::channel();
    let id = messenger.schedule_on_reactor(
        Duration::from_millis(20),
        Box::new(move |status| {
            tx.send(status).expect("test receiver dropped");
        }),
    );
    let status = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("timer callback never fired");
    assert!(status.is_ok());
    assert!(!messenger.abort_on_reactor(id));

    messenger.shutdown();
}
