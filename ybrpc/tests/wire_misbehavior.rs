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

//! Misbehaving peers: call timeouts, duplicate call ids, oversized frames.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ybrpc::{
    ConnectionId, InboundCall, InboundCallHandler, Messenger, OutboundCall, RemoteMethod,
    UserCredentials, CONNECTION_HEADER,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// A raw TCP server that accepts connections and discards everything it
/// reads, never answering. Lives until its listener thread dies with the
/// process.
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

/// Records inbound call ids without ever responding.
#[derive(Default)]
struct CollectingHandler {
    seen: Mutex<Vec<i32>>,
}

impl InboundCallHandler for CollectingHandler {
    fn queue_inbound(&self, call: Arc<InboundCall>) {
        self.seen.lock().unwrap().push(call.call_id());
    }
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
fn test_call_times_out_exactly_once() {
    init_logging();
    let addr = start_silent_server();
    let client = Messenger::builder("timeout-client").reactor_count(1).build();
    let conn_id = ConnectionId::new(addr, UserCredentials::default());

    let (tx, rx) = mpsc::channel();
    let call = OutboundCall::new(
        conn_id,
        RemoteMethod::new("MuteService", "Never"),
        Bytes::from_static(b"anyone there?"),
        Some(Duration::from_millis(300)),
        Box::new(move |result| {
            tx.send(result).expect("test receiver dropped");
        }),
    );
    client.queue_outbound_call(call);

    let result = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("callback never fired");
    assert!(result.unwrap_err().is_timed_out());

    // The expiration timer and the teardown path must not double-fire.
    std::thread::sleep(Duration::from_millis(500));
    assert!(rx.try_recv().is_err());

    client.shutdown();
}

#[test]
fn test_duplicate_call_id_drops_connection() {
    init_logging();
    let handler = Arc::new(CollectingHandler::default());
    let server = Messenger::builder("dup-server")
        .reactor_count(1)
        .inbound_handler(handler.clone())
        .build();
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(&CONNECTION_HEADER).unwrap();
    let method = RemoteMethod::new("SomeService", "SomeMethod");
    let first = ybrpc::protocol::serialize_request(42, &method, 0, &Bytes::from_static(b"first"));
    let second =
        ybrpc::protocol::serialize_request(42, &method, 0, &Bytes::from_static(b"second"));
    stream.write_all(&first).unwrap();
    stream.write_all(&second).unwrap();

    // The first call reaches the handler; the duplicate kills the
    // connection, observable as EOF on our side.
    assert!(wait_until(Duration::from_secs(5), || {
        handler.seen.lock().unwrap().len() == 1
    }));
    assert_eq!(*handler.seen.lock().unwrap(), vec![42]);

    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected EOF after duplicate call id");

    assert!(wait_until(Duration::from_secs(5), || {
        server.metrics().num_server_connections == 0
    }));

    server.shutdown();
}

#[test]
fn test_oversized_frame_drops_connection_without_dispatch() {
    init_logging();
    let handler = Arc::new(CollectingHandler::default());
    let server = Messenger::builder("overflow-server")
        .reactor_count(1)
        .inbound_handler(handler.clone())
        .build();
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(&CONNECTION_HEADER).unwrap();
    // Length prefix of 8 MiB + 1: over the limit once the prefix itself is
    // counted.
    stream.write_all(&0x0080_0001u32.to_be_bytes()).unwrap();

    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected EOF after oversized frame");

    assert!(wait_until(Duration::from_secs(5), || {
        server.metrics().num_server_connections == 0
    }));
    assert!(handler.seen.lock().unwrap().is_empty());

    server.shutdown();
}
