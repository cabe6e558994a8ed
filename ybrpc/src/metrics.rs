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

//! Connection gauges for reactors and their messenger-level aggregation.
//!
//! Gauges are atomic so any thread can snapshot them while the owning
//! reactor thread updates them on connection registration and teardown.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

/// Live connection gauges for a single reactor.
///
/// # Examples
///
/// ```rust
/// use ybrpc::ReactorMetrics;
///
/// let metrics = ReactorMetrics::new();
/// metrics.record_client_connection_opened();
/// assert_eq!(metrics.snapshot().num_client_connections, 1);
/// metrics.record_client_connection_closed();
/// assert_eq!(metrics.snapshot().num_client_connections, 0);
/// ```
#[derive(Debug, Default)]
pub struct ReactorMetrics {
    client_connections: AtomicI64,
    server_connections: AtomicI64,
}

impl ReactorMetrics {
    /// Creates a zeroed gauge set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a client connection entering the reactor's registry.
    pub fn record_client_connection_opened(&self) {
        self.client_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a client connection leaving the reactor's registry.
    pub fn record_client_connection_closed(&self) {
        self.client_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records a server connection entering the reactor's registry.
    pub fn record_server_connection_opened(&self) {
        self.server_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a server connection leaving the reactor's registry.
    pub fn record_server_connection_closed(&self) {
        self.server_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Reads the gauges.
    #[must_use]
    pub fn snapshot(&self) -> ReactorMetricsSnapshot {
        ReactorMetricsSnapshot {
            num_client_connections: self.client_connections.load(Ordering::Relaxed),
            num_server_connections: self.server_connections.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one reactor's connection gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReactorMetricsSnapshot {
    /// Client (outbound) connections currently registered.
    pub num_client_connections: i64,
    /// Server (inbound) connections currently registered.
    pub num_server_connections: i64,
}

/// Connection gauges summed over every reactor of a messenger.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MessengerMetricsSnapshot {
    /// Client connections across all reactors.
    pub num_client_connections: i64,
    /// Server connections across all reactors.
    pub num_server_connections: i64,
    /// Per-reactor breakdown, in reactor-index order.
    pub reactors: Vec<ReactorMetricsSnapshot>,
}

impl MessengerMetricsSnapshot {
    /// Aggregates per-reactor snapshots.
    #[must_use]
    pub fn aggregate(reactors: Vec<ReactorMetricsSnapshot>) -> Self {
        let num_client_connections = reactors.iter().map(|r| r.num_client_connections).sum();
        let num_server_connections = reactors.iter().map(|r| r.num_server_connections).sum();
        Self {
            num_client_connections,
            num_server_connections,
            reactors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_track_open_and_close() {
        let metrics = ReactorMetrics::new();
        metrics.record_server_connection_opened();
        metrics.record_server_connection_opened();
        metrics.record_server_connection_closed();
        let snap = metrics.snapshot();
        assert_eq!(snap.num_server_connections, 1);
        assert_eq!(snap.num_client_connections, 0);
    }

    #[test]
    fn test_aggregate() {
        let a = ReactorMetricsSnapshot {
            num_client_connections: 2,
            num_server_connections: 1,
        };
        let b = ReactorMetricsSnapshot {
            num_client_connections: 0,
            num_server_connections: 4,
        };
        let total = MessengerMetricsSnapshot::aggregate(vec![a, b]);
        assert_eq!(total.num_client_connections, 2);
        assert_eq!(total.num_server_connections, 5);
        assert_eq!(total.reactors.len(), 2);
    }
}
