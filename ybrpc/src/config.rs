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

//! Configuration for the messenger and its reactors.
//!
//! All tunables live in [`MessengerConfig`], constructed once and shared
//! immutably by every reactor; there is no process-wide mutable state. The
//! usual way to set these is through
//! [`MessengerBuilder`](crate::MessengerBuilder).

use std::time::Duration;

/// Tunables shared by a messenger and all of its reactors.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use ybrpc::MessengerConfig;
///
/// let config = MessengerConfig {
///     keepalive_timeout: Duration::from_secs(30),
///     ..Default::default()
/// };
/// assert_eq!(config.max_message_size, 8 * 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Maximum size of a single wire frame, including the 4-byte length
    /// prefix. Frames exceeding this tear down the connection.
    ///
    /// Default: 8 MiB
    pub max_message_size: usize,

    /// Connections idle longer than this are destroyed by the periodic
    /// keepalive scan.
    ///
    /// Default: 65 seconds
    pub keepalive_timeout: Duration,

    /// Granularity of the reactor's coarse clock and periodic timer. The
    /// keepalive scan runs on this cadence, and `cur_time` is refreshed at
    /// this resolution.
    ///
    /// Default: 100 milliseconds
    pub coarse_timer_granularity: Duration,

    /// Number of reactor threads in the pool.
    ///
    /// Default: the number of available CPU cores
    pub reactor_count: usize,

    /// Deadline for connection negotiation, measured from the moment the
    /// connection is registered. Covers the TCP connect for client
    /// connections.
    ///
    /// Default: 10 seconds
    pub negotiation_timeout: Duration,

    /// Inbound calls whose handling takes longer than this are logged at
    /// info level with their trace, independent of the client timeout.
    ///
    /// Default: 10 seconds
    pub slow_call_threshold: Duration,

    /// When set, every inbound call logs its trace on completion.
    ///
    /// Default: false
    pub dump_all_traces: bool,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            max_message_size: 8 * 1024 * 1024,
            keepalive_timeout: Duration::from_secs(65),
            coarse_timer_granularity: Duration::from_millis(100),
            reactor_count: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(4),
            negotiation_timeout: Duration::from_secs(10),
            slow_call_threshold: Duration::from_secs(10),
            dump_all_traces: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MessengerConfig::default();
        assert_eq!(config.max_message_size, 8 * 1024 * 1024);
        assert_eq!(config.keepalive_timeout, Duration::from_secs(65));
        assert_eq!(config.coarse_timer_granularity, Duration::from_millis(100));
        assert!(config.reactor_count >= 1);
        assert!(!config.dump_all_traces);
    }
}
