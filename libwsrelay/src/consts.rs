// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

/// How often the transport sends a PING if the client hasn't been heard
/// from, matching the `pingInterval` advertised in the OPEN handshake.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(25_000);

/// How long the transport waits for a PONG before considering the
/// connection dead.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(20_000);

/// Largest single packet payload the server will accept, in bytes.
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 1_000_000;

/// How long a connection has to join at least one namespace before it is
/// closed for never completing a handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(45_000);

/// How long an unacknowledged EVENT/BINARY_EVENT waits for its ACK before
/// the ack coordinator fires the callback with a timeout error.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(20);

/// Interval at which the ack reaper thread wakes up to sweep expired
/// pending acks, independent of how long any individual ack's timeout is.
pub const ACK_REAPER_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// How long a disconnected socket's session state (room memberships,
/// buffered offset) is retained for a reconnecting client to recover.
pub const DEFAULT_RECOVERY_WINDOW: Duration = Duration::from_secs(120);

/// Maximum number of packets the recovery store buffers per room before it
/// starts dropping the oldest ones, bounding memory use during a partition.
pub const DEFAULT_RECOVERY_BUFFER_LEN: usize = 1_000;

/// Default namespace every client is implicitly connected to.
pub const ROOT_NAMESPACE: &str = "/";
