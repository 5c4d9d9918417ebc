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

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::instrument;
use wsrelay_protocol::Value;

/// One packet that was broadcast to a room, kept around in case a
/// disconnected member reconnects and needs it replayed.
#[derive(Clone)]
struct BufferedPacket {
    offset: u64,
    event: Value,
}

/// What a disconnected socket looked like at the moment it dropped:
/// which rooms it belonged to, and the highest offset it had already
/// seen, so replay on reconnect doesn't resend anything twice.
struct StoredSession {
    rooms: HashSet<String>,
    disconnected_at: Instant,
}

/// The result of a successful recovery: the room memberships to restore
/// and every buffered packet the reconnecting socket missed, oldest
/// first.
pub struct Recovered {
    pub rooms: HashSet<String>,
    pub missed: Vec<Value>,
}

/// Buffers recent room broadcasts and disconnected-session metadata so
/// that a client which reconnects with its private session id (`pid`)
/// within the recovery window can rejoin its rooms and replay whatever it
/// missed, instead of starting over with a brand new socket identity.
///
/// Mirrors a restore-strategy-behind-a-trait split in spirit -- the
/// actual buffering strategy here is a fixed-length ring per room, but it
/// is intentionally the only strategy implemented since Socket.IO-style
/// session recovery doesn't need to be pluggable the way terminal replay
/// does.
pub struct RecoveryStore {
    window: Duration,
    buffer_len: usize,
    next_offset: AtomicU64,
    room_buffers: Mutex<HashMap<String, VecDeque<BufferedPacket>>>,
    sessions: Mutex<HashMap<String, StoredSession>>,
    stop: Arc<(Mutex<bool>, std::sync::Condvar)>,
}

impl RecoveryStore {
    pub fn spawn(window: Duration, buffer_len: usize, sweep_interval: Duration) -> Arc<RecoveryStore> {
        let store = Arc::new(RecoveryStore {
            window,
            buffer_len,
            next_offset: AtomicU64::new(0),
            room_buffers: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            stop: Arc::new((Mutex::new(false), std::sync::Condvar::new())),
        });
        let reaper = Arc::clone(&store);
        thread::spawn(move || reaper_loop(reaper, sweep_interval));
        store
    }

    pub fn shutdown(&self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    /// Records a packet broadcast to `rooms`, assigning it the next
    /// monotonically increasing offset. Each room's buffer is trimmed to
    /// `buffer_len` entries, oldest first.
    #[instrument(skip(self, event))]
    pub fn record_broadcast(&self, rooms: &[String], event: Value) -> u64 {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        let mut buffers = self.room_buffers.lock().unwrap();
        for room in rooms {
            let buf = buffers.entry(room.clone()).or_default();
            buf.push_back(BufferedPacket { offset, event: event.clone() });
            while buf.len() > self.buffer_len {
                buf.pop_front();
            }
        }
        offset
    }

    /// Snapshots a disconnecting socket's room memberships under its
    /// private session id so a later `recover` call can find them.
    pub fn store_session(&self, pid: &str, rooms: HashSet<String>) {
        self.sessions.lock().unwrap().insert(
            pid.to_string(),
            StoredSession { rooms, disconnected_at: Instant::now() },
        );
    }

    /// Attempts to recover a previously disconnected session. Consumes
    /// the stored record on success: recovery state is meant to be used
    /// exactly once per disconnect/reconnect pair.
    pub fn recover(&self, pid: &str, last_seen_offset: Option<u64>) -> Option<Recovered> {
        let stored = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.remove(pid)
        }?;
        if stored.disconnected_at.elapsed() > self.window {
            return None;
        }

        let buffers = self.room_buffers.lock().unwrap();
        let mut missed: Vec<BufferedPacket> = stored
            .rooms
            .iter()
            .filter_map(|room| buffers.get(room))
            .flat_map(|buf| buf.iter().cloned())
            .filter(|p| last_seen_offset.map(|seen| p.offset > seen).unwrap_or(true))
            .collect();
        missed.sort_by_key(|p| p.offset);
        missed.dedup_by_key(|p| p.offset);

        Some(Recovered { rooms: stored.rooms, missed: missed.into_iter().map(|p| p.event).collect() })
    }

    fn sweep_expired(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, s| s.disconnected_at.elapsed() <= self.window);
    }
}

fn reaper_loop(store: Arc<RecoveryStore>, interval: Duration) {
    let (lock, cvar) = &*store.stop;
    let mut stopped = lock.lock().unwrap();
    loop {
        let (guard, timeout_result) = cvar.wait_timeout(stopped, interval).unwrap();
        stopped = guard;
        if *stopped {
            return;
        }
        if timeout_result.timed_out() {
            store.sweep_expired();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recovers_missed_packets_for_joined_rooms() {
        let store = RecoveryStore::spawn(Duration::from_secs(60), 100, Duration::from_millis(10));
        let o1 = store.record_broadcast(&["room-a".to_string()], Value::String("one".to_string()));
        store.store_session("pid-1", HashSet::from(["room-a".to_string()]));
        let o2 = store.record_broadcast(&["room-a".to_string()], Value::String("two".to_string()));
        assert_eq!(o2, o1 + 1);

        let recovered = store.recover("pid-1", Some(o1)).unwrap();
        assert_eq!(recovered.missed, vec![Value::String("two".to_string())]);
        store.shutdown();
    }

    #[test]
    fn recover_is_single_use() {
        let store = RecoveryStore::spawn(Duration::from_secs(60), 100, Duration::from_millis(10));
        store.store_session("pid-1", HashSet::new());
        assert!(store.recover("pid-1", None).is_some());
        assert!(store.recover("pid-1", None).is_none());
        store.shutdown();
    }

    #[test]
    fn recover_ignores_other_rooms() {
        let store = RecoveryStore::spawn(Duration::from_secs(60), 100, Duration::from_millis(10));
        store.record_broadcast(&["room-b".to_string()], Value::String("noise".to_string()));
        store.store_session("pid-1", HashSet::from(["room-a".to_string()]));

        let recovered = store.recover("pid-1", None).unwrap();
        assert!(recovered.missed.is_empty());
        store.shutdown();
    }
}
