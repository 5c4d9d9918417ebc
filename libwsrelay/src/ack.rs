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

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{instrument, trace};
use wsrelay_protocol::Value;

/// The final disposition of a pending acknowledgement, delivered exactly
/// once regardless of which of the three ways it can resolve actually
/// happened.
#[derive(Debug, Clone)]
pub enum AckOutcome {
    /// Every expected reply arrived.
    Responses(Vec<Value>),
    /// The deadline passed before every expected reply arrived; carries
    /// whatever replies did make it in time.
    Timeout(Vec<Value>),
    /// The sole target of a point-to-point ack disconnected before
    /// replying.
    Disconnected,
    /// The emit was never sent because its event name is reserved.
    Rejected(String),
}

type AckCallback = Box<dyn FnOnce(AckOutcome) + Send>;

enum PendingKind {
    /// Waiting on exactly one socket to reply.
    Single(String),
    /// Waiting on every socket in this set to reply; sockets are removed
    /// as they reply or disconnect.
    Broadcast(HashSet<String>),
}

struct PendingAck {
    kind: PendingKind,
    responses: Vec<Value>,
    deadline: Instant,
    callback: AckCallback,
}

/// Tracks every in-flight acknowledgement and resolves each one exactly
/// once, whether that's because every expected reply showed up, the
/// deadline passed, or (for a point-to-point ack) the lone target socket
/// disconnected first.
///
/// A background thread sweeps for expired deadlines on a fixed interval
/// rather than scheduling a timer per ack, the same trade made by a
/// periodic reaper over a one-shot-timer-per-entry design: one thread
/// serves an unbounded number of pending acks.
pub struct AckCoordinator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingAck>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
}

impl AckCoordinator {
    /// Builds a coordinator and starts its reaper thread, which wakes
    /// every `sweep_interval` to expire any ack past its deadline.
    pub fn spawn(sweep_interval: Duration) -> Arc<AckCoordinator> {
        let coord = Arc::new(AckCoordinator {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            stop: Arc::new((Mutex::new(false), Condvar::new())),
        });

        let reaper = Arc::clone(&coord);
        thread::spawn(move || reaper_loop(reaper, sweep_interval));

        coord
    }

    /// Signals the reaper thread to exit. Does not resolve any still
    /// pending acks; callers that care should drain them first.
    pub fn shutdown(&self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    pub fn next_ack_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a point-to-point ack awaiting exactly one reply from
    /// `target`.
    #[instrument(skip(self, callback))]
    pub fn register_single(
        &self,
        ack_id: u64,
        target: String,
        timeout: Duration,
        callback: AckCallback,
    ) {
        let entry = PendingAck {
            kind: PendingKind::Single(target),
            responses: Vec::new(),
            deadline: Instant::now() + timeout,
            callback,
        };
        self.pending.lock().unwrap().insert(ack_id, entry);
    }

    /// Registers a broadcast ack awaiting one reply from every socket in
    /// `targets`. An empty `targets` set never happens for a real
    /// broadcast ack: a broadcast to zero sockets never allocates an ack
    /// id in the first place, since there is nothing to wait for.
    #[instrument(skip(self, callback))]
    pub fn register_broadcast(
        &self,
        ack_id: u64,
        targets: HashSet<String>,
        timeout: Duration,
        callback: AckCallback,
    ) {
        let entry = PendingAck {
            kind: PendingKind::Broadcast(targets),
            responses: Vec::new(),
            deadline: Instant::now() + timeout,
            callback,
        };
        self.pending.lock().unwrap().insert(ack_id, entry);
    }

    /// Records a reply from `from_sid` for `ack_id`. Fires the callback
    /// and drops the entry once every expected reply is in.
    pub fn record_response(&self, ack_id: u64, from_sid: &str, value: Value) {
        let completed = {
            let mut pending = self.pending.lock().unwrap();
            let Some(entry) = pending.get_mut(&ack_id) else { return };
            match &mut entry.kind {
                PendingKind::Single(target) if target == from_sid => {
                    entry.responses.push(value);
                    true
                }
                PendingKind::Single(_) => false,
                PendingKind::Broadcast(waiting) => {
                    if waiting.remove(from_sid) {
                        entry.responses.push(value);
                    }
                    waiting.is_empty()
                }
            }
        };
        if completed {
            self.fire(ack_id, |responses| AckOutcome::Responses(responses));
        }
    }

    /// Notifies the coordinator that `sid` has disconnected, so any ack
    /// waiting on it can resolve instead of waiting out the full timeout.
    pub fn record_disconnect(&self, sid: &str) {
        let mut to_fire_disconnected = Vec::new();
        let mut to_fire_complete = Vec::new();
        {
            let mut pending = self.pending.lock().unwrap();
            for (&ack_id, entry) in pending.iter_mut() {
                match &mut entry.kind {
                    PendingKind::Single(target) if target == sid => {
                        to_fire_disconnected.push(ack_id);
                    }
                    PendingKind::Broadcast(waiting) => {
                        if waiting.remove(sid) && waiting.is_empty() {
                            to_fire_complete.push(ack_id);
                        }
                    }
                    _ => {}
                }
            }
        }
        for ack_id in to_fire_disconnected {
            self.fire(ack_id, |_| AckOutcome::Disconnected);
        }
        for ack_id in to_fire_complete {
            self.fire(ack_id, AckOutcome::Responses);
        }
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<u64> = {
            let pending = self.pending.lock().unwrap();
            pending.iter().filter(|(_, e)| e.deadline <= now).map(|(&id, _)| id).collect()
        };
        for ack_id in expired {
            trace!(ack_id, "ack deadline expired");
            self.fire(ack_id, AckOutcome::Timeout);
        }
    }

    fn fire(&self, ack_id: u64, outcome_of: impl FnOnce(Vec<Value>) -> AckOutcome) {
        let entry = self.pending.lock().unwrap().remove(&ack_id);
        if let Some(entry) = entry {
            (entry.callback)(outcome_of(entry.responses));
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

fn reaper_loop(coord: Arc<AckCoordinator>, interval: Duration) {
    let (lock, cvar) = &*coord.stop;
    let mut stopped = lock.lock().unwrap();
    loop {
        let (guard, timeout_result) = cvar.wait_timeout(stopped, interval).unwrap();
        stopped = guard;
        if *stopped {
            return;
        }
        if timeout_result.timed_out() {
            coord.sweep_expired();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::mpsc;

    #[test]
    fn single_ack_fires_on_response() {
        let coord = AckCoordinator::spawn(Duration::from_millis(10));
        let (tx, rx) = mpsc::channel();
        coord.register_single(1, "s1".to_string(), Duration::from_secs(5), Box::new(move |o| {
            tx.send(o).unwrap();
        }));
        coord.record_response(1, "s1", Value::String("pong".to_string()));
        assert_matches!(rx.recv().unwrap(), AckOutcome::Responses(v) if v == vec![Value::String("pong".to_string())]);
        assert_eq!(coord.pending_count(), 0);
        coord.shutdown();
    }

    #[test]
    fn single_ack_fires_on_disconnect() {
        let coord = AckCoordinator::spawn(Duration::from_millis(10));
        let (tx, rx) = mpsc::channel();
        coord.register_single(1, "s1".to_string(), Duration::from_secs(5), Box::new(move |o| {
            tx.send(o).unwrap();
        }));
        coord.record_disconnect("s1");
        match rx.recv().unwrap() {
            AckOutcome::Disconnected => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        coord.shutdown();
    }

    #[test]
    fn broadcast_ack_requires_every_target() {
        let coord = AckCoordinator::spawn(Duration::from_millis(10));
        let (tx, rx) = mpsc::channel();
        let targets: HashSet<String> = ["s1".to_string(), "s2".to_string()].into();
        coord.register_broadcast(1, targets, Duration::from_secs(5), Box::new(move |o| {
            tx.send(o).unwrap();
        }));
        coord.record_response(1, "s1", Value::Number(1.0));
        assert_eq!(coord.pending_count(), 1);
        coord.record_response(1, "s2", Value::Number(2.0));
        match rx.recv().unwrap() {
            AckOutcome::Responses(v) => assert_eq!(v.len(), 2),
            other => panic!("unexpected outcome {:?}", other),
        }
        coord.shutdown();
    }

    #[test]
    #[ntest::timeout(2000)]
    fn broadcast_ack_times_out_with_partial_responses() {
        let coord = AckCoordinator::spawn(Duration::from_millis(5));
        let (tx, rx) = mpsc::channel();
        let targets: HashSet<String> = ["s1".to_string(), "s2".to_string()].into();
        coord.register_broadcast(1, targets, Duration::from_millis(20), Box::new(move |o| {
            tx.send(o).unwrap();
        }));
        coord.record_response(1, "s1", Value::Number(1.0));
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            AckOutcome::Timeout(v) => assert_eq!(v.len(), 1),
            other => panic!("unexpected outcome {:?}", other),
        }
        coord.shutdown();
    }
}
