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
use std::sync::Mutex;

use tracing::instrument;

/// The room membership index for a single namespace.
///
/// Every socket is implicitly a member of a room named after its own id,
/// which is how a direct, unicast `to(sid)` call is expressed in terms of
/// the same broadcast machinery as a room fan-out. Both directions of the
/// membership relation (room -> sids, sid -> rooms) are kept so that
/// cleaning up a disconnected socket and computing a broadcast's target
/// set are both cheap.
#[derive(Default)]
pub struct Adapter {
    rooms: Mutex<HashMap<String, HashSet<String>>>,
    socket_rooms: Mutex<HashMap<String, HashSet<String>>>,
}

impl Adapter {
    pub fn new() -> Adapter {
        Adapter::default()
    }

    #[instrument(skip(self))]
    pub fn join(&self, sid: &str, room: &str) {
        let mut rooms = self.rooms.lock().unwrap();
        rooms.entry(room.to_string()).or_default().insert(sid.to_string());
        drop(rooms);

        let mut socket_rooms = self.socket_rooms.lock().unwrap();
        socket_rooms.entry(sid.to_string()).or_default().insert(room.to_string());
    }

    #[instrument(skip(self))]
    pub fn leave(&self, sid: &str, room: &str) {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(members) = rooms.get_mut(room) {
            members.remove(sid);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
        drop(rooms);

        let mut socket_rooms = self.socket_rooms.lock().unwrap();
        if let Some(joined) = socket_rooms.get_mut(sid) {
            joined.remove(room);
        }
    }

    /// Removes a socket from every room it had joined, used on disconnect.
    #[instrument(skip(self))]
    pub fn leave_all(&self, sid: &str) {
        let joined = {
            let mut socket_rooms = self.socket_rooms.lock().unwrap();
            socket_rooms.remove(sid).unwrap_or_default()
        };
        let mut rooms = self.rooms.lock().unwrap();
        for room in joined {
            if let Some(members) = rooms.get_mut(&room) {
                members.remove(sid);
                if members.is_empty() {
                    rooms.remove(&room);
                }
            }
        }
    }

    pub fn rooms_of(&self, sid: &str) -> HashSet<String> {
        self.socket_rooms.lock().unwrap().get(sid).cloned().unwrap_or_default()
    }

    pub fn sockets_in(&self, room: &str) -> HashSet<String> {
        self.rooms.lock().unwrap().get(room).cloned().unwrap_or_default()
    }

    /// Resolves a broadcast plan: every socket that belongs to at least one
    /// of `to_rooms` (or, if `to_rooms` is empty, every known socket),
    /// minus anything named in `except`.
    ///
    /// An empty `to_rooms` with a non-empty overall index means "broadcast
    /// to the whole namespace", matching a bare `.emit()` with no `.to()`
    /// qualifier.
    pub fn compute_targets(&self, to_rooms: &[String], except: &[String]) -> HashSet<String> {
        let rooms = self.rooms.lock().unwrap();
        let mut targets: HashSet<String> = if to_rooms.is_empty() {
            rooms.values().flatten().cloned().collect()
        } else {
            let mut set = HashSet::new();
            for room in to_rooms {
                if let Some(members) = rooms.get(room) {
                    set.extend(members.iter().cloned());
                }
            }
            set
        };
        for sid in except {
            targets.remove(sid);
        }
        targets
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn join_and_compute_targets() {
        let a = Adapter::new();
        a.join("s1", "room-a");
        a.join("s2", "room-a");
        a.join("s3", "room-b");

        let targets = a.compute_targets(&["room-a".to_string()], &[]);
        assert_eq!(targets, HashSet::from(["s1".to_string(), "s2".to_string()]));
    }

    #[test]
    fn except_excludes_sender() {
        let a = Adapter::new();
        a.join("s1", "room-a");
        a.join("s2", "room-a");

        let targets = a.compute_targets(&["room-a".to_string()], &["s1".to_string()]);
        assert_eq!(targets, HashSet::from(["s2".to_string()]));
    }

    #[test]
    fn empty_rooms_targets_everyone() {
        let a = Adapter::new();
        a.join("s1", "room-a");
        a.join("s2", "room-b");

        let targets = a.compute_targets(&[], &[]);
        assert_eq!(targets, HashSet::from(["s1".to_string(), "s2".to_string()]));
    }

    #[test]
    fn leave_all_cleans_up_reverse_index() {
        let a = Adapter::new();
        a.join("s1", "room-a");
        a.join("s1", "room-b");
        a.leave_all("s1");

        assert!(a.rooms_of("s1").is_empty());
        assert!(a.sockets_in("room-a").is_empty());
        assert!(a.sockets_in("room-b").is_empty());
    }

    #[test]
    fn leave_single_room_keeps_others() {
        let a = Adapter::new();
        a.join("s1", "room-a");
        a.join("s1", "room-b");
        a.leave("s1", "room-a");

        assert_eq!(a.rooms_of("s1"), HashSet::from(["room-b".to_string()]));
    }

    /// Randomized join/leave churn against a handful of sids and rooms,
    /// checking the R in S.rooms <=> S.sid in Adapter.members(R) invariant
    /// holds after every step rather than just in the hand-picked cases
    /// above.
    #[test]
    fn membership_stays_symmetric_under_random_churn() {
        use rand::Rng;

        let a = Adapter::new();
        let sids: Vec<String> = (0..5).map(|i| format!("s{i}")).collect();
        let rooms: Vec<String> = (0..3).map(|i| format!("room-{i}")).collect();
        let mut rng = rand::thread_rng();

        for _ in 0..200 {
            let sid = &sids[rng.gen_range(0..sids.len())];
            let room = &rooms[rng.gen_range(0..rooms.len())];
            if rng.gen_bool(0.5) {
                a.join(sid, room);
            } else {
                a.leave(sid, room);
            }

            for room in &rooms {
                let members = a.sockets_in(room);
                for sid in &sids {
                    assert_eq!(members.contains(sid), a.rooms_of(sid).contains(room));
                }
            }
        }
    }
}
