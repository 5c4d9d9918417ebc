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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;

use crate::errors::SendError;

/// A single frame written out to a connected client: either a text frame
/// carrying an application packet header, or a binary frame carrying one
/// detached attachment buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// The one thing the rest of the engine needs from whatever is actually
/// holding the client socket open: a way to push a frame to a connection
/// id, and find out when that stops being possible.
///
/// Kept deliberately small so that a real WebSocket listener thread and an
/// in-process loopback (used by tests and the CLI demo) can both implement
/// it without either one leaking into the engine's own locking.
pub trait Transport: Send + Sync {
    fn send(&self, sid: &str, frame: OutboundFrame) -> Result<(), SendError>;

    fn is_connected(&self, sid: &str) -> bool;
}

/// A `Transport` backed by one `crossbeam_channel` per connected client,
/// the same bounded-rendezvous-channel idiom used to hand frames to a
/// per-connection writer thread. Good enough to drive the CLI demo and
/// exercise the full engine in tests without opening a real socket.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    senders: Arc<Mutex<HashMap<String, Sender<OutboundFrame>>>>,
}

impl ChannelTransport {
    pub fn new() -> ChannelTransport {
        ChannelTransport::default()
    }

    /// Registers a new connection's outbound channel, returning the
    /// receiving half for whatever is pumping frames to the real client.
    pub fn register(&self, sid: &str) -> crossbeam_channel::Receiver<OutboundFrame> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.senders.lock().unwrap().insert(sid.to_string(), tx);
        rx
    }

    pub fn unregister(&self, sid: &str) {
        self.senders.lock().unwrap().remove(sid);
    }
}

impl Transport for ChannelTransport {
    fn send(&self, sid: &str, frame: OutboundFrame) -> Result<(), SendError> {
        let senders = self.senders.lock().unwrap();
        let tx = senders.get(sid).ok_or_else(|| SendError {
            sid: sid.to_string(),
            reason: "no registered channel for this connection".to_string(),
        })?;
        tx.send(frame).map_err(|e| SendError { sid: sid.to_string(), reason: e.to_string() })
    }

    fn is_connected(&self, sid: &str) -> bool {
        self.senders.lock().unwrap().contains_key(sid)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn send_to_unregistered_sid_errors() {
        let t = ChannelTransport::new();
        let err = t.send("ghost", OutboundFrame::Text("hi".to_string())).unwrap_err();
        assert_eq!(err.sid, "ghost");
    }

    #[test]
    fn registered_sid_receives_frames_in_order() {
        let t = ChannelTransport::new();
        let rx = t.register("abc123");
        t.send("abc123", OutboundFrame::Text("one".to_string())).unwrap();
        t.send("abc123", OutboundFrame::Text("two".to_string())).unwrap();
        assert_eq!(rx.recv().unwrap(), OutboundFrame::Text("one".to_string()));
        assert_eq!(rx.recv().unwrap(), OutboundFrame::Text("two".to_string()));
    }

    #[test]
    fn unregister_drops_channel() {
        let t = ChannelTransport::new();
        t.register("abc");
        assert!(t.is_connected("abc"));
        t.unregister("abc");
        assert!(!t.is_connected("abc"));
    }
}
