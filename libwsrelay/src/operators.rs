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

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;
use wsrelay_protocol::{Packet, TransportPacket, Value};

use crate::ack::{AckCoordinator, AckOutcome};
use crate::errors::SendError;
use crate::namespace::Namespace;
use crate::recovery::RecoveryStore;
use crate::transport::{OutboundFrame, Transport};

/// A chainable broadcast plan, built up with `.to()`/`.except()`/etc. and
/// consumed by a final `.emit()` or `.emit_with_ack()`.
///
/// Every qualifier returns `self` so calls read as a pipeline:
/// `namespace.broadcast().to("room-a").except(sid).emit("tick", payload)`.
pub struct Operator {
    namespace: Arc<Namespace>,
    transport: Arc<dyn Transport>,
    ack_coordinator: Arc<AckCoordinator>,
    recovery: Option<Arc<RecoveryStore>>,
    rooms: Vec<String>,
    except: Vec<String>,
    /// Kept for API parity with a clustered adapter that can restrict a
    /// broadcast to sockets attached to this process; this engine has no
    /// cluster-wide adapter, so every broadcast is already local.
    local_only: bool,
    /// A volatile packet is sent best-effort: a transport failure for one
    /// recipient is swallowed rather than surfaced, and does not stop the
    /// broadcast from reaching everyone else. It does not, however,
    /// suppress an aggregate ack callback registered alongside it -- that
    /// callback still resolves via the normal response/timeout path.
    volatile: bool,
    ack_timeout: Option<Duration>,
}

impl Operator {
    pub fn new(
        namespace: Arc<Namespace>,
        transport: Arc<dyn Transport>,
        ack_coordinator: Arc<AckCoordinator>,
        recovery: Option<Arc<RecoveryStore>>,
    ) -> Operator {
        Operator {
            namespace,
            transport,
            ack_coordinator,
            recovery,
            rooms: Vec::new(),
            except: Vec::new(),
            local_only: false,
            volatile: false,
            ack_timeout: None,
        }
    }

    pub fn to(mut self, room: impl Into<String>) -> Operator {
        self.rooms.push(room.into());
        self
    }

    /// Alias for [`Operator::to`], matching the `within`/`to` synonym pair
    /// conventional for this kind of broadcast builder.
    pub fn within(self, room: impl Into<String>) -> Operator {
        self.to(room)
    }

    pub fn except(mut self, sid: impl Into<String>) -> Operator {
        self.except.push(sid.into());
        self
    }

    pub fn local(mut self) -> Operator {
        self.local_only = true;
        self
    }

    pub fn volatile(mut self) -> Operator {
        self.volatile = true;
        self
    }

    pub fn timeout(mut self, d: Duration) -> Operator {
        self.ack_timeout = Some(d);
        self
    }

    fn targets(&self) -> std::collections::HashSet<String> {
        self.namespace.adapter.compute_targets(&self.rooms, &self.except)
    }

    /// Sends an EVENT packet to every socket the plan resolves to. No ack
    /// is requested or awaited.
    #[instrument(skip(self, data))]
    pub fn emit(&self, event: &str, data: Value) -> Result<(), SendError> {
        if wsrelay_protocol::is_reserved_event(event) {
            return Err(SendError {
                sid: "*".to_string(),
                reason: format!("'{event}' is a reserved event name and cannot be emitted"),
            });
        }
        let targets = self.targets();
        let mut items = vec![Value::String(event.to_string()), data];

        let offset = if let (Some(recovery), false) = (&self.recovery, self.rooms.is_empty()) {
            Some(recovery.record_broadcast(&self.rooms, Value::List(items.clone())))
        } else {
            None
        };
        if let Some(offset) = offset {
            items.push(Value::Number(offset as f64));
        }

        let packet = Packet::event(self.namespace.name.clone(), Value::List(items));
        let (header, attachments) = packet
            .encode()
            .map_err(|e| SendError { sid: "*".to_string(), reason: e.to_string() })?;

        let mut first_err = None;
        for sid in &targets {
            if let Err(e) = self.send_one(sid, &header, &attachments) {
                if self.volatile {
                    continue;
                }
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) if !self.volatile => Err(e),
            _ => Ok(()),
        }
    }

    /// Translates a target `sid` to the connection id its `Transport`
    /// channel is actually registered under before writing a frame. A sid
    /// with no matching `Socket` (only possible in tests that drive the
    /// transport directly) falls back to treating the sid as the
    /// connection id itself.
    fn send_one(&self, sid: &str, header: &str, attachments: &[Vec<u8>]) -> Result<(), SendError> {
        let conn_id = self.namespace.socket(sid).map(|s| s.conn_id.clone()).unwrap_or_else(|| sid.to_string());
        self.transport
            .send(&conn_id, OutboundFrame::Text(TransportPacket::message_frame(header)))
            .map_err(|mut e| {
                e.sid = sid.to_string();
                e
            })?;
        for buf in attachments {
            self.transport.send(&conn_id, OutboundFrame::Binary(buf.clone())).map_err(|mut e| {
                e.sid = sid.to_string();
                e
            })?;
        }
        Ok(())
    }

    /// Sends an EVENT packet and waits (blocking the calling thread) for
    /// every resolved target to acknowledge it, or for the timeout to
    /// elapse.
    ///
    /// If the broadcast plan resolves to no targets at all, no ack id is
    /// allocated and this returns an empty response set immediately --
    /// there is nothing to wait for.
    pub fn emit_with_ack(&self, event: &str, data: Value) -> AckOutcome {
        if wsrelay_protocol::is_reserved_event(event) {
            return AckOutcome::Rejected(format!("'{event}' is a reserved event name and cannot be emitted"));
        }
        let targets = self.targets();
        if targets.is_empty() {
            return AckOutcome::Responses(Vec::new());
        }

        let ack_id = self.ack_coordinator.next_ack_id();
        let payload = Value::List(vec![Value::String(event.to_string()), data]);
        let packet = Packet {
            packet_type: wsrelay_protocol::PacketType::Event,
            nsp: self.namespace.name.clone(),
            id: Some(ack_id),
            data: Some(payload),
        };
        let Ok((header, attachments)) = packet.encode() else {
            return AckOutcome::Responses(Vec::new());
        };

        let (tx, rx) = mpsc::channel();
        self.ack_coordinator.register_broadcast(
            ack_id,
            targets.clone(),
            self.ack_timeout.unwrap_or(crate::consts::DEFAULT_ACK_TIMEOUT),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );

        for sid in &targets {
            if self.send_one(sid, &header, &attachments).is_err() && !self.volatile {
                // A hard send failure means this target will never ack;
                // record_disconnect lets the aggregate resolve without
                // waiting out the full timeout.
                self.ack_coordinator.record_disconnect(sid);
            }
        }

        rx.recv().unwrap_or(AckOutcome::Responses(Vec::new()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::ChannelTransport;
    use std::time::Duration;

    fn setup() -> (Arc<Namespace>, Arc<ChannelTransport>, Arc<AckCoordinator>) {
        let ns = Arc::new(Namespace::new("/"));
        let transport = Arc::new(ChannelTransport::new());
        let coord = AckCoordinator::spawn(Duration::from_millis(10));
        (ns, transport, coord)
    }

    #[test]
    fn emit_with_no_targets_sends_nothing() {
        let (ns, transport, coord) = setup();
        let op = Operator::new(ns, transport, coord.clone(), None);
        op.emit("tick", Value::Null).unwrap();
        coord.shutdown();
    }

    #[test]
    fn emit_with_ack_on_empty_targets_resolves_immediately_without_ack_id() {
        let (ns, transport, coord) = setup();
        let op = Operator::new(ns, transport, coord.clone(), None);
        match op.emit_with_ack("ping", Value::Null) {
            AckOutcome::Responses(v) => assert!(v.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
        coord.shutdown();
    }

    #[test]
    fn emit_rejects_reserved_event_name() {
        let (ns, transport, coord) = setup();
        let op = Operator::new(ns, transport, coord.clone(), None);
        let err = op.emit("disconnect", Value::Null).unwrap_err();
        assert!(err.reason.contains("reserved"));
        coord.shutdown();
    }

    #[test]
    fn emit_with_ack_rejects_reserved_event_name() {
        let (ns, transport, coord) = setup();
        let op = Operator::new(ns, transport, coord.clone(), None);
        match op.emit_with_ack("connect_error", Value::Null) {
            AckOutcome::Rejected(reason) => assert!(reason.contains("reserved")),
            other => panic!("unexpected {:?}", other),
        }
        coord.shutdown();
    }

    #[test]
    fn emit_appends_recovery_offset_to_payload() {
        let ns = Arc::new(Namespace::new("/"));
        ns.adapter.join("s1", "room-a");
        let transport = Arc::new(ChannelTransport::new());
        let coord = AckCoordinator::spawn(Duration::from_millis(10));
        let recovery = crate::recovery::RecoveryStore::spawn(Duration::from_secs(60), 10, Duration::from_millis(10));
        let rx = transport.register("s1");

        let op = Operator::new(Arc::clone(&ns), Arc::clone(&transport), coord.clone(), Some(Arc::clone(&recovery)))
            .to("room-a");
        op.emit("tick", Value::String("hi".to_string())).unwrap();

        match rx.recv().unwrap() {
            OutboundFrame::Text(t) => {
                let tp = TransportPacket::decode(&t).unwrap();
                let packet = Packet::decode(&tp.body.unwrap(), &[]).unwrap();
                // The offset rides along as the third element of the EVENT
                // packet's data array, after the event name and the payload.
                match packet.data.unwrap() {
                    Value::List(items) => {
                        assert_eq!(items.len(), 3);
                        assert_eq!(items[2], Value::Number(0.0));
                    }
                    other => panic!("unexpected data {:?}", other),
                }
            }
            other => panic!("unexpected frame {:?}", other),
        }
        coord.shutdown();
        recovery.shutdown();
    }

    #[test]
    fn emit_delivers_to_joined_room_members() {
        let (ns, transport, coord) = setup();
        ns.adapter.join("s1", "room-a");
        let rx = transport.register("s1");

        let op = Operator::new(Arc::clone(&ns), Arc::clone(&transport), coord.clone(), None).to("room-a");
        op.emit("greet", Value::String("hi".to_string())).unwrap();

        let frame = rx.recv().unwrap();
        match frame {
            OutboundFrame::Text(t) => assert!(t.contains("greet")),
            other => panic!("unexpected frame {:?}", other),
        }
        coord.shutdown();
    }
}
