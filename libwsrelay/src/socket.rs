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

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::instrument;
use wsrelay_protocol::{Packet, PacketType, TransportPacket, Value};

use crate::ack::{AckCoordinator, AckOutcome};
use crate::errors::{DisconnectedError, SendError};
use crate::namespace::Namespace;
use crate::operators::Operator;
use crate::recovery::RecoveryStore;
use crate::transport::{OutboundFrame, Transport};

/// One client's attachment to one namespace.
///
/// A single physical connection multiplexes one `Socket` per namespace it
/// has joined; `sid` identifies this attachment, while `pid` is the
/// private, longer-lived id used to recover this socket's room
/// memberships across a reconnect. `conn_id` is the id the underlying
/// `Transport` actually knows this connection by -- distinct from `sid`
/// because one physical connection can multiplex several namespaces, each
/// with its own `sid`, over the one registered transport channel.
pub struct Socket {
    pub sid: String,
    pub pid: String,
    pub nsp: String,
    pub conn_id: String,
    namespace: Weak<Namespace>,
    transport: Arc<dyn Transport>,
    ack_coordinator: Arc<AckCoordinator>,
    recovery: Option<Arc<RecoveryStore>>,
    connected: AtomicBool,
}

impl Socket {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sid: String,
        pid: String,
        conn_id: String,
        namespace: &Arc<Namespace>,
        transport: Arc<dyn Transport>,
        ack_coordinator: Arc<AckCoordinator>,
        recovery: Option<Arc<RecoveryStore>>,
    ) -> Socket {
        Socket {
            sid,
            pid,
            nsp: namespace.name.clone(),
            conn_id,
            namespace: Arc::downgrade(namespace),
            transport,
            ack_coordinator,
            recovery,
            connected: AtomicBool::new(true),
        }
    }

    fn namespace(&self) -> Arc<Namespace> {
        self.namespace.upgrade().expect("namespace outlives every socket attached to it")
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn join(&self, room: impl Into<String>) {
        self.namespace().adapter.join(&self.sid, &room.into());
    }

    pub fn leave(&self, room: impl Into<String>) {
        self.namespace().adapter.leave(&self.sid, &room.into());
    }

    pub fn rooms(&self) -> HashSet<String> {
        self.namespace().adapter.rooms_of(&self.sid)
    }

    /// Starts a broadcast plan scoped to `room`, with this socket excluded
    /// from the resolved targets by default -- the conventional
    /// `socket.to(room).emit(...)` semantics, where the sender doesn't
    /// receive its own broadcast.
    pub fn to(&self, room: impl Into<String>) -> Operator {
        self.broadcast().to(room)
    }

    /// Starts a broadcast plan over the whole namespace, excluding this
    /// socket.
    pub fn broadcast(&self) -> Operator {
        Operator::new(
            self.namespace(),
            Arc::clone(&self.transport),
            Arc::clone(&self.ack_coordinator),
            self.recovery.clone(),
        )
        .except(self.sid.clone())
    }

    /// Sends an EVENT directly to this socket only, with no ack.
    #[instrument(skip(self, data))]
    pub fn emit(&self, event: &str, data: Value) -> Result<(), SendError> {
        if wsrelay_protocol::is_reserved_event(event) {
            return Err(SendError {
                sid: self.sid.clone(),
                reason: format!("'{event}' is a reserved event name and cannot be emitted"),
            });
        }
        if !self.is_connected() {
            return Err(SendError { sid: self.sid.clone(), reason: "socket disconnected".to_string() });
        }
        let payload = Value::List(vec![Value::String(event.to_string()), data]);
        let packet = Packet::event(self.nsp.clone(), payload);
        let (header, attachments) =
            packet.encode().map_err(|e| SendError { sid: self.sid.clone(), reason: e.to_string() })?;
        self.transport.send(&self.conn_id, OutboundFrame::Text(TransportPacket::message_frame(header)))?;
        for buf in attachments {
            self.transport.send(&self.conn_id, OutboundFrame::Binary(buf))?;
        }
        Ok(())
    }

    /// Sends an ACK packet carrying `results` back for the EVENT identified
    /// by `id`. This is the server-to-client half of the ack handshake: a
    /// listener registered with [`crate::namespace::Namespace::on`] calls
    /// this (indirectly, via the ack callback it's handed) once it has a
    /// reply ready for an inbound EVENT that carried an `id`.
    #[instrument(skip(self, results))]
    pub fn send_ack(&self, id: u64, results: Value) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError { sid: self.sid.clone(), reason: "socket disconnected".to_string() });
        }
        let packet = Packet { packet_type: PacketType::Ack, nsp: self.nsp.clone(), id: Some(id), data: Some(results) };
        let (header, attachments) =
            packet.encode().map_err(|e| SendError { sid: self.sid.clone(), reason: e.to_string() })?;
        self.transport.send(&self.conn_id, OutboundFrame::Text(TransportPacket::message_frame(header)))?;
        for buf in attachments {
            self.transport.send(&self.conn_id, OutboundFrame::Binary(buf))?;
        }
        Ok(())
    }

    /// Sends an EVENT directly to this socket and blocks the calling
    /// thread waiting for its single ack, or for `timeout` to elapse, or
    /// for this socket to disconnect first -- whichever happens first,
    /// and only ever one of the three.
    pub fn emit_with_ack(&self, event: &str, data: Value, timeout: Duration) -> AckOutcome {
        if wsrelay_protocol::is_reserved_event(event) {
            return AckOutcome::Rejected(format!("'{event}' is a reserved event name and cannot be emitted"));
        }
        if !self.is_connected() {
            return AckOutcome::Disconnected;
        }
        let ack_id = self.ack_coordinator.next_ack_id();
        let payload = Value::List(vec![Value::String(event.to_string()), data]);
        let packet = Packet { packet_type: PacketType::Event, nsp: self.nsp.clone(), id: Some(ack_id), data: Some(payload) };
        let Ok((header, attachments)) = packet.encode() else {
            return AckOutcome::Responses(Vec::new());
        };

        let (tx, rx) = mpsc::channel();
        self.ack_coordinator.register_single(
            ack_id,
            self.sid.clone(),
            timeout,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );

        if self.transport.send(&self.conn_id, OutboundFrame::Text(TransportPacket::message_frame(header))).is_err() {
            self.ack_coordinator.record_disconnect(&self.sid);
        } else {
            for buf in attachments {
                let _ = self.transport.send(&self.conn_id, OutboundFrame::Binary(buf));
            }
        }

        rx.recv().unwrap_or(AckOutcome::Disconnected)
    }

    /// Delivers an ack reply this socket sent back for `ack_id`.
    pub fn deliver_ack_response(&self, ack_id: u64, value: Value) {
        self.ack_coordinator.record_response(ack_id, &self.sid, value);
    }

    /// Marks this socket disconnected: leaves every room, notifies the
    /// ack coordinator so anything still waiting on a reply from it can
    /// resolve, and optionally snapshots its room memberships for later
    /// recovery.
    #[instrument(skip(self))]
    pub fn mark_disconnected(&self, store_for_recovery: bool) {
        self.connected.store(false, Ordering::SeqCst);
        let namespace = self.namespace();
        if store_for_recovery {
            if let Some(recovery) = &self.recovery {
                recovery.store_session(&self.pid, self.rooms());
            }
        }
        namespace.adapter.leave_all(&self.sid);
        self.ack_coordinator.record_disconnect(&self.sid);
    }

    pub fn disconnect(&self) -> Result<(), DisconnectedError> {
        if !self.is_connected() {
            return Err(DisconnectedError { sid: self.sid.clone() });
        }
        let packet = Packet {
            packet_type: PacketType::Disconnect,
            nsp: self.nsp.clone(),
            id: None,
            data: None,
        };
        if let Ok((header, _)) = packet.encode() {
            let _ = self.transport.send(&self.conn_id, OutboundFrame::Text(TransportPacket::message_frame(header)));
        }
        self.mark_disconnected(false);
        Ok(())
    }
}
