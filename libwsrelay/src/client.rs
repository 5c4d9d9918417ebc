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

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{instrument, warn};
use wsrelay_protocol::{
    OpenPacketPayload, Packet, PacketType, Reassembler, TransportPacket, TransportPacketType, Value,
};

use crate::ack::AckCoordinator;
use crate::config::ResolvedConfig;
use crate::errors::ConnectError;
use crate::hooks::Hooks;
use crate::namespace::{AckCallback, ConnectInfo};
use crate::recovery::RecoveryStore;
use crate::registry::NamespaceRegistry;
use crate::socket::Socket;
use crate::transport::{OutboundFrame, Transport};

static NEXT_SOCKET_SEQ: AtomicU64 = AtomicU64::new(1);

fn fresh_id(prefix: &str) -> String {
    format!("{prefix}{:x}", NEXT_SOCKET_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Everything the engine knows about one physical connection:
/// its own decode-side attachment reassembler, and one `Socket` for every
/// namespace it has joined. Multiple namespaces share the same transport
/// id, which is what "multiplex" means here -- one WebSocket, many
/// logical sockets.
pub struct Client {
    pub id: String,
    registry: Arc<NamespaceRegistry>,
    transport: Arc<dyn Transport>,
    ack_coordinator: Arc<AckCoordinator>,
    recovery: Option<Arc<RecoveryStore>>,
    config: ResolvedConfig,
    hooks: Arc<dyn Hooks + Send + Sync>,
    sockets: Mutex<HashMap<String, Arc<Socket>>>,
    reassembler: Mutex<Reassembler>,
    connected_once: AtomicBool,
}

impl Client {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        registry: Arc<NamespaceRegistry>,
        transport: Arc<dyn Transport>,
        ack_coordinator: Arc<AckCoordinator>,
        recovery: Option<Arc<RecoveryStore>>,
        config: ResolvedConfig,
        hooks: Arc<dyn Hooks + Send + Sync>,
    ) -> Client {
        Client {
            id,
            registry,
            transport,
            ack_coordinator,
            recovery,
            config,
            hooks,
            sockets: Mutex::new(HashMap::new()),
            reassembler: Mutex::new(Reassembler::new()),
            connected_once: AtomicBool::new(false),
        }
    }

    /// Spawns a one-shot background timer that closes this connection if
    /// it hasn't joined any namespace within `config.connect_timeout`.
    /// Unlike the ack/recovery reapers, this is a single deadline for a
    /// single connection rather than a recurring sweep over many entries,
    /// so a plain sleeping thread is simpler than a shared reaper loop.
    pub fn arm_connect_timeout(self: &Arc<Client>) {
        if self.config.connect_timeout.is_zero() {
            return;
        }
        let client = Arc::clone(self);
        let timeout = self.config.connect_timeout;
        thread::spawn(move || {
            thread::sleep(timeout);
            if !client.connected_once.load(Ordering::SeqCst) {
                warn!(id = %client.id, "no namespace connected within connect_timeout, closing");
                let close = TransportPacket { kind: TransportPacketType::Close, body: None };
                let _ = client.transport.send(&client.id, OutboundFrame::Text(close.encode()));
                client.disconnect_all("connect timeout");
            }
        });
    }

    /// Builds and sends the OPEN handshake packet. Must be called once,
    /// before any application packet is exchanged.
    pub fn send_handshake(&self) -> anyhow::Result<()> {
        let payload = OpenPacketPayload {
            sid: self.id.clone(),
            upgrades: Vec::new(),
            ping_interval_ms: self.config.ping_interval.as_millis() as u64,
            ping_timeout_ms: self.config.ping_timeout.as_millis() as u64,
            max_payload_bytes: self.config.max_payload_bytes,
        };
        let body = serde_json::to_string(&payload)?;
        let tp = TransportPacket { kind: TransportPacketType::Open, body: Some(body) };
        self.transport.send(&self.id, OutboundFrame::Text(tp.encode()))?;
        Ok(())
    }

    /// Handles one incoming text frame from the transport: an Engine.IO
    /// envelope that may be a PING response, a close notice, or a MESSAGE
    /// carrying an application packet header.
    #[instrument(skip(self, raw))]
    pub fn handle_text_frame(&self, raw: &str) -> anyhow::Result<()> {
        let tp = TransportPacket::decode(raw)?;
        match tp.kind {
            TransportPacketType::Ping => {
                let pong = TransportPacket { kind: TransportPacketType::Pong, body: None };
                self.transport.send(&self.id, OutboundFrame::Text(pong.encode()))?;
            }
            TransportPacketType::Close => {
                self.disconnect_all("transport closed");
            }
            TransportPacketType::Message => {
                let body = tp.body.unwrap_or_default();
                let mut reassembler = self.reassembler.lock().unwrap();
                if let Some(packet) = reassembler.feed_header(&body)? {
                    drop(reassembler);
                    self.handle_packet(packet)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Handles one incoming binary frame, which only makes sense while a
    /// BINARY_EVENT/BINARY_ACK header is mid-reassembly.
    pub fn handle_binary_frame(&self, buf: Vec<u8>) -> anyhow::Result<()> {
        let mut reassembler = self.reassembler.lock().unwrap();
        if let Some(packet) = reassembler.feed_binary(buf)? {
            drop(reassembler);
            self.handle_packet(packet)?;
        }
        Ok(())
    }

    fn handle_packet(&self, packet: Packet) -> anyhow::Result<()> {
        match packet.packet_type {
            PacketType::Connect => self.connect_namespace(&packet.nsp, packet.data.unwrap_or(Value::Null)),
            PacketType::Disconnect => {
                self.disconnect_namespace(&packet.nsp, "client requested disconnect");
                Ok(())
            }
            PacketType::Event => {
                self.dispatch_event(&packet.nsp, packet.data.unwrap_or(Value::Null), packet.id);
                Ok(())
            }
            PacketType::Ack => {
                if let (Some(id), Some(socket)) = (packet.id, self.socket(&packet.nsp)) {
                    socket.deliver_ack_response(id, packet.data.unwrap_or(Value::Null));
                }
                Ok(())
            }
            PacketType::ConnectError | PacketType::BinaryEvent | PacketType::BinaryAck => {
                warn!("unexpected normalized packet type reached client dispatch");
                Ok(())
            }
        }
    }

    fn dispatch_event(&self, nsp: &str, data: Value, ack_id: Option<u64>) {
        let Some(socket) = self.socket(nsp) else {
            warn!(nsp, "event for namespace with no attached socket");
            return;
        };
        let Value::List(mut items) = data else {
            warn!(nsp, "event payload was not a list");
            return;
        };
        if items.is_empty() {
            return;
        }
        let head = items.remove(0);
        let Value::String(event) = head else {
            warn!(nsp, "event head was not a string");
            return;
        };
        let args = Value::List(items);
        let ack: Option<AckCallback> = ack_id.map(|id| {
            let socket = Arc::clone(&socket);
            Box::new(move |results: Value| {
                let _ = socket.send_ack(id, Value::List(vec![results]));
            }) as AckCallback
        });
        if let Some(namespace) = self.registry.existing(nsp) {
            namespace.dispatch_event(socket, &event, args, ack);
        }
    }

    /// Handles a CONNECT packet for `nsp`: resolves the namespace,
    /// runs its middleware chain, and on success builds a new `Socket`
    /// for this client. `auth` may carry a `pid`/`offset` pair requesting
    /// session recovery.
    #[instrument(skip(self, auth))]
    fn connect_namespace(&self, nsp: &str, auth: Value) -> anyhow::Result<()> {
        let namespace = match self.registry.resolve(nsp) {
            Some(ns) => ns,
            None => {
                self.send_connect_error(nsp, &ConnectError::UnknownNamespace(nsp.to_string()).to_string())?;
                return Ok(());
            }
        };

        let socket_sid = fresh_id("s");
        let recovery_request = recovery_fields(&auth);

        // A session presenting recovery credentials optionally bypasses
        // the middleware chain entirely, since it already passed it once
        // before disconnecting.
        let skip_middlewares = self.recovery.is_some() && recovery_request.is_some() && self.config.skip_middlewares_on_recovery;
        if !skip_middlewares {
            let info = ConnectInfo { nsp: nsp.to_string(), sid: socket_sid.clone(), auth: auth.clone() };
            if let Err(e) = namespace.run_middlewares(&info) {
                self.send_connect_error(nsp, &e.to_string())?;
                return Ok(());
            }
        }

        let pid = recovery_request.as_ref().map(|r| r.0.clone()).unwrap_or_else(|| fresh_id("pid-"));

        let socket = Arc::new(Socket::new(
            socket_sid.clone(),
            pid.clone(),
            self.id.clone(),
            &namespace,
            Arc::clone(&self.transport),
            Arc::clone(&self.ack_coordinator),
            self.recovery.clone(),
        ));
        namespace.register_socket(Arc::clone(&socket));
        socket.join(socket_sid.clone());
        self.sockets.lock().unwrap().insert(nsp.to_string(), Arc::clone(&socket));
        self.connected_once.store(true, Ordering::SeqCst);

        let mut ack_payload = BTreeMap::new();
        ack_payload.insert("sid".to_string(), Value::String(socket_sid));

        if let (Some(recovery), Some((_, offset))) = (&self.recovery, recovery_request) {
            if let Some(recovered) = recovery.recover(&pid, offset) {
                for room in &recovered.rooms {
                    socket.join(room.clone());
                }
                ack_payload.insert("recovered".to_string(), Value::Bool(true));
                for event in recovered.missed {
                    let _ = socket.emit("message", event);
                }
            }
        }

        let ack = Packet {
            packet_type: PacketType::Connect,
            nsp: nsp.to_string(),
            id: None,
            data: Some(Value::Map(ack_payload)),
        };
        let (header, _) = ack.encode()?;
        self.transport.send(&self.id, OutboundFrame::Text(TransportPacket::message_frame(header)))?;
        if let Err(e) = self.hooks.on_connect(nsp, &socket.sid) {
            warn!(nsp, error = %e, "on_connect hook failed");
        }
        Ok(())
    }

    fn send_connect_error(&self, nsp: &str, reason: &str) -> anyhow::Result<()> {
        let mut data = BTreeMap::new();
        data.insert("message".to_string(), Value::String(reason.to_string()));
        let packet = Packet {
            packet_type: PacketType::ConnectError,
            nsp: nsp.to_string(),
            id: None,
            data: Some(Value::Map(data)),
        };
        let (header, _) = packet.encode()?;
        self.transport.send(&self.id, OutboundFrame::Text(TransportPacket::message_frame(header)))?;
        Ok(())
    }

    pub fn socket(&self, nsp: &str) -> Option<Arc<Socket>> {
        self.sockets.lock().unwrap().get(nsp).cloned()
    }

    fn disconnect_namespace(&self, nsp: &str, reason: &str) {
        let socket = self.sockets.lock().unwrap().remove(nsp);
        if let Some(socket) = socket {
            if let Some(namespace) = self.registry.existing(nsp) {
                namespace.remove_socket(&socket.sid);
                namespace.run_disconnect_handlers(Arc::clone(&socket), reason.to_string());
            }
            socket.mark_disconnected(self.recovery.is_some());
            if let Err(e) = self.hooks.on_disconnect(nsp, &socket.sid, reason) {
                warn!(nsp, error = %e, "on_disconnect hook failed");
            }
            if self.config.cleanup_empty_child_namespaces {
                self.registry.cleanup_if_empty(nsp);
            }
        }
    }

    /// Tears down every namespace this connection had joined, called when
    /// the underlying transport goes away entirely.
    pub fn disconnect_all(&self, reason: &str) {
        let nsps: Vec<String> = self.sockets.lock().unwrap().keys().cloned().collect();
        for nsp in nsps {
            self.disconnect_namespace(&nsp, reason);
        }
    }
}

fn recovery_fields(auth: &Value) -> Option<(String, Option<u64>)> {
    let Value::Map(m) = auth else { return None };
    let Value::String(pid) = m.get("pid")? else { return None };
    let offset = match m.get("offset") {
        Some(Value::Number(n)) => Some(*n as u64),
        _ => None,
    };
    Some((pid.clone(), offset))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::ChannelTransport;
    use std::time::Duration;

    fn setup() -> (Arc<NamespaceRegistry>, Arc<ChannelTransport>, Arc<AckCoordinator>, Client) {
        let registry = Arc::new(NamespaceRegistry::new());
        registry.add_exact("/");
        let transport = Arc::new(ChannelTransport::new());
        let coord = AckCoordinator::spawn(Duration::from_millis(10));
        let client = Client::new(
            "c1".to_string(),
            Arc::clone(&registry),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&coord),
            None,
            ResolvedConfig::default(),
            Arc::new(crate::hooks::NoopHooks),
        );
        (registry, transport, coord, client)
    }

    #[test]
    fn connect_to_known_namespace_registers_socket() {
        let (_registry, transport, coord, client) = setup();
        let rx = transport.register("c1");
        client.connect_namespace("/", Value::Null).unwrap();
        assert!(client.socket("/").is_some());
        let frame = rx.recv().unwrap();
        match frame {
            // "4" is the MESSAGE transport envelope; "0" after it is the
            // application-level CONNECT packet type.
            OutboundFrame::Text(t) => assert!(t.starts_with("40")),
            other => panic!("unexpected {:?}", other),
        }
        coord.shutdown();
    }

    #[test]
    fn connect_to_unknown_namespace_sends_connect_error() {
        let (_registry, transport, coord, client) = setup();
        let rx = transport.register("c1");
        client.connect_namespace("/missing", Value::Null).unwrap();
        assert!(client.socket("/missing").is_none());
        let frame = rx.recv().unwrap();
        match frame {
            OutboundFrame::Text(t) => assert!(t.starts_with("44")),
            other => panic!("unexpected {:?}", other),
        }
        coord.shutdown();
    }

    #[test]
    fn disconnect_all_clears_sockets() {
        let (_registry, transport, coord, client) = setup();
        let _rx = transport.register("c1");
        client.connect_namespace("/", Value::Null).unwrap();
        client.disconnect_all("bye");
        assert!(client.socket("/").is_none());
        coord.shutdown();
    }
}
