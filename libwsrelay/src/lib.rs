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

//! The namespace/room/ack engine that sits behind a wsrelay daemon.
//!
//! A host program owns the real transport (a WebSocket listener, an
//! Engine.IO polling endpoint, whatever); this crate owns everything
//! above that: namespace routing, room membership, acknowledgement
//! bookkeeping and session recovery. [`Engine`] is the entry point that
//! wires those pieces together.

pub mod ack;
pub mod adapter;
pub mod client;
pub mod config;
pub mod consts;
pub mod errors;
pub mod hooks;
pub mod namespace;
pub mod operators;
pub mod recovery;
pub mod registry;
pub mod socket;
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::instrument;

use crate::ack::AckCoordinator;
use crate::client::Client;
use crate::config::ResolvedConfig;
use crate::consts::ACK_REAPER_SWEEP_INTERVAL;
use crate::hooks::{Hooks, NoopHooks};
use crate::recovery::RecoveryStore;
use crate::registry::NamespaceRegistry;
use crate::transport::Transport;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Owns the namespace registry, the ack coordinator's reaper thread, and
/// (optionally) the recovery store's reaper thread, and hands out a
/// [`Client`] for each new physical connection a host program accepts.
pub struct Engine {
    pub registry: Arc<NamespaceRegistry>,
    ack_coordinator: Arc<AckCoordinator>,
    recovery: Option<Arc<RecoveryStore>>,
    config: ResolvedConfig,
    hooks: Arc<dyn Hooks + Send + Sync>,
}

impl Engine {
    pub fn new(config: ResolvedConfig) -> Engine {
        Engine::with_hooks(config, Arc::new(NoopHooks))
    }

    pub fn with_hooks(config: ResolvedConfig, hooks: Arc<dyn Hooks + Send + Sync>) -> Engine {
        let recovery = if config.connection_state_recovery {
            Some(RecoveryStore::spawn(
                config.recovery_window,
                config.recovery_buffer_len,
                ACK_REAPER_SWEEP_INTERVAL,
            ))
        } else {
            None
        };
        Engine {
            registry: Arc::new(NamespaceRegistry::new()),
            ack_coordinator: AckCoordinator::spawn(ACK_REAPER_SWEEP_INTERVAL),
            recovery,
            config,
            hooks,
        }
    }

    /// Accepts a new physical connection over `transport`, under the
    /// connection id `id` that the transport already registered (e.g. the
    /// id passed to `ChannelTransport::register`). Sends the handshake
    /// packet before returning the `Client` the host program should feed
    /// incoming frames into.
    #[instrument(skip(self, transport))]
    pub fn accept(&self, id: impl Into<String>, transport: Arc<dyn Transport>) -> anyhow::Result<Arc<Client>> {
        let client = Arc::new(Client::new(
            id.into(),
            Arc::clone(&self.registry),
            transport,
            Arc::clone(&self.ack_coordinator),
            self.recovery.clone(),
            self.config.clone(),
            Arc::clone(&self.hooks),
        ));
        client.send_handshake()?;
        client.arm_connect_timeout();
        Ok(client)
    }

    pub fn next_connection_id() -> String {
        format!("c{:x}", NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn shutdown(&self) {
        self.ack_coordinator.shutdown();
        if let Some(recovery) = &self.recovery {
            recovery.shutdown();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::{ChannelTransport, OutboundFrame};
    use std::sync::Arc;
    use wsrelay_protocol::{Packet, PacketType, TransportPacket, Value};

    #[test]
    fn end_to_end_echo_with_ack() {
        let engine = Engine::new(ResolvedConfig::default());
        engine.registry.add_exact("/");
        engine.registry.existing("/").unwrap().on(
            "echo",
            Arc::new(|_socket, args, ack| {
                if let Some(ack) = ack {
                    ack(args);
                }
            }),
        );

        let transport = Arc::new(ChannelTransport::new());
        let id = Engine::next_connection_id();
        let rx = transport.register(&id);
        let client = engine.accept(id.clone(), transport as Arc<dyn crate::transport::Transport>).unwrap();
        assert!(matches!(rx.recv().unwrap(), OutboundFrame::Text(t) if t.starts_with('0')));

        client.handle_text_frame("40").unwrap();
        assert!(matches!(rx.recv().unwrap(), OutboundFrame::Text(t) if t.starts_with("40")));

        // Drive a real inbound EVENT carrying an ack id through the wire,
        // the way a client requesting an acknowledgement would.
        let event = Packet {
            packet_type: PacketType::Event,
            nsp: "/".to_string(),
            id: Some(99),
            data: Some(Value::List(vec![Value::String("echo".to_string()), Value::String("ping".to_string())])),
        };
        let (header, _) = event.encode().unwrap();
        client.handle_text_frame(&TransportPacket::message_frame(header)).unwrap();

        match rx.recv().unwrap() {
            // "43" is the MESSAGE envelope followed by the ACK packet type.
            OutboundFrame::Text(t) => {
                assert!(t.starts_with("43"));
                assert!(t.contains("ping"));
            }
            other => panic!("unexpected {:?}", other),
        }

        engine.shutdown();
    }

    #[test]
    fn room_broadcast_reaches_members_not_sender() {
        let engine = Engine::new(ResolvedConfig::default());
        let ns = engine.registry.add_exact("/");

        let transport = Arc::new(ChannelTransport::new());
        let sender_id = Engine::next_connection_id();
        let _sender_rx = transport.register(&sender_id);
        let sender_client = engine.accept(sender_id.clone(), transport.clone() as Arc<dyn crate::transport::Transport>).unwrap();
        sender_client.handle_text_frame("40").unwrap();
        let sender_socket = sender_client.socket("/").unwrap();

        let member_id = Engine::next_connection_id();
        let member_rx = transport.register(&member_id);
        let member_client = engine.accept(member_id.clone(), transport.clone() as Arc<dyn crate::transport::Transport>).unwrap();
        member_client.handle_text_frame("40").unwrap();
        let member_socket = member_client.socket("/").unwrap();

        sender_socket.join("lobby");
        member_socket.join("lobby");

        sender_socket.to("lobby").emit("tick", Value::Null).unwrap();

        let _handshake = member_rx.recv().unwrap();
        let _connect_ack = member_rx.recv().unwrap();
        let frame = member_rx.recv().unwrap();
        assert!(matches!(frame, OutboundFrame::Text(t) if t.contains("tick")));

        let _ = ns;
        engine.shutdown();
    }
}
