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

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use libwsrelay::ack::AckOutcome;
use libwsrelay::config::{read_config, ResolvedConfig};
use libwsrelay::transport::{ChannelTransport, OutboundFrame, Transport};
use libwsrelay::Engine;
use wsrelay_protocol::Value;

#[derive(Parser, Debug)]
#[command(name = "wsrelay", version, about = "A namespace/room/ack event-relay engine")]
struct Args {
    /// Path to a TOML config file. Defaults to the engine's built-in
    /// settings if not given.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Spins up an in-process engine and drives a couple of sockets
    /// through it over a loopback transport, printing what happens.
    /// Useful for poking at the engine without standing up a real
    /// WebSocket listener.
    Demo {
        /// Name of the room the demo sockets join before broadcasting.
        #[arg(long, default_value = "lobby")]
        room: String,
    },
    /// Parses a config file and prints the resolved settings, without
    /// starting anything.
    CheckConfig,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt().with_target(false).init();

    let config = match &args.config {
        Some(path) => read_config(path)
            .with_context(|| format!("failed to load config from '{}'", path.display()))?
            .resolve(),
        None => ResolvedConfig::default(),
    };

    match args.command {
        Commands::Demo { room } => run_demo(config, &room),
        Commands::CheckConfig => {
            println!("{:#?}", config);
            Ok(())
        }
    }
}

fn run_demo(config: ResolvedConfig, room: &str) -> anyhow::Result<()> {
    let engine = Engine::new(config);
    let ns = engine.registry.add_exact("/");
    ns.on(
        "echo",
        Arc::new(|socket, args, ack| {
            if let Some(ack) = ack {
                ack(args);
            } else {
                let _ = socket.emit("echo", args);
            }
        }),
    );

    let transport = Arc::new(ChannelTransport::new());

    let alice_id = Engine::next_connection_id();
    let alice_rx = transport.register(&alice_id);
    let alice = engine.accept(alice_id, transport.clone() as Arc<dyn Transport>)?;
    alice.handle_text_frame("40")?;
    drain_frames(&alice_rx, "alice");

    let bob_id = Engine::next_connection_id();
    let bob_rx = transport.register(&bob_id);
    let bob = engine.accept(bob_id, transport.clone() as Arc<dyn Transport>)?;
    bob.handle_text_frame("40")?;
    drain_frames(&bob_rx, "bob");

    let alice_socket = alice.socket("/").expect("alice connected to /");
    let bob_socket = bob.socket("/").expect("bob connected to /");

    alice_socket.join(room.to_string());
    bob_socket.join(room.to_string());
    println!("alice and bob joined room '{room}'");

    alice_socket.to(room.to_string()).emit("tick", Value::String("hello room".to_string()))?;
    println!("alice broadcast 'tick' to the room (excluding herself)");
    drain_frames(&bob_rx, "bob");
    drain_frames(&alice_rx, "alice");

    let outcome = alice_socket
        .broadcast()
        .to(room.to_string())
        .timeout(Duration::from_millis(200))
        .emit_with_ack("ping", Value::Null);
    match outcome {
        AckOutcome::Responses(v) => println!("room ack: all {} targets replied", v.len()),
        AckOutcome::Timeout(v) => println!("room ack: timed out with {} of the expected replies", v.len()),
        AckOutcome::Disconnected => println!("room ack: target disconnected"),
        AckOutcome::Rejected(reason) => println!("room ack: event rejected: {reason}"),
    }

    engine.shutdown();
    Ok(())
}

fn drain_frames(rx: &crossbeam_channel::Receiver<OutboundFrame>, who: &str) {
    while let Ok(frame) = rx.try_recv() {
        match frame {
            OutboundFrame::Text(t) => println!("{who} <- text: {t}"),
            OutboundFrame::Binary(b) => println!("{who} <- binary: {} bytes", b.len()),
        }
    }
}
