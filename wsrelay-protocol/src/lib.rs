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

//! Wire types shared between the wsrelay daemon and its clients: the
//! transport/application packet envelopes, the binary attachment codec,
//! and the error taxonomy that decoding can produce.

pub mod errors;
pub mod packet;
pub mod value;

pub use errors::ProtocolError;
pub use packet::{
    is_reserved_event, OpenPacketPayload, Packet, PacketType, Reassembler, TransportPacket,
    TransportPacketType, RESERVED_EVENTS,
};
pub use value::Value;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
