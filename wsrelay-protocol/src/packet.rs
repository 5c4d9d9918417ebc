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

use serde_derive::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::errors::ProtocolError;
use crate::value::Value;

/// Event names that are part of the protocol's own lifecycle and can never
/// be the head of a client-emitted or server-emitted EVENT packet.
pub const RESERVED_EVENTS: &[&str] = &[
    "connect",
    "connect_error",
    "disconnect",
    "disconnecting",
    "newListener",
    "removeListener",
];

pub fn is_reserved_event(name: &str) -> bool {
    RESERVED_EVENTS.contains(&name)
}

/// TransportPacketType tags the outer envelope exchanged with the
/// underlying WebSocket/polling transport, independent of any namespace
/// multiplexing happening above it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportPacketType {
    Open = 0,
    Close = 1,
    Ping = 2,
    Pong = 3,
    Message = 4,
    Upgrade = 5,
    Noop = 6,
}

impl TryFrom<u8> for TransportPacketType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(TransportPacketType::Open),
            1 => Ok(TransportPacketType::Close),
            2 => Ok(TransportPacketType::Ping),
            3 => Ok(TransportPacketType::Pong),
            4 => Ok(TransportPacketType::Message),
            5 => Ok(TransportPacketType::Upgrade),
            6 => Ok(TransportPacketType::Noop),
            other => Err(ProtocolError::UnknownTransportType(other)),
        }
    }
}

/// The handshake payload sent in the OPEN transport packet right after a
/// client connects, before any namespace has been joined.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OpenPacketPayload {
    pub sid: String,
    pub upgrades: Vec<String>,
    #[serde(rename = "pingInterval")]
    pub ping_interval_ms: u64,
    #[serde(rename = "pingTimeout")]
    pub ping_timeout_ms: u64,
    #[serde(rename = "maxPayload")]
    pub max_payload_bytes: u64,
}

/// A fully framed transport-level packet: a type tag plus an optional text
/// body. `Message` packets carry an application `Packet` in their body;
/// `Open`/`Close`/etc. carry protocol-managed bodies or nothing at all.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportPacket {
    pub kind: TransportPacketType,
    pub body: Option<String>,
}

impl TransportPacket {
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(&(self.kind as u8).to_string());
        if let Some(body) = &self.body {
            out.push_str(body);
        }
        out
    }

    /// Wraps an already-encoded application packet header in a MESSAGE
    /// envelope and returns the encoded transport frame text, the form
    /// every application packet actually travels over the wire in.
    pub fn message_frame(packet_header: impl Into<String>) -> String {
        TransportPacket { kind: TransportPacketType::Message, body: Some(packet_header.into()) }.encode()
    }

    pub fn decode(raw: &str) -> Result<TransportPacket, ProtocolError> {
        let mut chars = raw.chars();
        let tag = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .ok_or(ProtocolError::UnknownTransportType(0xff))? as u8;
        let kind = TransportPacketType::try_from(tag)?;
        let rest: String = chars.collect();
        let body = if rest.is_empty() { None } else { Some(rest) };
        Ok(TransportPacket { kind, body })
    }
}

/// The type byte of an application-level (Engine.IO "message" body) packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketType {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl PacketType {
    pub fn is_binary(self) -> bool {
        matches!(self, PacketType::BinaryEvent | PacketType::BinaryAck)
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(PacketType::Connect),
            1 => Ok(PacketType::Disconnect),
            2 => Ok(PacketType::Event),
            3 => Ok(PacketType::Ack),
            4 => Ok(PacketType::ConnectError),
            5 => Ok(PacketType::BinaryEvent),
            6 => Ok(PacketType::BinaryAck),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// A decoded, namespace-addressed application packet, with any binary
/// attachments already reattached into `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub nsp: String,
    pub id: Option<u64>,
    pub data: Option<Value>,
}

impl Packet {
    pub fn event(nsp: impl Into<String>, data: Value) -> Packet {
        Packet { packet_type: PacketType::Event, nsp: nsp.into(), id: None, data: Some(data) }
    }

    /// Validates that an EVENT/BINARY_EVENT packet's head element, if
    /// present, is not one of the reserved lifecycle event names.
    pub fn check_reserved(&self) -> Result<(), ProtocolError> {
        if !matches!(self.packet_type, PacketType::Event | PacketType::BinaryEvent) {
            return Ok(());
        }
        if let Some(Value::List(items)) = &self.data {
            if let Some(Value::String(head)) = items.first() {
                if is_reserved_event(head) {
                    return Err(ProtocolError::ReservedEventName(head.clone()));
                }
            }
        }
        Ok(())
    }

    /// Encodes this packet into its text header (with attachment count
    /// placeholders already substituted in `data`) plus any raw binary
    /// buffers that must follow as separate binary frames.
    pub fn encode(&self) -> Result<(String, Vec<Vec<u8>>), ProtocolError> {
        let mut attachments = Vec::new();
        let data = match &self.data {
            Some(v) if v.has_binary() => v
                .detach_binary(&mut attachments)
                .map_err(|e| ProtocolError::MalformedJson(e.to_string()))?,
            Some(v) => v.clone(),
            None => Value::Null,
        };
        let packet_type = if attachments.is_empty() {
            self.packet_type
        } else {
            match self.packet_type {
                PacketType::Event => PacketType::BinaryEvent,
                PacketType::Ack => PacketType::BinaryAck,
                other => other,
            }
        };

        let mut header = String::new();
        header.push_str(&(packet_type as u8).to_string());
        if packet_type.is_binary() {
            header.push_str(&attachments.len().to_string());
            header.push('-');
        }
        if self.nsp != "/" {
            header.push_str(&self.nsp);
            header.push(',');
        }
        if let Some(id) = self.id {
            header.push_str(&id.to_string());
        }
        if self.data.is_some() {
            header.push_str(&data.to_json().to_string());
        }
        Ok((header, attachments))
    }

    /// Decodes a text header produced by `encode`. For BINARY_EVENT/
    /// BINARY_ACK packets the caller must supply the reassembled
    /// attachment buffers collected from the frames that followed.
    pub fn decode(header: &str, attachments: &[Vec<u8>]) -> Result<Packet, ProtocolError> {
        let mut chars = header.char_indices();
        let (_, tag_ch) = chars.next().ok_or(ProtocolError::UnknownPacketType(0xff))?;
        let tag = tag_ch.to_digit(10).ok_or(ProtocolError::UnknownPacketType(0xff))? as u8;
        let packet_type = PacketType::try_from(tag)?;

        let mut rest = &header[tag_ch.len_utf8()..];
        let mut declared_attachments = 0usize;
        if packet_type.is_binary() {
            let dash = rest.find('-').ok_or(ProtocolError::UnknownPacketType(tag))?;
            declared_attachments = rest[..dash].parse().unwrap_or(0);
            rest = &rest[dash + 1..];
        }

        let (nsp, rest) = if let Some(stripped) = rest.strip_prefix('/') {
            match stripped.find(',') {
                Some(comma) => (format!("/{}", &stripped[..comma]), &stripped[comma + 1..]),
                None => (format!("/{}", stripped), ""),
            }
        } else {
            ("/".to_string(), rest)
        };

        let digit_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let id = if digit_end > 0 { rest[..digit_end].parse().ok() } else { None };
        let json_str = &rest[digit_end..];

        let data = if json_str.is_empty() {
            None
        } else {
            let json: JsonValue = serde_json::from_str(json_str)
                .map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
            Some(Value::from_json(json))
        };

        let data = match data {
            Some(v) if packet_type.is_binary() => {
                if declared_attachments != attachments.len() {
                    return Err(ProtocolError::AttachmentCountMismatch {
                        declared: declared_attachments,
                        actual: attachments.len(),
                    });
                }
                Some(
                    v.reattach_binary(attachments)
                        .map_err(|e| ProtocolError::MalformedJson(e.to_string()))?,
                )
            }
            other => other,
        };

        let packet_type = match packet_type {
            PacketType::BinaryEvent => PacketType::Event,
            PacketType::BinaryAck => PacketType::Ack,
            other => other,
        };

        let packet = Packet { packet_type, nsp, id, data };
        packet.check_reserved()?;
        Ok(packet)
    }
}

/// Accumulates a BINARY_EVENT/BINARY_ACK header and the raw attachment
/// frames that trail it, yielding a fully decoded `Packet` once every
/// declared attachment has arrived.
///
/// Mirrors the streaming decode/reassembly split that a length-prefixed
/// chunk protocol needs: the header tells you how many binary frames to
/// expect, and you can't hand the caller a usable packet until they've all
/// shown up.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending_header: Option<String>,
    expected: usize,
    collected: Vec<Vec<u8>>,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler::default()
    }

    /// Feed a text header. Returns `Some(packet)` immediately if the packet
    /// declares zero attachments, otherwise starts buffering and returns
    /// `None` until `feed_binary` completes it.
    pub fn feed_header(&mut self, header: &str) -> Result<Option<Packet>, ProtocolError> {
        let declared = declared_attachment_count(header);
        if declared == 0 {
            return Packet::decode(header, &[]).map(Some);
        }
        self.pending_header = Some(header.to_string());
        self.expected = declared;
        self.collected.clear();
        Ok(None)
    }

    pub fn feed_binary(&mut self, buf: Vec<u8>) -> Result<Option<Packet>, ProtocolError> {
        self.collected.push(buf);
        if self.collected.len() < self.expected {
            return Ok(None);
        }
        let header = self
            .pending_header
            .take()
            .ok_or(ProtocolError::AttachmentCountMismatch { declared: 0, actual: self.collected.len() })?;
        let attachments = std::mem::take(&mut self.collected);
        self.expected = 0;
        Packet::decode(&header, &attachments).map(Some)
    }

    pub fn is_mid_reassembly(&self) -> bool {
        self.pending_header.is_some()
    }
}

fn declared_attachment_count(header: &str) -> usize {
    let Some(tag_ch) = header.chars().next() else { return 0 };
    let Some(tag) = tag_ch.to_digit(10) else { return 0 };
    if !matches!(tag, 5 | 6) {
        return 0;
    }
    let rest = &header[tag_ch.len_utf8()..];
    match rest.find('-') {
        Some(dash) => rest[..dash].parse().unwrap_or(0),
        None => 0,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    #[test]
    fn event_packet_round_trip() {
        let mut m = BTreeMap::new();
        m.insert("x".to_string(), Value::Number(1.0));
        let p = Packet {
            packet_type: PacketType::Event,
            nsp: "/chat".to_string(),
            id: Some(7),
            data: Some(Value::List(vec![Value::String("msg".to_string()), Value::Map(m)])),
        };
        let (header, attachments) = p.encode().unwrap();
        assert!(attachments.is_empty());
        let decoded = Packet::decode(&header, &attachments).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn binary_event_round_trip_via_reassembler() {
        let p = Packet {
            packet_type: PacketType::Event,
            nsp: "/".to_string(),
            id: None,
            data: Some(Value::List(vec![
                Value::String("frame".to_string()),
                Value::Bytes(vec![1, 2, 3, 4]),
            ])),
        };
        let (header, attachments) = p.encode().unwrap();
        assert_eq!(attachments.len(), 1);

        let mut reassembler = Reassembler::new();
        assert!(reassembler.feed_header(&header).unwrap().is_none());
        let decoded = reassembler.feed_binary(attachments[0].clone()).unwrap().unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn reserved_event_name_is_rejected() {
        let p = Packet {
            packet_type: PacketType::Event,
            nsp: "/".to_string(),
            id: None,
            data: Some(Value::List(vec![Value::String("connect".to_string())])),
        };
        let (header, _) = p.encode().unwrap();
        assert_matches!(Packet::decode(&header, &[]), Err(ProtocolError::ReservedEventName(name)) if name == "connect");
    }

    #[test]
    fn default_namespace_omitted_from_header() {
        let p = Packet::event("/", Value::List(vec![Value::String("ping".to_string())]));
        let (header, _) = p.encode().unwrap();
        assert!(!header.contains("/,"));
    }

    #[test]
    fn transport_packet_round_trip() {
        let tp = TransportPacket { kind: TransportPacketType::Message, body: Some("2[\"hi\"]".to_string()) };
        let raw = tp.encode();
        assert_eq!(TransportPacket::decode(&raw).unwrap(), tp);
    }
}
