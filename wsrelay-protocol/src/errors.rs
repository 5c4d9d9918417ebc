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

use std::fmt;

/// Errors produced while decoding or validating a wire packet.
///
/// Kept as a manual enum rather than a generic `anyhow::Error` because
/// callers at the transport boundary need to distinguish a malformed frame
/// (drop the connection) from a reserved-event violation (reject the single
/// packet and keep the connection open).
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// The transport packet type byte was not one of the known kinds.
    UnknownTransportType(u8),
    /// The application packet type byte was not one of the known kinds.
    UnknownPacketType(u8),
    /// The payload after the type byte was not valid JSON.
    MalformedJson(String),
    /// A BINARY_EVENT/BINARY_ACK packet declared an attachment count that
    /// didn't match what was actually reattached.
    AttachmentCountMismatch { declared: usize, actual: usize },
    /// An EVENT or BINARY_EVENT packet's head element is a reserved name
    /// that user code is never allowed to receive directly.
    ReservedEventName(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownTransportType(b) => {
                write!(f, "unknown transport packet type byte {}", b)
            }
            ProtocolError::UnknownPacketType(b) => {
                write!(f, "unknown application packet type byte {}", b)
            }
            ProtocolError::MalformedJson(msg) => write!(f, "malformed json payload: {}", msg),
            ProtocolError::AttachmentCountMismatch { declared, actual } => write!(
                f,
                "declared {} attachments but {} were reattached",
                declared, actual
            ),
            ProtocolError::ReservedEventName(name) => {
                write!(f, "'{}' is a reserved event name and cannot be emitted over the wire", name)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
