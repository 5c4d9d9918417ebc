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

/// A middleware installed on a namespace rejected the connection.
#[derive(Debug, Clone)]
pub struct MiddlewareError {
    pub reason: String,
}

impl fmt::Display for MiddlewareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "middleware rejected connection: {}", self.reason)
    }
}

impl std::error::Error for MiddlewareError {}

/// An acknowledgement was not collected before its deadline elapsed.
#[derive(Debug, Clone)]
pub struct TimeoutError {
    pub ack_id: u64,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ack {} timed out before all expected replies arrived", self.ack_id)
    }
}

impl std::error::Error for TimeoutError {}

/// A socket the caller tried to act on is no longer connected.
#[derive(Debug, Clone)]
pub struct DisconnectedError {
    pub sid: String,
}

impl fmt::Display for DisconnectedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket {} is disconnected", self.sid)
    }
}

impl std::error::Error for DisconnectedError {}

/// The underlying transport refused or failed to deliver a packet.
#[derive(Debug, Clone)]
pub struct SendError {
    pub sid: String,
    pub reason: String,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to send to {}: {}", self.sid, self.reason)
    }
}

impl std::error::Error for SendError {}

/// Why a socket couldn't be attached to a namespace.
#[derive(Debug, Clone)]
pub enum ConnectError {
    Middleware(MiddlewareError),
    UnknownNamespace(String),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Middleware(e) => write!(f, "{}", e),
            ConnectError::UnknownNamespace(nsp) => write!(f, "no namespace matches '{}'", nsp),
        }
    }
}

impl std::error::Error for ConnectError {}
