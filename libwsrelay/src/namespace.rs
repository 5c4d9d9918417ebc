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

use tracing::{instrument, warn};
use wsrelay_protocol::Value;

use crate::adapter::Adapter;
use crate::errors::MiddlewareError;
use crate::socket::Socket;

/// Information available to a middleware at connect time, before a
/// `Socket` has been constructed.
pub struct ConnectInfo {
    pub nsp: String,
    pub sid: String,
    pub auth: Value,
}

pub type Middleware = Box<dyn Fn(&ConnectInfo) -> Result<(), MiddlewareError> + Send + Sync>;
/// Handed to an event handler in place of a bare ack id: calling it sends a
/// real ACK packet back to the socket that requested one. `None` means the
/// inbound EVENT carried no `id` and no ack is expected.
pub type AckCallback = Box<dyn FnOnce(Value) + Send>;
pub type EventHandler = Arc<dyn Fn(Arc<Socket>, Value, Option<AckCallback>) + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn(Arc<Socket>, String) + Send + Sync>;

/// One addressable namespace: its own room index, its own connected
/// sockets, and its own middleware and event-handler registrations,
/// independent of every other namespace multiplexed over the same
/// physical connection.
pub struct Namespace {
    pub name: String,
    pub adapter: Adapter,
    sockets: Mutex<HashMap<String, Arc<Socket>>>,
    middlewares: Mutex<Vec<Middleware>>,
    event_handlers: Mutex<HashMap<String, EventHandler>>,
    disconnect_handlers: Mutex<Vec<DisconnectHandler>>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Namespace {
        Namespace {
            name: name.into(),
            adapter: Adapter::new(),
            sockets: Mutex::new(HashMap::new()),
            middlewares: Mutex::new(Vec::new()),
            event_handlers: Mutex::new(HashMap::new()),
            disconnect_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn use_middleware(&self, mw: Middleware) {
        self.middlewares.lock().unwrap().push(mw);
    }

    pub fn on(&self, event: impl Into<String>, handler: EventHandler) {
        self.event_handlers.lock().unwrap().insert(event.into(), handler);
    }

    pub fn on_disconnect(&self, handler: DisconnectHandler) {
        self.disconnect_handlers.lock().unwrap().push(handler);
    }

    /// Runs every registered middleware in registration order, stopping
    /// at the first rejection.
    #[instrument(skip(self, info))]
    pub fn run_middlewares(&self, info: &ConnectInfo) -> Result<(), MiddlewareError> {
        for mw in self.middlewares.lock().unwrap().iter() {
            mw(info)?;
        }
        Ok(())
    }

    pub fn register_socket(&self, socket: Arc<Socket>) {
        self.sockets.lock().unwrap().insert(socket.sid.clone(), socket);
    }

    pub fn remove_socket(&self, sid: &str) -> Option<Arc<Socket>> {
        self.sockets.lock().unwrap().remove(sid)
    }

    pub fn socket(&self, sid: &str) -> Option<Arc<Socket>> {
        self.sockets.lock().unwrap().get(sid).cloned()
    }

    pub fn connected_sids(&self) -> Vec<String> {
        self.sockets.lock().unwrap().keys().cloned().collect()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }

    /// Dispatches a decoded EVENT to whichever handler is registered for
    /// its head element. Events with no registered handler are dropped
    /// with a warning rather than treated as an error: a client emitting
    /// an event the server doesn't listen for is normal, not exceptional.
    #[instrument(skip(self, socket, args, ack))]
    pub fn dispatch_event(&self, socket: Arc<Socket>, event: &str, args: Value, ack: Option<AckCallback>) {
        let handler = self.event_handlers.lock().unwrap().get(event).cloned();
        match handler {
            Some(handler) => handler(socket, args, ack),
            None => warn!(nsp = %self.name, event, "no handler registered for event"),
        }
    }

    pub fn run_disconnect_handlers(&self, socket: Arc<Socket>, reason: String) {
        for handler in self.disconnect_handlers.lock().unwrap().iter() {
            handler(Arc::clone(&socket), reason.clone());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn middleware_can_reject_connect() {
        let ns = Namespace::new("/chat");
        ns.use_middleware(Box::new(|info| {
            if info.sid == "banned" {
                Err(MiddlewareError { reason: "banned sid".to_string() })
            } else {
                Ok(())
            }
        }));

        let ok = ns.run_middlewares(&ConnectInfo {
            nsp: "/chat".to_string(),
            sid: "ok".to_string(),
            auth: Value::Null,
        });
        assert!(ok.is_ok());

        let rejected = ns.run_middlewares(&ConnectInfo {
            nsp: "/chat".to_string(),
            sid: "banned".to_string(),
            auth: Value::Null,
        });
        assert!(rejected.is_err());
    }

    #[test]
    fn unregistered_event_is_dropped_not_panicked() {
        let ns = Namespace::new("/");
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        ns.on("known", Arc::new(move |_socket, _args, _ack| {
            fired2.store(true, Ordering::SeqCst);
        }));

        // dispatch_event needs a real Socket; constructing one here would
        // pull in client/transport wiring, so this test only exercises
        // the handler-lookup miss path via the handlers map directly.
        assert!(ns.event_handlers.lock().unwrap().get("unknown").is_none());
        assert!(!fired.load(Ordering::SeqCst));
    }
}
