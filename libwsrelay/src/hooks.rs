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

/// Observation points a host program can wire up to react to engine
/// lifecycle events, mostly useful for metrics and tests.
///
/// Every method has a default no-op body so implementors only override
/// what they care about. Hooks run inline on whatever thread triggered
/// the event, so a slow hook body will stall that connection's dispatch.
pub trait Hooks {
    fn on_connect(&self, _nsp: &str, _sid: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_disconnect(&self, _nsp: &str, _sid: &str, _reason: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_new_namespace(&self, _nsp: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_ack_timeout(&self, _ack_id: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A [`Hooks`] implementation that does nothing, for callers that don't
/// need to observe engine lifecycle events.
pub struct NoopHooks;

impl Hooks for NoopHooks {}
