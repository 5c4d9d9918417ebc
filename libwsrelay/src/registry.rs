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

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use regex::Regex;
use tracing::instrument;

use crate::namespace::Namespace;

type NamespaceFactory = Arc<dyn Fn(&str) -> Namespace + Send + Sync>;

/// How a parent namespace pattern decides whether it owns a given
/// namespace name.
enum Pattern {
    /// Matches exactly one namespace string.
    Exact(String),
    /// Matches any namespace string the regex matches in full.
    Regex(Regex),
    /// Matches according to an arbitrary caller-supplied predicate.
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl Pattern {
    fn matches(&self, nsp: &str) -> bool {
        match self {
            Pattern::Exact(want) => want == nsp,
            Pattern::Regex(re) => re.is_match(nsp),
            Pattern::Predicate(f) => f(nsp),
        }
    }
}

/// Owns every namespace the server knows about, and knows how to create
/// one on demand the first time a client connects to a name that matches
/// a registered pattern.
///
/// A namespace registered with [`NamespaceRegistry::add_exact`] is
/// created eagerly the moment it's registered. A namespace registered
/// with [`NamespaceRegistry::add_regex`] or
/// [`NamespaceRegistry::add_predicate`] is a *parent*: it doesn't exist as
/// a concrete namespace itself, but any connect to a name it matches gets
/// a freshly minted child namespace, cached from then on.
pub struct NamespaceRegistry {
    parents: Mutex<Vec<(Pattern, NamespaceFactory)>>,
    namespaces: Mutex<HashMap<String, Arc<Namespace>>>,
    /// Names of namespaces created lazily from a parent pattern, as opposed
    /// to registered eagerly via `add_exact`. Only these are eligible for
    /// `cleanup_if_empty` self-destruction.
    dynamic: Mutex<HashSet<String>>,
}

impl NamespaceRegistry {
    pub fn new() -> NamespaceRegistry {
        NamespaceRegistry {
            parents: Mutex::new(Vec::new()),
            namespaces: Mutex::new(HashMap::new()),
            dynamic: Mutex::new(HashSet::new()),
        }
    }

    /// Registers and immediately creates a namespace reachable only under
    /// this exact name.
    pub fn add_exact(&self, name: impl Into<String>) -> Arc<Namespace> {
        let name = name.into();
        let ns = Arc::new(Namespace::new(name.clone()));
        self.namespaces.lock().unwrap().insert(name, Arc::clone(&ns));
        ns
    }

    /// Registers a parent pattern: any namespace name the regex matches
    /// gets created on first connect, using `Namespace::new` for its
    /// constructor.
    pub fn add_regex(&self, pattern: Regex) {
        self.parents.lock().unwrap().push((Pattern::Regex(pattern), Arc::new(|name: &str| Namespace::new(name))));
    }

    /// Registers a parent pattern matched by an arbitrary predicate
    /// instead of a regex, for matching logic a regex can't express.
    pub fn add_predicate(&self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.parents
            .lock()
            .unwrap()
            .push((Pattern::Predicate(Arc::new(predicate)), Arc::new(|name: &str| Namespace::new(name))));
    }

    /// Resolves a namespace name to its `Namespace`, creating and caching
    /// a child from the first matching parent pattern if one doesn't
    /// already exist. Returns `None` if the name isn't registered exactly
    /// and no parent pattern matches it.
    #[instrument(skip(self))]
    pub fn resolve(&self, nsp: &str) -> Option<Arc<Namespace>> {
        if let Some(ns) = self.namespaces.lock().unwrap().get(nsp) {
            return Some(Arc::clone(ns));
        }

        let factory = {
            let parents = self.parents.lock().unwrap();
            parents.iter().find(|(pattern, _)| pattern.matches(nsp)).map(|(_, f)| Arc::clone(f))
        };
        let factory = factory?;

        self.dynamic.lock().unwrap().insert(nsp.to_string());
        let mut namespaces = self.namespaces.lock().unwrap();
        // Another thread may have created it while we didn't hold the lock.
        Some(Arc::clone(
            namespaces.entry(nsp.to_string()).or_insert_with(|| Arc::new(factory(nsp))),
        ))
    }

    pub fn existing(&self, nsp: &str) -> Option<Arc<Namespace>> {
        self.namespaces.lock().unwrap().get(nsp).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Namespace>> {
        self.namespaces.lock().unwrap().values().cloned().collect()
    }

    /// Removes `nsp` if it was created from a parent pattern and no longer
    /// has any connected sockets. A no-op for namespaces registered via
    /// `add_exact`, which live for the lifetime of the registry.
    pub fn cleanup_if_empty(&self, nsp: &str) {
        if !self.dynamic.lock().unwrap().contains(nsp) {
            return;
        }
        let mut namespaces = self.namespaces.lock().unwrap();
        let empty = namespaces.get(nsp).map(|ns| ns.socket_count() == 0).unwrap_or(false);
        if empty {
            namespaces.remove(nsp);
            self.dynamic.lock().unwrap().remove(nsp);
        }
    }
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        NamespaceRegistry::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exact_namespace_resolves() {
        let reg = NamespaceRegistry::new();
        reg.add_exact("/chat");
        assert!(reg.resolve("/chat").is_some());
        assert!(reg.resolve("/other").is_none());
    }

    #[test]
    fn regex_parent_creates_child_on_first_connect() {
        let reg = NamespaceRegistry::new();
        reg.add_regex(Regex::new(r"^/dynamic-\w+$").unwrap());

        assert!(reg.existing("/dynamic-foo").is_none());
        let ns = reg.resolve("/dynamic-foo").unwrap();
        assert_eq!(ns.name, "/dynamic-foo");
        assert!(reg.existing("/dynamic-foo").is_some());
        assert!(reg.resolve("/dynamic-bar").is_some());
        assert!(reg.resolve("/nope").is_none());
    }

    #[test]
    fn predicate_parent_matches_custom_logic() {
        let reg = NamespaceRegistry::new();
        reg.add_predicate(|nsp| nsp.starts_with("/tenant-"));
        assert!(reg.resolve("/tenant-42").is_some());
        assert!(reg.resolve("/tenantx").is_none());
    }

    #[test]
    fn resolved_child_is_cached_not_recreated() {
        let reg = NamespaceRegistry::new();
        reg.add_regex(Regex::new(r"^/room-\d+$").unwrap());
        let first = reg.resolve("/room-1").unwrap();
        let second = reg.resolve("/room-1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn empty_dynamic_child_is_cleaned_up() {
        let reg = NamespaceRegistry::new();
        reg.add_regex(Regex::new(r"^/room-\d+$").unwrap());
        let ns = reg.resolve("/room-1").unwrap();
        let coord = crate::ack::AckCoordinator::spawn(std::time::Duration::from_secs(60));
        ns.register_socket(Arc::new(crate::socket::Socket::new(
            "s1".to_string(),
            "pid-1".to_string(),
            "s1".to_string(),
            &ns,
            Arc::new(crate::transport::ChannelTransport::new()),
            Arc::clone(&coord),
            None,
        )));
        reg.cleanup_if_empty("/room-1");
        assert!(reg.existing("/room-1").is_some(), "still has a socket, must not be cleaned up");

        ns.remove_socket("s1");
        reg.cleanup_if_empty("/room-1");
        assert!(reg.existing("/room-1").is_none());
        coord.shutdown();
    }

    #[test]
    fn exact_namespace_is_never_cleaned_up() {
        let reg = NamespaceRegistry::new();
        reg.add_exact("/chat");
        reg.cleanup_if_empty("/chat");
        assert!(reg.existing("/chat").is_some());
    }
}
