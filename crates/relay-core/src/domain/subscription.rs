//! Per-client interest table and the composite subscription.
//!
//! The control process accepts exactly one subscription per connection, so
//! the broker must subscribe upstream to the *union* of what every client
//! wants (the composite) and then hand each client only its own slice of the
//! pushes that come back.
//!
//! ```text
//! client A: toolhead[position]           ┐
//! client B: toolhead[homed_axes], fan[*] ├─► composite: toolhead[homed_axes, position], fan[*]
//! internal: print_stats[state]           ┘              print_stats[state]
//! ```
//!
//! [`SubscriptionTable`] keeps both views consistent: every mutation
//! recomputes the composite for exactly the objects it touched and reports
//! whether the composite changed, so the caller knows when a resubscription
//! is needed.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::domain::interest::{AttributeSet, InterestChanges, InterestMap};

/// Interest of every subscriber plus their union.
///
/// `K` identifies a subscriber (a client connection or an internal
/// component).
#[derive(Debug, Clone)]
pub struct SubscriptionTable<K> {
    clients: BTreeMap<K, InterestMap>,
    composite: InterestMap,
}

impl<K: Ord + Clone> SubscriptionTable<K> {
    pub fn new() -> Self {
        Self {
            clients: BTreeMap::new(),
            composite: InterestMap::new(),
        }
    }

    /// Replaces `client`'s interest for exactly the objects named in
    /// `changes`; other objects keep their previous interest.
    ///
    /// Returns `true` if the composite changed.
    pub fn apply(&mut self, client: &K, changes: &InterestChanges) -> bool {
        let entry = self.clients.entry(client.clone()).or_default();
        for (object, change) in changes {
            match change {
                Some(set) if !set.is_empty() => {
                    entry.insert(object.clone(), set.clone());
                }
                _ => {
                    entry.remove(object);
                }
            }
        }
        if entry.is_empty() {
            self.clients.remove(client);
        }

        let mut changed = false;
        for object in changes.keys() {
            changed |= self.recompute(object);
        }
        changed
    }

    /// Drops every interest of `client`.  Returns `true` if the composite
    /// changed (shrank).
    pub fn remove_client(&mut self, client: &K) -> bool {
        let Some(interest) = self.clients.remove(client) else {
            return false;
        };
        let mut changed = false;
        for object in interest.keys() {
            changed |= self.recompute(object);
        }
        changed
    }

    /// The current union of all interests.
    pub fn composite(&self) -> &InterestMap {
        &self.composite
    }

    /// Interest registered for `client`, if any.
    pub fn interest(&self, client: &K) -> Option<&InterestMap> {
        self.clients.get(client)
    }

    /// Number of subscribers with at least one object of interest.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Splits a status push into per-subscriber slices.
    ///
    /// A subscriber appears in the result only if at least one attribute it
    /// asked for is present in `status`; its slice contains nothing else.
    pub fn route(&self, status: &Map<String, Value>) -> Vec<(K, Map<String, Value>)> {
        let mut out = Vec::new();
        for (client, interest) in &self.clients {
            let mut slice = Map::new();
            for (object, fields) in status {
                let (Some(wanted), Some(fields)) = (interest.get(object), fields.as_object())
                else {
                    continue;
                };
                let filtered = wanted.filter(fields);
                if !filtered.is_empty() {
                    slice.insert(object.clone(), Value::Object(filtered));
                }
            }
            if !slice.is_empty() {
                out.push((client.clone(), slice));
            }
        }
        out
    }

    /// Recomputes the composite entry for one object.  Returns `true` if it
    /// changed.
    fn recompute(&mut self, object: &str) -> bool {
        let mut union: Option<AttributeSet> = None;
        for interest in self.clients.values() {
            if let Some(set) = interest.get(object) {
                match union.as_mut() {
                    Some(u) => u.merge(set),
                    None => union = Some(set.clone()),
                }
            }
        }

        let previous = self.composite.get(object);
        if previous == union.as_ref() {
            return false;
        }
        match union {
            Some(set) => {
                self.composite.insert(object.to_string(), set);
            }
            None => {
                self.composite.remove(object);
            }
        }
        true
    }
}

impl<K: Ord + Clone> Default for SubscriptionTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
