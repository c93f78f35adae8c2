use std::collections::HashMap;

use crate::error::{CoreError, Result};

/// Correlates an id minted on an outgoing hop back to the id it arrived
/// with on the incoming hop, so a response can be rewritten back into the
/// namespace of whoever originally asked.
///
/// Grounded on the original `RouteMap`: an outgoing id maps to exactly one
/// incoming id; re-adding an identical pair is a no-op, re-adding a
/// conflicting pair is an error, and `remove` on an absent key is an error.
#[derive(Debug, Default)]
pub struct RouteMap {
    outgoing_to_incoming: HashMap<String, String>,
}

impl RouteMap {
    pub fn new() -> Self {
        RouteMap::default()
    }

    /// Record that `outgoing` (our id) corresponds to `incoming` (theirs).
    pub fn add(&mut self, incoming: impl Into<String>, outgoing: impl Into<String>) -> Result<()> {
        let incoming = incoming.into();
        let outgoing = outgoing.into();
        match self.outgoing_to_incoming.get(&outgoing) {
            Some(existing) if *existing == incoming => Ok(()),
            Some(existing) => Err(CoreError::RouteConflict {
                outgoing,
                existing: existing.clone(),
                incoming,
            }),
            None => {
                self.outgoing_to_incoming.insert(outgoing, incoming);
                Ok(())
            }
        }
    }

    pub fn get_incoming(&self, outgoing: &str) -> Result<&str> {
        self.outgoing_to_incoming
            .get(outgoing)
            .map(String::as_str)
            .ok_or_else(|| CoreError::RouteNotFound(outgoing.to_string()))
    }

    /// All outgoing ids currently routed to `incoming` (used on cancel
    /// fan-out, where one incoming request may have spawned several
    /// outgoing helper/worker requests).
    pub fn get_outgoing(&self, incoming: &str) -> Vec<&str> {
        self.outgoing_to_incoming
            .iter()
            .filter(|(_, inc)| inc.as_str() == incoming)
            .map(|(out, _)| out.as_str())
            .collect()
    }

    pub fn remove(&mut self, outgoing: &str) -> Result<()> {
        self.outgoing_to_incoming
            .remove(outgoing)
            .map(|_| ())
            .ok_or_else(|| CoreError::RouteNotFound(outgoing.to_string()))
    }

    pub fn contains(&self, outgoing: &str) -> bool {
        self.outgoing_to_incoming.contains_key(outgoing)
    }
}
