//! Persisted per-client limit overrides.

use std::collections::HashMap;

use crate::security::token_bucket::Limit;

/// Explicit per-client limits, kept apart from the live buckets so a bucket
/// can be rebuilt from the client's last explicit settings.
#[derive(Debug, Default, Clone)]
pub struct ClientSettings {
    overrides: HashMap<String, Limit>,
}

impl ClientSettings {
    pub fn get(&self, client_id: &str) -> Option<Limit> {
        self.overrides.get(client_id).copied()
    }

    pub fn set(&mut self, client_id: &str, limit: Limit) {
        self.overrides.insert(client_id.to_string(), limit);
    }

    pub fn remove(&mut self, client_id: &str) -> Option<Limit> {
        self.overrides.remove(client_id)
    }
}
