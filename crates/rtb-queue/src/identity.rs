//! Queue identity cache
//!
//! Each named subscriber gets one generated queue name for the life of the
//! process, so restarted or additional instances attach to the same queue.

use dashmap::DashMap;

/// Random bytes per identity; rendered as twice as many hex characters.
const IDENTITY_BYTES: usize = 16;

#[derive(Debug, Default)]
pub struct QueueIdentityCache {
    identities: DashMap<String, String>,
}

impl QueueIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached identity for `name`, generating it on first use.
    pub fn lookup_or_generate(&self, name: &str) -> String {
        self.identities
            .entry(name.to_string())
            .or_insert_with(generate_identity)
            .clone()
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        self.identities.get(name).map(|id| id.value().clone())
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

fn generate_identity() -> String {
    let bytes: [u8; IDENTITY_BYTES] = rand::random();
    hex::encode(bytes)
}
