// Identity: long-term keys and the peer identifier derived from them

mod keys;
mod store;

pub use keys::{peer_id_from_public_key, IdentityKeys};
pub use store::{IdentityStore, PlainGuard, SecretGuard};

use anyhow::Result;

/// Manages node identity keys
pub struct IdentityManager {
    store: IdentityStore,
    keys: Option<IdentityKeys>,
}

impl IdentityManager {
    pub fn new(store: IdentityStore) -> Self {
        Self { store, keys: None }
    }

    /// Load existing keys, or generate and persist a fresh identity
    pub fn initialize(&mut self) -> Result<&IdentityKeys> {
        let keys = match self.store.load_keys()? {
            Some(keys) => {
                tracing::info!("Loaded existing identity");
                keys
            }
            None => {
                tracing::info!("Generating new identity");
                let keys = IdentityKeys::generate();
                self.store.save_keys(&keys)?;
                keys
            }
        };
        Ok(self.keys.insert(keys))
    }

    pub fn keys(&self) -> Option<&IdentityKeys> {
        self.keys.as_ref()
    }

    pub fn peer_id(&self) -> Option<String> {
        self.keys.as_ref().map(|k| k.peer_id())
    }
}
