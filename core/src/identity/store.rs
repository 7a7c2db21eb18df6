// Identity persistence behind an opaque at-rest protection service

use super::IdentityKeys;
use crate::store::backend::StorageBackend;
use anyhow::Result;
use std::sync::Arc;

const IDENTITY_KEY: &[u8] = b"identity_keys";

/// Opaque local secret service keyed by platform-backed material.
///
/// The node never sees how sealing works; it only round-trips bytes.
pub trait SecretGuard: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through guard for tests and platforms without a keystore
pub struct PlainGuard;

impl SecretGuard for PlainGuard {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        Ok(sealed.to_vec())
    }
}

/// Storage for identity keys
pub enum IdentityStore {
    Memory,
    Persistent {
        db: Arc<dyn StorageBackend>,
        guard: Arc<dyn SecretGuard>,
    },
}

impl IdentityStore {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn persistent(db: Arc<dyn StorageBackend>, guard: Arc<dyn SecretGuard>) -> Self {
        Self::Persistent { db, guard }
    }

    pub fn save_keys(&self, keys: &IdentityKeys) -> Result<()> {
        match self {
            Self::Memory => Ok(()),
            Self::Persistent { db, guard } => {
                let sealed = guard.seal(&keys.to_bytes())?;
                db.put(IDENTITY_KEY, &sealed)?;
                db.flush()?;
                Ok(())
            }
        }
    }

    pub fn load_keys(&self) -> Result<Option<IdentityKeys>> {
        match self {
            Self::Memory => Ok(None),
            Self::Persistent { db, guard } => match db.get(IDENTITY_KEY)? {
                Some(sealed) => {
                    let bytes = zeroize::Zeroizing::new(guard.open(&sealed)?);
                    Ok(Some(IdentityKeys::from_bytes(&bytes)?))
                }
                None => Ok(None),
            },
        }
    }
}
