//! Actor key pair caching
//!
//! Parsed RSA keys of local actors, loaded from the actor's parameter bag
//! or generated on first use.

use std::collections::HashMap;
use std::sync::Arc;

use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tokio::sync::RwLock;

use crate::data::{Actor, Database, StoredKeyPair};
use crate::error::AppError;
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

/// Parsed key material of one local actor
pub struct ActorKeys {
    pub signing_key: SigningKey<Sha256>,
    pub public_key_pem: String,
}

impl ActorKeys {
    fn from_stored(stored: &StoredKeyPair) -> Result<Self, AppError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(&stored.private_key_pem)
            .map_err(|e| AppError::Crypto(format!("Invalid private key: {}", e)))?;

        Ok(Self {
            signing_key: SigningKey::<Sha256>::new(private_key),
            public_key_pem: stored.public_key_pem.clone(),
        })
    }
}

/// Generate and PEM-encode a fresh key pair
pub fn generate_keypair(bits: usize) -> Result<StoredKeyPair, AppError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| AppError::Crypto(format!("Key generation failed: {}", e)))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Crypto(e.to_string()))?
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Crypto(e.to_string()))?;

    Ok(StoredKeyPair {
        private_key_pem,
        public_key_pem,
    })
}

/// Key pair cache
///
/// Keys are immutable once stored, so entries never expire; `invalidate`
/// exists for explicit rotation.
pub struct KeyPairCache {
    entries: RwLock<HashMap<i64, Arc<ActorKeys>>>,
    key_bits: usize,
}

impl KeyPairCache {
    pub fn new(key_bits: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            key_bits,
        }
    }

    /// Get the keys of an actor, generating and persisting them on first use
    pub async fn keys_for(&self, db: &Database, actor: &Actor) -> Result<Arc<ActorKeys>, AppError> {
        {
            let entries = self.entries.read().await;
            if let Some(keys) = entries.get(&actor.id) {
                CACHE_HITS_TOTAL.with_label_values(&["keypair"]).inc();
                return Ok(keys.clone());
            }
        }
        CACHE_MISSES_TOTAL.with_label_values(&["keypair"]).inc();

        let stored = match &actor.params.keypair {
            Some(stored) => stored.clone(),
            None => self.create_keypair(db, actor.id).await?,
        };

        let keys = Arc::new(ActorKeys::from_stored(&stored)?);
        let mut entries = self.entries.write().await;
        Ok(entries.entry(actor.id).or_insert(keys).clone())
    }

    async fn create_keypair(&self, db: &Database, actor_id: i64) -> Result<StoredKeyPair, AppError> {
        let bits = self.key_bits;
        let generated = tokio::task::spawn_blocking(move || generate_keypair(bits))
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("key generation task failed: {e}")))??;

        if db.set_actor_keypair_if_absent(actor_id, &generated).await? {
            tracing::info!(actor_id, bits, "Generated actor key pair");
            return Ok(generated);
        }

        // Someone else stored a key pair first; theirs wins.
        let actor = db.get_actor(actor_id).await?.ok_or(AppError::NotFound)?;
        actor
            .params
            .keypair
            .ok_or_else(|| AppError::Crypto(format!("Actor {actor_id} has no key pair")))
    }

    /// Drop the cached keys of an actor
    pub async fn invalidate(&self, actor_id: i64) {
        let mut entries = self.entries.write().await;
        entries.remove(&actor_id);
        tracing::debug!(actor_id, "Invalidated key pair cache entry");
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
