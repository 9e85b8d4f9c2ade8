use std::sync::Arc;

use crate::core::error::Error;

/// bcrypt hashing with a fixed work factor. Hashing and verification are CPU
/// bound, so the async variants move the work onto the blocking pool.
#[derive(Clone, Debug)]
pub(crate) struct PasswordHasher {
    cost: u32,
    // Verified against when a username is unknown, so that path costs the
    // same as a real mismatch.
    decoy: Arc<str>,
}

impl PasswordHasher {
    /// Hashes the decoy eagerly; fails when `cost` is outside bcrypt's range.
    pub(crate) fn new(cost: u32) -> Result<Self, Error> {
        let decoy = bcrypt::hash("tablegate-decoy", cost)?;

        Ok(Self {
            cost,
            decoy: decoy.into(),
        })
    }

    pub(crate) fn hash(&self, plaintext: &str) -> Result<String, Error> {
        Ok(bcrypt::hash(plaintext, self.cost)?)
    }

    /// `Ok(false)` on mismatch; `MalformedHash` only when `hash` cannot be parsed.
    pub(crate) fn verify(&self, plaintext: &str, hash: &str) -> Result<bool, Error> {
        Ok(bcrypt::verify(plaintext, hash)?)
    }

    pub(crate) async fn hash_async(&self, plaintext: String) -> Result<String, Error> {
        let hasher = self.clone();

        tokio::task::spawn_blocking(move || hasher.hash(&plaintext))
            .await
            .map_err(|_| Error::Internal)?
    }

    pub(crate) async fn verify_async(&self, plaintext: String, hash: String) -> Result<bool, Error> {
        let hasher = self.clone();

        tokio::task::spawn_blocking(move || hasher.verify(&plaintext, &hash))
            .await
            .map_err(|_| Error::Internal)?
    }

    /// Burns one verification against a throwaway hash.
    pub(crate) async fn verify_decoy(&self, plaintext: String) -> Result<(), Error> {
        let hasher = self.clone();

        tokio::task::spawn_blocking(move || hasher.verify(&plaintext, &hasher.decoy).map(|_| ()))
            .await
            .map_err(|_| Error::Internal)?
    }
}
