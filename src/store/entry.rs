//! Cache Entry Module
//!
//! Defines the structure for individual store entries with TTL support.

// == Cache Entry ==
/// Represents a single stored value with expiry metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The stored value
    pub value: String,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Expiration timestamp (Unix milliseconds), None = no expiration
    pub expires_at: Option<u64>,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new entry written at `now`.
    ///
    /// # Arguments
    /// * `value` - The value to store
    /// * `ttl_ms` - Optional TTL in milliseconds
    /// * `now` - Current Unix time in milliseconds
    pub fn new(value: String, ttl_ms: Option<u64>, now: u64) -> Self {
        Self {
            value,
            created_at: now,
            expires_at: ttl_ms.map(|ttl| now.saturating_add(ttl)),
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired at `now`.
    ///
    /// An entry is expired once `now >= expires_at`, so a read issued exactly
    /// when the TTL elapses is already a miss.
    pub fn is_expired_at(&self, now: u64) -> bool {
        match self.expires_at {
            Some(expires) => now >= expires,
            None => false,
        }
    }
}
