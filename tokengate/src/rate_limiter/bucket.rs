//! Tools and data structures for a single token bucket.

use serde::{Deserialize, Serialize};
use crate::error::{Error, Result};
use super::MILLIS_PER_SEC;

/// Capacity used for buckets created without an explicit policy.
pub const DEFAULT_CAPACITY: u64 = 10;

/// Refill rate (tokens per second) used for buckets created without an explicit policy.
pub const DEFAULT_REFILL_RATE: u64 = 2;

/// How the refill timestamp advances after tokens were added.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefillMode {
    /// The timestamp jumps to `now`, dropping the sub-second remainder
    /// of the elapsed time.
    ///
    /// Over many short intervals this under-refills; kept as the default
    /// for compatibility with existing deployments.
    #[default]
    Truncate,

    /// The timestamp advances by the whole seconds that were converted
    /// into tokens, so the sub-second remainder counts towards the next refill.
    Carry,
}

/// Capacity and refill rate of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketPolicy {
    /// Maximum number of tokens in the bucket.
    pub capacity: u64,

    /// Tokens added per elapsed second.
    pub refill_rate: u64,
}

impl Default for BucketPolicy {
    #[inline]
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_rate: DEFAULT_REFILL_RATE
        }
    }
}

impl BucketPolicy {
    /// Creates a validated bucket policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if `capacity` or `refill_rate` is zero.
    pub fn new(capacity: u64, refill_rate: u64) -> Result<Self> {
        let policy = Self { capacity, refill_rate };
        policy.validate()?;
        Ok(policy)
    }

    /// Checks that both capacity and refill rate are positive.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfiguration("capacity must be positive"));
        }
        if self.refill_rate == 0 {
            return Err(Error::InvalidConfiguration("refill rate must be positive"));
        }
        Ok(())
    }
}

/// Outcome of a bucket check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request is admitted.
    pub allowed: bool,

    /// Tokens left in the bucket after this check.
    pub current_tokens: u64,

    /// Maximum number of tokens in the bucket.
    pub capacity: u64,

    /// Tokens added per elapsed second.
    pub refill_rate: u64,
}

/// Per-client token bucket state.
///
/// Invariants:
///
/// - `0 <= tokens <= capacity` after every operation.
/// - `last_refill_ms` never decreases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRecord {
    client_id: String,
    capacity: u64,
    refill_rate: u64,
    tokens: u64,
    last_refill_ms: u64,
}

impl BucketRecord {
    /// Creates a full bucket for `client_id`, last refilled at `now_ms`.
    #[inline]
    pub fn new(client_id: impl Into<String>, policy: BucketPolicy, now_ms: u64) -> Self {
        Self {
            client_id: client_id.into(),
            capacity: policy.capacity,
            refill_rate: policy.refill_rate,
            tokens: policy.capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Identifier of the client owning this bucket.
    #[inline(always)]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Bucket capacity (max tokens).
    #[inline(always)]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens added per second.
    #[inline(always)]
    pub fn refill_rate(&self) -> u64 {
        self.refill_rate
    }

    /// Tokens currently available, as of the last refill.
    #[inline(always)]
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Time of the last refill in milliseconds.
    #[inline(always)]
    pub fn last_refill_ms(&self) -> u64 {
        self.last_refill_ms
    }

    /// Adds the tokens accumulated since the last refill.
    ///
    /// Nothing happens until at least one full second has elapsed;
    /// only whole seconds are converted into tokens.
    pub fn refill(&mut self, now_ms: u64, mode: RefillMode) {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        if elapsed_ms < MILLIS_PER_SEC {
            return;
        }

        let elapsed_secs = elapsed_ms / MILLIS_PER_SEC;
        let tokens_to_add = elapsed_secs.saturating_mul(self.refill_rate);
        self.tokens = self.tokens
            .saturating_add(tokens_to_add)
            .min(self.capacity);

        self.last_refill_ms = match mode {
            RefillMode::Truncate => now_ms,
            RefillMode::Carry => self.last_refill_ms + elapsed_secs * MILLIS_PER_SEC,
        };
    }

    /// Consumes one token if available.
    ///
    /// Returns `true` if a token was consumed.
    #[inline]
    pub fn try_consume(&mut self) -> bool {
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Builds a [`Decision`] reflecting the current state.
    #[inline]
    pub fn decision(&self, allowed: bool) -> Decision {
        Decision {
            allowed,
            current_tokens: self.tokens,
            capacity: self.capacity,
            refill_rate: self.refill_rate,
        }
    }
}
