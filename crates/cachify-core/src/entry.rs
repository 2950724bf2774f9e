//! Entry metadata and state derivation.
//!
//! Every payload has a sibling metadata record carrying three UTC instants
//! with the invariant `created_at <= logical_expiration <= fail_safe_until`.
//! The entry's state at a given time follows from those instants alone:
//! fresh until the logical expiration, then stale while the fail-safe window
//! is open, then a miss.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Metadata stored under `<key>:meta` alongside every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub logical_expiration: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub fail_safe_until: OffsetDateTime,
}

impl EntryMetadata {
    /// Build metadata for an entry created at `now` with the given logical
    /// TTL and fail-safe extension.
    pub fn new(now: OffsetDateTime, ttl: Duration, fail_safe_max_duration: Duration) -> Self {
        let logical_expiration = now + ttl;
        Self {
            created_at: now,
            logical_expiration,
            fail_safe_until: logical_expiration + fail_safe_max_duration,
        }
    }

    /// Derive the entry state at `now`, assuming the payload is present.
    pub fn state_at(&self, now: OffsetDateTime) -> EntryState {
        if now <= self.logical_expiration {
            EntryState::Fresh
        } else if now <= self.fail_safe_until {
            EntryState::Stale
        } else {
            EntryState::Miss
        }
    }

    /// Time left in the fail-safe window, or `None` when it has closed.
    ///
    /// Used as the L1 TTL when refilling from an L2 hit.
    pub fn remaining_fail_safe(&self, now: OffsetDateTime) -> Option<Duration> {
        let remaining = self.fail_safe_until - now;
        if remaining.is_positive() {
            // whole_milliseconds of a positive time::Duration fits u64
            Some(Duration::from_millis(remaining.whole_milliseconds() as u64))
        } else {
            None
        }
    }
}

/// Observable state of a cache entry at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Fresh,
    Stale,
    Miss,
}

impl EntryState {
    /// Derive the state from an optional payload and optional metadata.
    ///
    /// A payload without metadata is treated as fresh so entries written by
    /// callers that predate the metadata convention keep working.
    pub fn derive(
        payload_present: bool,
        metadata: Option<&EntryMetadata>,
        now: OffsetDateTime,
    ) -> Self {
        match (payload_present, metadata) {
            (false, _) => EntryState::Miss,
            (true, None) => EntryState::Fresh,
            (true, Some(meta)) => meta.state_at(now),
        }
    }
}

/// Why a stale value was served instead of a fresh one.
///
/// Never surfaced as an error; appears only in telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    Expired,
    L2Failure,
    FactoryFailure,
    SoftTimeout,
    HardTimeout,
}

impl StaleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "Expired",
            Self::L2Failure => "L2Failure",
            Self::FactoryFailure => "FactoryFailure",
            Self::SoftTimeout => "SoftTimeout",
            Self::HardTimeout => "HardTimeout",
        }
    }
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
