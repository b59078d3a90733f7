//! Participant and endpoint identifiers.
//!
//! A `ParticipantId` is a 64-bit shortcut for a participant name: it is
//! derived deterministically (same name, same id, everywhere) so peers can
//! key their connection tables on a fixed-size value instead of a string,
//! while the name stays the authoritative identity on the wire.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::nodeids::U256;

/// 64-bit identifier derived from a participant's name via a stable hash.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ParticipantId(u64);

impl ParticipantId {
    /// Derives the id from a participant name. Two calls with the same name
    /// always produce the same id.
    pub fn from_name(name: &str) -> Self {
        let hash = U256::hash_domain_parts("fabric-participant", &[name.as_bytes()]);
        let bytes = hash.to_bytes();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        Self(u64::from_be_bytes(buf))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParticipantId({:016x})", self.0)
    }
}

/// Process-local, monotonically increasing id assigned to a controller at
/// creation. Never reused within a participant's lifetime.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct EndpointId(u64);

impl EndpointId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out strictly increasing `EndpointId`s for one participant process.
#[derive(Debug, Default)]
pub struct EndpointIdGenerator {
    next: AtomicU64,
}

impl EndpointIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> EndpointId {
        EndpointId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_across_calls() {
        assert_eq!(
            ParticipantId::from_name("alice"),
            ParticipantId::from_name("alice")
        );
        assert_ne!(
            ParticipantId::from_name("alice"),
            ParticipantId::from_name("bob")
        );
    }

    #[test]
    fn endpoint_ids_increase() {
        let gen = EndpointIdGenerator::new();
        let a = gen.next_id();
        let b = gen.next_id();
        assert!(b.as_u64() > a.as_u64());
    }
}
