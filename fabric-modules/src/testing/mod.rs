//! Test-only helpers shared across the crate's integration tests.

use std::sync::atomic::{AtomicU16, Ordering};

static NEXT_PORT: AtomicU16 = AtomicU16::new(19100);

/// Hands out a fresh loopback port for each test that needs a real listener,
/// so parallel `#[tokio::test]`s don't collide on a hardcoded one.
pub fn next_test_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::Relaxed)
}
