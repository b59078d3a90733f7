//! Registry & mesh bootstrap (component C).
//!
//! The registry itself is a small standalone broker (see [`server`]) run by
//! the `fabric-registry` binary; every participant also carries a client
//! half ([`client`]) that dials it, learns the current membership, and
//! opens a direct connection to each existing peer.

pub mod client;
pub mod server;
