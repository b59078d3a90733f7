pub mod codec;
pub mod controller;
pub mod discovery;
pub mod lifecycle;
pub mod model;
pub mod monitor;
pub mod participant;
pub mod participant_config;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod timesync;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
