//! Tether Net Sim
//!
//! In-memory `OverlayTransport` implementation for tests: a shared
//! broker routes messages between `SimTransport` instances, with
//! injectable faults (refused bootstraps, dropped or nacked sends,
//! stalled streams, delayed requests) so the retry and teardown paths
//! of the messaging layer are exercisable without a real network.

mod sim_transport;

pub use sim_transport::{Faults, SimClient, SimNetwork, SimTransport};
