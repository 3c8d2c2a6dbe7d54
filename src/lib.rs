//! Ad and sponsor-segment skipping engine for remote playback devices
//! speaking the YouTube lounge protocol.
//!
//! The crate is transport-agnostic: callers supply implementations of the
//! [`transport::TransportSession`] and provider traits, and the engine runs
//! the per-device session loops, resolves skippable segments and issues the
//! seeks. See [`supervisor::DeviceSupervisor`] for the top-level entry
//! point.

pub mod cache;
pub mod config;
pub mod lounge;
pub mod providers;
pub mod scheduler;
pub mod segments;
pub mod snapshot;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use config::{Config, DeviceConfig};
pub use lounge::{Controller, LoungeSession, SessionError};
pub use scheduler::{SkipScheduler, SkipState};
pub use segments::{Segment, SegmentResolver, SegmentSet};
pub use snapshot::{PlaybackSnapshot, PlaybackState};
pub use supervisor::DeviceSupervisor;
pub use transport::{LoungeEvent, OutgoingCommand, TransportError, TransportSession};
