//! Multi-channel transfer sessions.
//!
//! A [`TransferCoordinator`] owns one session end to end:
//!
//! 1. **Open**: connect each channel (a channel that fails to open is
//!    skipped, the session goes on with the rest)
//! 2. **Prepare**: chunk and checksum the byte source
//! 3. **Start**: announce the transfer on every channel, distribute the
//!    chunks across the usable ones and start one sender per channel
//! 4. **Wait**: until every chunk is Completed or Failed, rebalancing
//!    pending chunks toward the faster channel in the background
//! 5. **Close**: cancel the senders, wait for them and release the
//!    connections

pub mod config;
pub mod coordinator;
pub mod error;
pub mod liveness;

pub use config::EngineConfig;
pub use coordinator::TransferCoordinator;
pub use error::CoordinatorError;
pub use liveness::{ChannelRegistry, LivenessProvider, MeasuredLiveness, StaticLiveness};
