//! On-demand relay of camera feeds to many HTTP viewers.
//!
//! Each source gets at most one transcoder subprocess, shared by every viewer
//! of that source and torn down a short grace period after the last one
//! leaves.

pub mod adapter;
pub mod broadcaster;
pub mod codec;
pub mod directory;
pub mod error;
pub mod frame;
pub mod process;
pub mod registry;
pub mod session;
pub mod sink;

#[cfg(test)]
mod testing;

pub use directory::{SourceDirectory, SourceEndpoint, SourceEntry, StaticDirectory};
pub use error::RelayError;
pub use frame::{Frame, SourceId};
pub use process::{CommandLauncher, Launcher};
pub use registry::{RelayOptions, SourceRegistry};
pub use session::{RelayLease, RelaySession, SessionSnapshot, SessionState};
pub use sink::HttpSink;
