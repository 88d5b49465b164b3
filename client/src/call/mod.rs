//! Call Control
//!
//! Per-peer call records, their state machine, and the manager that ties
//! engine callbacks and user commands to the audio device table.

mod engine;
mod manager;
mod registry;
mod state;

pub use engine::{CallEngine, CallStateFlags, EngineError};
pub use manager::{CallError, CallInfo, CallManager};
pub use registry::{CallRegistry, MAX_PEERS};
pub use state::{Call, CallStateError, CallStatus, Direction, OfferedMedia, Transition};

/// Peer index assigned by the protocol engine
pub type PeerSlot = usize;
