//! Kaiku Call Core
//!
//! Per-peer audio call control over a peer-to-peer protocol engine, and the
//! audio device layer that lets any number of calls share one microphone
//! and one speaker.

pub mod audio;
pub mod call;
pub mod config;
pub mod events;

pub use audio::{
    AudioBackend, AudioSystem, DeviceError, DeviceHandle, DeviceInfo, DeviceKind, FrameFormat,
    VirtualDeviceTable,
};
pub use call::{CallEngine, CallError, CallManager, CallStateFlags, CallStatus, PeerSlot};
pub use config::AudioSettings;
pub use events::{CallEvent, EventSender};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` overrides the default `vc_call=debug` filter. Calling this
/// again after a subscriber is installed does nothing.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vc_call=debug".into()),
        )
        .try_init();
}
