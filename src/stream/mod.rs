//! Live camera feed supervision.

pub mod controller;
pub mod hls;
pub mod supervisor;

pub use controller::{
    ErrorKind, PlaybackPath, RestartPolicy, StreamAction, StreamEvent, StreamResilienceController,
    StreamState,
};
pub use hls::{HlsProbeFactory, ProbeSettings};
pub use supervisor::{DecoderFactory, EventSender, MediaDecoder, StreamSupervisor};
