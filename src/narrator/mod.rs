//! Speech narration for transcript entries.
//!
//! Components:
//! - `device`: the injected `SpeechDevice` capability and job-tagged events
//! - `voices`: role-to-voice resolution against the device catalog
//! - `synth`: the real device (OpenAI-compatible TTS + rodio playback)
//! - `coordinator`: the serial playback state machine and watermark policy

pub mod coordinator;
pub mod device;
pub mod synth;
pub mod voices;

pub use coordinator::{NarratorCommand, NarratorHandle, SpeechCoordinator};
pub use device::{
    event_channel, NullDevice, SpeechDevice, SpeechEvent, SpeechEventKind, SpeechEventReceiver,
    SpeechEventSender, SpeechJob, VoiceInfo,
};
pub use synth::SynthDevice;
pub use voices::VoiceAssignment;
