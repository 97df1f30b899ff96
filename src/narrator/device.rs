//! Speech device capability seam.
//!
//! The coordinator never talks to a concrete synthesizer; it holds an
//! `Arc<dyn SpeechDevice>` and receives job-tagged lifecycle events over a
//! channel. That keeps the real network/audio device swappable for fakes in
//! tests, and makes stale-callback filtering a plain job-id comparison.

use tokio::sync::mpsc;

/// One synthesis voice as enumerated by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceInfo {
    pub name: String,
}

impl VoiceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// One utterance. Ephemeral: created per speak call, identified by `id`
/// so late completions from a preempted job can be ignored.
#[derive(Debug, Clone)]
pub struct SpeechJob {
    pub id: u64,
    pub text: String,
    pub role: String,
    pub entry_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEventKind {
    /// Playback began.
    Started,
    /// Playback finished or was cancelled.
    Ended,
    /// Synthesis or playback failed; treated like Ended by the coordinator.
    Errored,
}

/// Lifecycle notification for one job, delivered on the coordinator's event
/// channel.
#[derive(Debug, Clone, Copy)]
pub struct SpeechEvent {
    pub job_id: u64,
    pub kind: SpeechEventKind,
}

pub type SpeechEventSender = mpsc::UnboundedSender<SpeechEvent>;
pub type SpeechEventReceiver = mpsc::UnboundedReceiver<SpeechEvent>;

pub fn event_channel() -> (SpeechEventSender, SpeechEventReceiver) {
    mpsc::unbounded_channel()
}

/// Injected synthesis capability. Voice enumeration may complete after
/// construction; callers gate narration on `voices_ready`.
pub trait SpeechDevice: Send + Sync {
    /// Enumerated voices. Empty until the catalog loads, or permanently
    /// empty on a silent device.
    fn voices(&self) -> Vec<VoiceInfo>;

    /// True once enumeration has completed at least once.
    fn voices_ready(&self) -> bool;

    /// Begin speaking. Non-blocking; outcome arrives as `SpeechEvent`s.
    /// A `None` voice means the device's default.
    fn speak(&self, job: SpeechJob, voice: Option<VoiceInfo>);

    /// Stop current and pending playback.
    fn cancel(&self);
}

/// Device used when synthesis is disabled or unavailable. Never becomes
/// ready, so auto-narration is suppressed at the gate; an explicit replay
/// completes immediately without error noise.
pub struct NullDevice {
    events: SpeechEventSender,
}

impl NullDevice {
    pub fn new(events: SpeechEventSender) -> Self {
        Self { events }
    }
}

impl SpeechDevice for NullDevice {
    fn voices(&self) -> Vec<VoiceInfo> {
        Vec::new()
    }

    fn voices_ready(&self) -> bool {
        false
    }

    fn speak(&self, job: SpeechJob, _voice: Option<VoiceInfo>) {
        let _ = self.events.send(SpeechEvent {
            job_id: job.id,
            kind: SpeechEventKind::Ended,
        });
    }

    fn cancel(&self) {}
}
