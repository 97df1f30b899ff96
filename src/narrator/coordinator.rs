//! Speech playback coordination.
//!
//! Strictly serial utterance lifecycle: idle → speaking → (ended | errored)
//! → idle. One select loop consumes transcript growth, device lifecycle
//! events, and user commands; the shared audio device is never given two
//! utterances at once — new speech always preempts old.
//!
//! Auto-narration policy: per growth batch, only the most recent entry
//! carrying spoken text is narrated; the watermark then advances over the
//! whole batch so it is never reconsidered. Entries that arrive before the
//! voice catalog is ready are skipped the same way and are not narrated
//! retroactively.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::narrator::device::{
    SpeechDevice, SpeechEvent, SpeechEventKind, SpeechEventReceiver, SpeechJob,
};
use crate::narrator::voices::VoiceAssignment;
use crate::store::TranscriptStore;

/// User intents relayed from the view.
#[derive(Debug)]
pub enum NarratorCommand {
    /// Speak an arbitrary past entry, bypassing the watermark.
    Replay {
        text: String,
        role: String,
        entry_index: usize,
    },
    /// Stop any active or pending utterance (start/reset paths).
    CancelAll,
}

/// Cheap cloneable handle to a running coordinator.
#[derive(Clone)]
pub struct NarratorHandle {
    cmd_tx: mpsc::Sender<NarratorCommand>,
    playback_rx: watch::Receiver<Option<usize>>,
}

impl NarratorHandle {
    pub async fn replay(&self, text: String, role: String, entry_index: usize) {
        let _ = self
            .cmd_tx
            .send(NarratorCommand::Replay {
                text,
                role,
                entry_index,
            })
            .await;
    }

    pub async fn cancel_all(&self) {
        let _ = self.cmd_tx.send(NarratorCommand::CancelAll).await;
    }

    /// Index of the entry currently being narrated, for UI highlighting.
    pub fn speaking_index(&self) -> Option<usize> {
        *self.playback_rx.borrow()
    }

    /// Subscribe to highlighting changes.
    pub fn playback_rx(&self) -> watch::Receiver<Option<usize>> {
        self.playback_rx.clone()
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveJob {
    id: u64,
    entry_index: usize,
}

pub struct SpeechCoordinator {
    store: Arc<TranscriptStore>,
    device: Arc<dyn SpeechDevice>,
    assignment: VoiceAssignment,
    preempt_delay: Duration,
    event_rx: SpeechEventReceiver,
    cmd_rx: mpsc::Receiver<NarratorCommand>,
    playback_tx: watch::Sender<Option<usize>>,
    /// Subscribed at construction so growth between wiring and the loop's
    /// first poll is never absorbed unseen.
    len_rx: watch::Receiver<usize>,
    /// Log length already considered for auto-narration.
    watermark: usize,
    active: Option<ActiveJob>,
    next_job_id: u64,
}

impl SpeechCoordinator {
    pub fn new(
        store: Arc<TranscriptStore>,
        device: Arc<dyn SpeechDevice>,
        assignment: VoiceAssignment,
        preempt_delay: Duration,
        event_rx: SpeechEventReceiver,
    ) -> (Self, NarratorHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (playback_tx, playback_rx) = watch::channel(None);
        let len_rx = store.len_rx();
        let watermark = *len_rx.borrow();

        let coordinator = Self {
            store,
            device,
            assignment,
            preempt_delay,
            event_rx,
            cmd_rx,
            playback_tx,
            len_rx,
            watermark,
            active: None,
            next_job_id: 0,
        };
        let handle = NarratorHandle {
            cmd_tx,
            playback_rx,
        };
        (coordinator, handle)
    }

    /// Run until every command sender is dropped.
    pub async fn run(mut self) {
        let mut len_rx = self.len_rx.clone();

        // The log may already have grown past the construction-time
        // watermark by the time this task first executes.
        let len = *len_rx.borrow_and_update();
        self.on_log_len(len).await;

        loop {
            tokio::select! {
                changed = len_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let len = *len_rx.borrow_and_update();
                    self.on_log_len(len).await;
                }
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.on_device_event(event),
                        None => break,
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(NarratorCommand::Replay { text, role, entry_index }) => {
                            info!("Replaying entry {entry_index}");
                            self.speak(text, role, entry_index).await;
                        }
                        Some(NarratorCommand::CancelAll) => self.cancel_all(),
                        None => break,
                    }
                }
            }
        }
        debug!("Coordinator loop ended");
    }

    async fn on_log_len(&mut self, len: usize) {
        if len < self.watermark {
            // Reset or new session: rewind, never re-narrate.
            self.watermark = len;
            return;
        }
        if len == self.watermark {
            return;
        }

        // Only the latest spoken-text entry per batch is narrated; earlier
        // ones in the same batch stay silent so a burst of updates never
        // queues stale narration.
        let newest = (self.watermark..len).rev().find_map(|index| {
            let entry = self.store.entry(index)?;
            let text = entry.spoken_text()?.to_string();
            Some((index, text, entry.role))
        });

        let from = self.watermark;
        self.watermark = len;

        if !self.device.voices_ready() {
            debug!("Voice catalog not ready, skipping narration of entries {from}..{len}");
            return;
        }

        if let Some((index, text, role)) = newest {
            self.speak(text, role, index).await;
        }
    }

    /// Serial speak primitive shared by auto-narration and replay.
    async fn speak(&mut self, text: String, role: String, entry_index: usize) {
        if self.active.is_some() {
            // Preempt, then give the device a beat so the cancelled job's
            // completion cannot land after the new job has started.
            self.device.cancel();
            tokio::time::sleep(self.preempt_delay).await;
        }

        self.next_job_id += 1;
        let id = self.next_job_id;
        let voice = self.assignment.resolve(&role, &self.device.voices());

        debug!("Speaking entry {entry_index} as job {id} (role {role}, voice {:?})",
            voice.as_ref().map(|v| v.name.as_str()));

        self.active = Some(ActiveJob { id, entry_index });
        self.device.speak(
            SpeechJob {
                id,
                text,
                role,
                entry_index,
            },
            voice,
        );
    }

    fn on_device_event(&mut self, event: SpeechEvent) {
        let Some(active) = self.active else {
            debug!("Ignoring speech event for job {} (no active job)", event.job_id);
            return;
        };
        if event.job_id != active.id {
            debug!("Ignoring stale speech event for job {}", event.job_id);
            return;
        }

        match event.kind {
            SpeechEventKind::Started => {
                self.playback_tx.send_replace(Some(active.entry_index));
            }
            SpeechEventKind::Ended => {
                self.active = None;
                self.playback_tx.send_replace(None);
            }
            SpeechEventKind::Errored => {
                warn!("Utterance for entry {} failed", active.entry_index);
                self.active = None;
                self.playback_tx.send_replace(None);
            }
        }
    }

    fn cancel_all(&mut self) {
        self.device.cancel();
        self.active = None;
        self.playback_tx.send_replace(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::narrator::device::{event_channel, SpeechEventSender, VoiceInfo};
    use crate::store::{SessionStatus, Snapshot, TranscriptEntry};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records speak/cancel calls; tests drive lifecycle events manually
    /// through a kept sender clone.
    struct FakeDevice {
        voices: Vec<VoiceInfo>,
        ready: AtomicBool,
        spoken: Mutex<Vec<SpeechJob>>,
        chosen: Mutex<Vec<Option<String>>>,
        cancels: AtomicUsize,
    }

    impl FakeDevice {
        fn new(ready: bool) -> Self {
            Self {
                voices: ["alloy", "echo", "onyx", "shimmer"]
                    .iter()
                    .map(|n| VoiceInfo::new(*n))
                    .collect(),
                ready: AtomicBool::new(ready),
                spoken: Mutex::new(Vec::new()),
                chosen: Mutex::new(Vec::new()),
                cancels: AtomicUsize::new(0),
            }
        }

        fn spoken_indices(&self) -> Vec<usize> {
            self.spoken.lock().unwrap().iter().map(|j| j.entry_index).collect()
        }

        fn last_job_id(&self) -> u64 {
            self.spoken.lock().unwrap().last().unwrap().id
        }
    }

    impl SpeechDevice for FakeDevice {
        fn voices(&self) -> Vec<VoiceInfo> {
            self.voices.clone()
        }

        fn voices_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn speak(&self, job: SpeechJob, voice: Option<VoiceInfo>) {
            self.spoken.lock().unwrap().push(job);
            self.chosen.lock().unwrap().push(voice.map(|v| v.name));
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Rig {
        store: Arc<TranscriptStore>,
        device: Arc<FakeDevice>,
        handle: NarratorHandle,
        events: SpeechEventSender,
    }

    fn rig(ready: bool) -> Rig {
        let store = Arc::new(TranscriptStore::new());
        let device = Arc::new(FakeDevice::new(ready));
        let (events, event_rx) = event_channel();
        let (coordinator, handle) = SpeechCoordinator::new(
            store.clone(),
            device.clone(),
            VoiceAssignment::new(Config::default().voices),
            Duration::from_millis(50),
            event_rx,
        );
        tokio::spawn(coordinator.run());
        Rig {
            store,
            device,
            handle,
            events,
        }
    }

    fn entry(role: &str, content: &str, spoken: &str) -> TranscriptEntry {
        TranscriptEntry {
            role: role.into(),
            content: content.into(),
            rationale: String::new(),
            spoken_text: spoken.into(),
        }
    }

    fn snapshot(entries: Vec<TranscriptEntry>) -> Snapshot {
        Snapshot {
            status: SessionStatus::Running,
            session_id: Some("session-1".into()),
            transcript: entries,
            artifact: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn narrates_only_latest_spoken_entry_per_batch() {
        let rig = rig(true);
        rig.store.apply_snapshot(snapshot(vec![
            entry("MayLim", "a", ""),
            entry("Kumar", "b", ""),
            entry("broker", "c", ""),
            entry("MayLim", "d", "counter at 1800"),
            entry("Kumar", "e", "can do 1820 la"),
        ]));
        settle().await;

        assert_eq!(rig.device.spoken_indices(), vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn growth_before_loop_startup_is_narrated() {
        let store = Arc::new(TranscriptStore::new());
        let device = Arc::new(FakeDevice::new(true));
        let (_events, event_rx) = event_channel();
        let (coordinator, _handle) = SpeechCoordinator::new(
            store.clone(),
            device.clone(),
            VoiceAssignment::new(Config::default().voices),
            Duration::from_millis(50),
            event_rx,
        );

        // Snapshot lands after wiring but before the loop task ever runs.
        store.apply_snapshot(snapshot(vec![entry("broker", "a", "offer A")]));
        tokio::spawn(coordinator.run());
        settle().await;

        assert_eq!(device.spoken_indices(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_length_is_never_renarrated() {
        let rig = rig(true);
        let snap = snapshot(vec![entry("broker", "a", "offer A")]);
        rig.store.apply_snapshot(snap.clone());
        settle().await;
        rig.store.apply_snapshot(snap);
        settle().await;

        assert_eq!(rig.device.spoken_indices(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_without_spoken_text_advances_watermark_silently() {
        let rig = rig(true);
        rig.store
            .apply_snapshot(snapshot(vec![entry("broker", "a", "")]));
        settle().await;
        assert!(rig.device.spoken_indices().is_empty());

        rig.store.apply_snapshot(snapshot(vec![
            entry("broker", "a", ""),
            entry("Kumar", "b", "quote 1900"),
        ]));
        settle().await;
        assert_eq!(rig.device.spoken_indices(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn voices_not_ready_suppresses_but_advances_watermark() {
        let rig = rig(false);
        rig.store
            .apply_snapshot(snapshot(vec![entry("broker", "a", "offer A")]));
        settle().await;
        assert!(rig.device.spoken_indices().is_empty());

        // Catalog becomes ready; the suppressed entry is not delivered
        // retroactively, only genuinely new growth speaks.
        rig.device.ready.store(true, Ordering::SeqCst);
        rig.store.apply_snapshot(snapshot(vec![
            entry("broker", "a", "offer A"),
            entry("Kumar", "b", "counter"),
        ]));
        settle().await;
        assert_eq!(rig.device.spoken_indices(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn new_speech_preempts_active_job() {
        let rig = rig(true);
        rig.store
            .apply_snapshot(snapshot(vec![entry("broker", "a", "offer A")]));
        settle().await;
        let first_job = rig.device.last_job_id();
        rig.events
            .send(SpeechEvent {
                job_id: first_job,
                kind: SpeechEventKind::Started,
            })
            .unwrap();
        settle().await;
        assert_eq!(rig.handle.speaking_index(), Some(0));

        rig.store.apply_snapshot(snapshot(vec![
            entry("broker", "a", "offer A"),
            entry("Kumar", "b", "counter"),
        ]));
        settle().await;

        assert_eq!(rig.device.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(rig.device.spoken_indices(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_completion_does_not_clear_newer_speaking_index() {
        let rig = rig(true);
        rig.store
            .apply_snapshot(snapshot(vec![entry("broker", "a", "offer A")]));
        settle().await;
        let first_job = rig.device.last_job_id();

        rig.store.apply_snapshot(snapshot(vec![
            entry("broker", "a", "offer A"),
            entry("Kumar", "b", "counter"),
        ]));
        settle().await;
        let second_job = rig.device.last_job_id();
        assert_ne!(first_job, second_job);

        rig.events
            .send(SpeechEvent {
                job_id: second_job,
                kind: SpeechEventKind::Started,
            })
            .unwrap();
        settle().await;
        assert_eq!(rig.handle.speaking_index(), Some(1));

        // The cancelled job's completion arrives late and must be ignored.
        rig.events
            .send(SpeechEvent {
                job_id: first_job,
                kind: SpeechEventKind::Ended,
            })
            .unwrap();
        settle().await;
        assert_eq!(rig.handle.speaking_index(), Some(1));

        rig.events
            .send(SpeechEvent {
                job_id: second_job,
                kind: SpeechEventKind::Ended,
            })
            .unwrap();
        settle().await;
        assert_eq!(rig.handle.speaking_index(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_bypasses_watermark() {
        let rig = rig(true);
        rig.store.apply_snapshot(snapshot(vec![
            entry("broker", "a", "offer A"),
            entry("Kumar", "b", "counter"),
        ]));
        settle().await;
        assert_eq!(rig.device.spoken_indices(), vec![1]);

        rig.handle
            .replay("offer A".into(), "broker".into(), 0)
            .await;
        settle().await;
        assert_eq!(rig.device.spoken_indices(), vec![1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_resolves_role_voice() {
        let rig = rig(true);
        rig.handle
            .replay("hello boss".into(), "MayLim".into(), 3)
            .await;
        settle().await;

        let chosen = rig.device.chosen.lock().unwrap().clone();
        assert_eq!(chosen, vec![Some("shimmer".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_clears_active_job_and_highlight() {
        let rig = rig(true);
        rig.store
            .apply_snapshot(snapshot(vec![entry("broker", "a", "offer A")]));
        settle().await;
        let job = rig.device.last_job_id();
        rig.events
            .send(SpeechEvent {
                job_id: job,
                kind: SpeechEventKind::Started,
            })
            .unwrap();
        settle().await;
        assert_eq!(rig.handle.speaking_index(), Some(0));

        rig.handle.cancel_all().await;
        settle().await;

        assert_eq!(rig.device.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(rig.handle.speaking_index(), None);

        // A late Ended from the cancelled job is ignored.
        rig.events
            .send(SpeechEvent {
                job_id: job,
                kind: SpeechEventKind::Ended,
            })
            .unwrap();
        settle().await;
        assert_eq!(rig.handle.speaking_index(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn log_shrink_rewinds_watermark() {
        let rig = rig(true);
        rig.store.apply_snapshot(snapshot(vec![
            entry("broker", "a", "offer A"),
            entry("Kumar", "b", "counter"),
        ]));
        settle().await;

        rig.store.clear(SessionStatus::Idle);
        settle().await;

        // A fresh session reusing low indices narrates again from scratch.
        rig.store
            .apply_snapshot(snapshot(vec![entry("MayLim", "x", "new session line")]));
        settle().await;
        assert_eq!(rig.device.spoken_indices(), vec![1, 0]);
    }
}
