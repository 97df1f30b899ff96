//! In-memory transcript store with snapshot-replace semantics.
//!
//! Holds the last snapshot received from the broker: session status and id,
//! the ordered message log, and the final artifact once the run concludes.
//! Each poll replaces the whole state (the remote is the source of truth);
//! the store broadcasts the log length on a watch channel so the narrator
//! can react to growth without re-polling.

use std::sync::Mutex;

use serde::Deserialize;
use tokio::sync::watch;

/// Remote session lifecycle as reported by `/api/transcript`.
///
/// The broker can also report `error` when a counterparty times out mid-run;
/// any status string we don't recognize folds into `Error` so a new remote
/// state can never wedge the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Completed,
    #[serde(other)]
    Error,
}

impl SessionStatus {
    /// Terminal statuses end the polling loop until the next start.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One message in the negotiation transcript. Immutable once appended.
///
/// `transcript_response` is the broker's narratable rendition of the line,
/// distinct from the display `content`; the broker sends empty strings for
/// absent fields, so accessors map empty to `None`.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptEntry {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default, rename = "transcript_response")]
    pub spoken_text: String,
}

impl TranscriptEntry {
    pub fn rationale(&self) -> Option<&str> {
        non_empty(&self.rationale)
    }

    pub fn spoken_text(&self) -> Option<&str> {
        non_empty(&self.spoken_text)
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

/// Final negotiation result, present only once the session is terminal.
#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

/// Full `/api/transcript` response body. A snapshot, never a diff.
#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub status: SessionStatus,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
    #[serde(default)]
    pub artifact: Option<Artifact>,
}

#[derive(Default)]
struct Inner {
    status: SessionStatus,
    session_id: Option<String>,
    entries: Vec<TranscriptEntry>,
    artifact: Option<Artifact>,
}

/// Shared transcript state. Sole writer is the poller; the narrator and the
/// view read through the accessors.
pub struct TranscriptStore {
    inner: Mutex<Inner>,
    len_tx: watch::Sender<usize>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            len_tx,
        }
    }

    /// Replace the whole local state with a remote snapshot.
    ///
    /// Replaying an unchanged snapshot is a no-op observable only as a
    /// redundant length notification, which the narrator's watermark absorbs.
    pub fn apply_snapshot(&self, snapshot: Snapshot) {
        let len = snapshot.transcript.len();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.status = snapshot.status;
            inner.session_id = snapshot.session_id;
            inner.entries = snapshot.transcript;
            inner.artifact = snapshot.artifact;
        }
        self.len_tx.send_replace(len);
    }

    /// Drop all session state, keeping only the given status.
    pub fn clear(&self, status: SessionStatus) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.status = status;
            inner.session_id = None;
            inner.entries.clear();
            inner.artifact = None;
        }
        self.len_tx.send_replace(0);
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().unwrap().status
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().unwrap().session_id.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry(&self, index: usize) -> Option<TranscriptEntry> {
        self.inner.lock().unwrap().entries.get(index).cloned()
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.inner.lock().unwrap().entries.clone()
    }

    pub fn artifact(&self) -> Option<Artifact> {
        self.inner.lock().unwrap().artifact.clone()
    }

    /// Subscribe to log length changes. The narrator selects on this.
    pub fn len_rx(&self) -> watch::Receiver<usize> {
        self.len_tx.subscribe()
    }
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}
