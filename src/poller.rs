//! Session lifecycle and polling against the remote broker.
//!
//! Owns the single recurring poll task. Every fetch is tagged with a session
//! generation (invalidated by start/reset) and a monotonically increasing
//! poll sequence number, so a fetch that resolves after a reset, or out of
//! dispatch order, is discarded instead of resurrecting stale state.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{SessionStatus, Snapshot, TranscriptStore};

/// Transport to the remote negotiation engine. The HTTP implementation lives
/// in `remote`; tests inject fakes. Isolating the fetch contract here means a
/// push-based transport could replace polling without touching the store or
/// the narrator.
pub trait SessionTransport: Send + Sync + 'static {
    fn start_session(&self) -> impl Future<Output = Result<(), String>> + Send;
    fn reset_session(&self) -> impl Future<Output = Result<(), String>> + Send;
    fn fetch_snapshot(&self) -> impl Future<Output = Result<Snapshot, String>> + Send;
}

struct Shared<T> {
    transport: T,
    store: Arc<TranscriptStore>,
    /// Bumped by start() and reset(); in-flight fetches from an older
    /// generation are discarded on arrival.
    generation: AtomicU64,
    /// Dispatch counter for fetches.
    poll_seq: AtomicU64,
    /// Highest sequence number whose snapshot was applied.
    applied_seq: AtomicU64,
    /// Set by start() until the broker's view of the new session is
    /// observed; leftover pre-start snapshots are discarded meanwhile.
    awaiting_new_session: AtomicBool,
    /// Session id visible just before the most recent start(). A terminal
    /// snapshot still carrying it is a leftover from the previous run.
    prior_session_id: Mutex<Option<String>>,
}

impl<T: SessionTransport> Shared<T> {
    /// Fetch one snapshot and apply it unless it has gone stale.
    /// Returns true when polling should stop (terminal status or stale
    /// generation).
    async fn fetch_once(&self, generation: u64) -> bool {
        let seq = self.poll_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let snapshot = match self.transport.fetch_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Transcript fetch #{seq} failed: {e}");
                return false;
            }
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Discarding fetch #{seq}: session generation changed");
            return true;
        }

        // A newer response may already have been applied if the network
        // resolved out of dispatch order.
        if self.applied_seq.fetch_max(seq, Ordering::SeqCst) >= seq {
            debug!("Discarding fetch #{seq}: newer snapshot already applied");
            return false;
        }

        let status = snapshot.status;

        // The broker keeps serving the previous session's final snapshot
        // (or idle) until the start request lands on its side. Applying one
        // over the freshly cleared store would re-surface stale lines and a
        // terminal status would kill the brand-new poll loop.
        if self.awaiting_new_session.load(Ordering::SeqCst) {
            let leftover = match status {
                SessionStatus::Running => false,
                SessionStatus::Idle => true,
                _ => {
                    let prior = self.prior_session_id.lock().unwrap().clone();
                    snapshot.session_id.is_none() || snapshot.session_id == prior
                }
            };
            if leftover {
                debug!("Discarding fetch #{seq}: pre-start leftover ({status})");
                return false;
            }
            self.awaiting_new_session.store(false, Ordering::SeqCst);
        }

        self.store.apply_snapshot(snapshot);

        if status.is_terminal() {
            info!("Session reached terminal status ({status}), polling stops");
            true
        } else {
            false
        }
    }
}

/// Drives start/reset/fetch against the remote session. At most one poll
/// task is ever alive; start() aborts its predecessor before installing a
/// new one.
pub struct SessionPoller<T> {
    shared: Arc<Shared<T>>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: SessionTransport> SessionPoller<T> {
    pub fn new(transport: T, store: Arc<TranscriptStore>, interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                store,
                generation: AtomicU64::new(0),
                poll_seq: AtomicU64::new(0),
                applied_seq: AtomicU64::new(0),
                awaiting_new_session: AtomicBool::new(false),
                prior_session_id: Mutex::new(None),
            }),
            interval,
            task: Mutex::new(None),
        }
    }

    /// Begin a new session: clear local state, ask the broker to start, and
    /// install the poll loop with one immediate fetch.
    ///
    /// A failed start request is logged and otherwise silent; the next poll
    /// surfaces the truth. No retry of the start call itself.
    pub async fn start(&self) {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.prior_session_id.lock().unwrap() = self.shared.store.session_id();
        self.shared.awaiting_new_session.store(true, Ordering::SeqCst);
        self.shared.store.clear(SessionStatus::Running);

        // The broker runs the whole negotiation inside this request, so it
        // can outlive many poll cycles. Fire it in the background; progress
        // is observed through the snapshots, not the start response.
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.transport.start_session().await {
                warn!("Start request failed: {e}");
            }
        });

        self.abort_task();

        let shared = self.shared.clone();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                // First tick fires immediately, giving the initial fetch.
                ticker.tick().await;
                if shared.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                if shared.fetch_once(generation).await {
                    break;
                }
            }
            debug!("Poll loop for generation {generation} ended");
        });

        *self.task.lock().unwrap() = Some(handle);
        info!("Session started, polling every {:?}", self.interval);
    }

    /// One manual fetch outside the poll loop (e.g. picking up a session
    /// already in progress at startup). Subject to the same staleness guards.
    pub async fn fetch(&self) {
        let generation = self.shared.generation.load(Ordering::SeqCst);
        self.shared.fetch_once(generation).await;
    }

    /// Clear remote and local session state and stop polling.
    ///
    /// The generation bump happens first, synchronously: any in-flight fetch
    /// is invalidated before it can be applied, so a racing response cannot
    /// resurrect cleared state.
    pub async fn reset(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.awaiting_new_session.store(false, Ordering::SeqCst);
        self.abort_task();

        if let Err(e) = self.shared.transport.reset_session().await {
            warn!("Reset request failed: {e}");
        }

        self.shared.store.clear(SessionStatus::Idle);
        info!("Session reset");
    }

    /// Whether the recurring poll task is currently alive.
    pub fn is_polling(&self) -> bool {
        self.task
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn abort_task(&self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }
}
