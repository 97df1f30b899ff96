//! Network TTS device: OpenAI-compatible synthesis + rodio playback.
//!
//! Pipeline per job:
//! 1. POST {api_url}/audio/speech → audio bytes (mp3/wav)
//! 2. Decode and append to a rodio Sink
//! 3. Poll the sink for completion or cancellation
//! 4. Report Started / Ended / Errored events tagged with the job id
//!
//! The voice catalog loads asynchronously after construction; until it has
//! loaded, `voices_ready()` is false and the coordinator suppresses
//! auto-narration.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use reqwest::Client;
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::SpeechConfig;
use crate::narrator::device::{
    SpeechDevice, SpeechEvent, SpeechEventKind, SpeechEventSender, SpeechJob, VoiceInfo,
};

/// Catalog used when the endpoint has no voice-listing route (api.openai.com
/// doesn't; openedai-speech and friends do).
const BUILTIN_VOICES: [&str; 6] = ["alloy", "echo", "fable", "onyx", "nova", "shimmer"];

const DEFAULT_VOICE: &str = "alloy";

pub struct SynthDevice {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    speed: f32,
    voices: Mutex<Vec<VoiceInfo>>,
    ready: AtomicBool,
    cancel_flag: Arc<AtomicBool>,
    // In rodio 0.21, OutputStream is the handle — kept alive for the device
    // lifetime.
    output_stream: OutputStream,
    // Tagged with the owning job id so a lingering completion poll from a
    // preempted job never watches the wrong sink.
    active_sink: Arc<Mutex<Option<(u64, Sink)>>>,
    events: SpeechEventSender,
}

impl SynthDevice {
    pub fn new(config: &SpeechConfig, events: SpeechEventSender) -> Result<Self, String> {
        if config.api_key.is_empty() {
            return Err("No TTS API key configured".into());
        }

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| format!("Failed to create TTS HTTP client: {e}"))?;

        let output_stream = OutputStreamBuilder::open_default_stream()
            .map_err(|e| format!("Failed to open audio output: {e}"))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            speed: config.speed,
            voices: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            output_stream,
            active_sink: Arc::new(Mutex::new(None)),
            events,
        })
    }

    /// Load the voice catalog in the background. Enumeration is eventually
    /// consistent: `voices_ready()` flips true once this finishes, whether
    /// the endpoint listed voices or we fell back to the builtin catalog.
    pub fn spawn_catalog_load(self: Arc<Self>) {
        let device = self;
        tokio::spawn(async move {
            let names = match device.fetch_voice_catalog().await {
                Ok(names) if !names.is_empty() => names,
                Ok(_) | Err(_) => {
                    debug!("No voice listing from endpoint, using builtin catalog");
                    BUILTIN_VOICES.iter().map(|s| s.to_string()).collect()
                }
            };
            let count = names.len();
            *device.voices.lock().unwrap() = names.into_iter().map(VoiceInfo::new).collect();
            device.ready.store(true, Ordering::Release);
            info!("Voice catalog ready ({count} voices)");
        });
    }

    async fn fetch_voice_catalog(&self) -> Result<Vec<String>, String> {
        let url = format!("{}/audio/voices", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| format!("Voice listing failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("Voice listing returned {}", response.status()));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse voice listing: {e}"))?;

        let names = data["voices"]
            .as_array()
            .map(|voices| {
                voices
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }
}

impl SpeechDevice for SynthDevice {
    fn voices(&self) -> Vec<VoiceInfo> {
        self.voices.lock().unwrap().clone()
    }

    fn voices_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn speak(&self, job: SpeechJob, voice: Option<VoiceInfo>) {
        self.cancel_flag.store(false, Ordering::SeqCst);

        // Connect the sink up front so cancel() can reach it while the
        // synthesis request is still in flight.
        let sink = Sink::connect_new(self.output_stream.mixer());
        *self.active_sink.lock().unwrap() = Some((job.id, sink));

        let client = self.client.clone();
        let url = format!("{}/audio/speech", self.base_url);
        let api_key = self.api_key.clone();
        let body = json!({
            "model": self.model,
            "input": job.text,
            "voice": voice.map(|v| v.name).unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            "speed": self.speed,
        });
        let events = self.events.clone();
        let cancel_flag = self.cancel_flag.clone();
        let active_sink = self.active_sink.clone();

        tokio::spawn(async move {
            let job_id = job.id;

            let bytes = match synthesize(&client, &url, &api_key, body).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("TTS synthesis for job {job_id} failed: {e}");
                    clear_sink(&active_sink, job_id);
                    let _ = events.send(SpeechEvent {
                        job_id,
                        kind: SpeechEventKind::Errored,
                    });
                    return;
                }
            };

            let source = match Decoder::new(Cursor::new(bytes)) {
                Ok(source) => source,
                Err(e) => {
                    warn!("Failed to decode TTS audio for job {job_id}: {e}");
                    clear_sink(&active_sink, job_id);
                    let _ = events.send(SpeechEvent {
                        job_id,
                        kind: SpeechEventKind::Errored,
                    });
                    return;
                }
            };

            {
                let guard = active_sink.lock().unwrap();
                match guard.as_ref() {
                    Some((id, sink)) if *id == job_id => sink.append(source),
                    _ => {
                        // Cancelled while synthesizing.
                        debug!("Job {job_id} cancelled before playback");
                        let _ = events.send(SpeechEvent {
                            job_id,
                            kind: SpeechEventKind::Ended,
                        });
                        return;
                    }
                }
            }

            let _ = events.send(SpeechEvent {
                job_id,
                kind: SpeechEventKind::Started,
            });

            // Poll for completion or cancellation off the async runtime.
            let sink_for_poll = active_sink.clone();
            let cancelled = tokio::task::spawn_blocking(move || loop {
                let done = {
                    let guard = sink_for_poll.lock().unwrap();
                    match guard.as_ref() {
                        Some((id, sink)) if *id == job_id => sink.empty(),
                        // Replaced or taken by cancel(): stop watching.
                        _ => return true,
                    }
                };
                if done {
                    return false;
                }
                if cancel_flag.load(Ordering::SeqCst) {
                    if let Some((_, sink)) = sink_for_poll.lock().unwrap().take() {
                        sink.stop();
                    }
                    return true;
                }
                std::thread::sleep(std::time::Duration::from_millis(50));
            })
            .await
            .unwrap_or(true);

            if cancelled {
                debug!("Job {job_id} playback cancelled");
            }
            clear_sink(&active_sink, job_id);
            let _ = events.send(SpeechEvent {
                job_id,
                kind: SpeechEventKind::Ended,
            });
        });
    }

    fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
        if let Some((job_id, sink)) = self.active_sink.lock().unwrap().take() {
            sink.stop();
            debug!("Cancelled active utterance (job {job_id})");
        }
    }
}

async fn synthesize(
    client: &Client,
    url: &str,
    api_key: &str,
    body: serde_json::Value,
) -> Result<Vec<u8>, String> {
    let response = client
        .post(url)
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("TTS request failed: {e}"))?;

    if !response.status().is_success() {
        return Err(format!("TTS API returned {}", response.status()));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| format!("Failed to read TTS audio: {e}"))?;
    Ok(bytes.to_vec())
}

fn clear_sink(active_sink: &Arc<Mutex<Option<(u64, Sink)>>>, job_id: u64) {
    let mut guard = active_sink.lock().unwrap();
    if matches!(guard.as_ref(), Some((id, _)) if *id == job_id) {
        *guard = None;
    }
}
