//! negotiation-narrator: poll a remote negotiation session and narrate it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use negotiation_narrator::config::Config;
use negotiation_narrator::narrator::{
    event_channel, NarratorHandle, NullDevice, SpeechCoordinator, SpeechDevice, SynthDevice,
    VoiceAssignment,
};
use negotiation_narrator::poller::SessionPoller;
use negotiation_narrator::remote::HttpTransport;
use negotiation_narrator::store::TranscriptStore;

#[derive(Parser, Debug)]
#[command(name = "negotiation-narrator", about = "Narrated viewer for a remote negotiation session")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker base URL (overrides config)
    #[arg(short, long)]
    base_url: Option<String>,

    /// Disable speech output
    #[arg(long)]
    no_speech: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug,reqwest=info,rodio=info")
    } else {
        EnvFilter::new("info,reqwest=warn,rodio=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("negotiation-narrator starting");

    let mut config = Config::load(args.config.as_deref());
    if let Some(base_url) = args.base_url {
        config.poll.base_url = base_url;
    }
    info!("Broker: {}", config.poll.base_url);

    let store = Arc::new(TranscriptStore::new());
    let transport = HttpTransport::new(&config.poll)?;
    let poller = Arc::new(SessionPoller::new(
        transport,
        store.clone(),
        Duration::from_millis(config.poll.interval_ms),
    ));

    let (events_tx, events_rx) = event_channel();
    let device: Arc<dyn SpeechDevice> = if args.no_speech || !config.speech.enabled {
        info!("Speech output disabled");
        Arc::new(NullDevice::new(events_tx))
    } else {
        match SynthDevice::new(&config.speech, events_tx.clone()) {
            Ok(device) => {
                let device = Arc::new(device);
                device.clone().spawn_catalog_load();
                info!("TTS device ready (model: {})", config.speech.model);
                device
            }
            Err(e) => {
                warn!("Failed to set up TTS: {e}");
                info!("Continuing without voice output");
                Arc::new(NullDevice::new(events_tx))
            }
        }
    };

    let (coordinator, narrator) = SpeechCoordinator::new(
        store.clone(),
        device,
        VoiceAssignment::new(config.voices.clone()),
        Duration::from_millis(config.speech.preempt_delay_ms),
        events_rx,
    );
    tokio::spawn(coordinator.run());

    // Pick up a session already in progress.
    poller.fetch().await;
    print_status(&store, &narrator);

    run_command_loop(store, poller, narrator).await;

    Ok(())
}

/// Minimal interactive surface standing in for the view: relays the three
/// user intents (start / reset / replay) plus status inspection.
async fn run_command_loop(
    store: Arc<TranscriptStore>,
    poller: Arc<SessionPoller<HttpTransport>>,
    narrator: NarratorHandle,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Commands: start | reset | replay <n> | status | show | quit");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("stdin error: {e}");
                break;
            }
        };

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("start") => {
                narrator.cancel_all().await;
                poller.start().await;
                println!("Session starting");
            }
            Some("reset") => {
                poller.reset().await;
                narrator.cancel_all().await;
                println!("Session reset");
            }
            Some("replay") => match parts.next().and_then(|n| n.parse::<usize>().ok()) {
                Some(index) => match store.entry(index) {
                    Some(entry) => match entry.spoken_text() {
                        Some(text) => {
                            narrator.replay(text.to_string(), entry.role.clone(), index).await;
                            println!("Replaying entry {index}");
                        }
                        None => println!("Entry {index} has no narration"),
                    },
                    None => println!("No entry at index {index}"),
                },
                None => println!("Usage: replay <entry-index>"),
            },
            Some("status") => print_status(&store, &narrator),
            Some("show") => print_transcript(&store),
            Some("quit") | Some("exit") => break,
            Some(other) => println!("Unknown command: {other}"),
            None => {}
        }
    }
}

fn print_status(store: &TranscriptStore, narrator: &NarratorHandle) {
    let session = store
        .session_id()
        .unwrap_or_else(|| "-".to_string());
    let speaking = narrator
        .speaking_index()
        .map(|i| i.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "status={} session={} entries={} speaking={}",
        store.status(),
        session,
        store.len(),
        speaking
    );
    if let Some(artifact) = store.artifact() {
        println!("artifact: {} {}", artifact.kind, artifact.data);
    }
}

fn print_transcript(store: &TranscriptStore) {
    let entries = store.entries();
    if entries.is_empty() {
        println!("No messages yet");
        return;
    }
    for (index, entry) in entries.iter().enumerate() {
        println!("[{index}] {}: {}", entry.role, entry.content);
        if let Some(rationale) = entry.rationale() {
            println!("      rationale: {rationale}");
        }
        if let Some(spoken) = entry.spoken_text() {
            println!("      speak: {spoken}");
        }
    }
}
