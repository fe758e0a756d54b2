mod config;
mod console;
mod gemini;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::fmt::time::ChronoLocal;

use crate::config::Config;
use crate::console::{ConsoleCapture, ConsoleSynthesis};
use crate::gemini::GeminiProvider;
use dialai_core::generator::ConversationGenerator;
use dialai_core::limiter::RateLimiter;
use dialai_core::orchestrator::CallOrchestrator;
use dialai_core::store::JsonFileStore;
use dialai_core::voice::{CallerEvent, VoiceConfig, VoiceCoordinator};

/// Consecutive silence signals tolerated before hanging up.
const MAX_QUIET_PERIODS: u32 = 2;

#[derive(Parser)]
#[command(version, about = "Interactive DialAI sales call on the terminal")]
struct Cli {
    /// Call-record file (overrides STORE_PATH).
    #[arg(long)]
    store: Option<String>,
    /// Print replies only; skip the spoken-output path.
    #[arg(long)]
    no_voice: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    // --- 3. Parse Command-Line Arguments ---
    let args = Cli::parse();
    let store_path = args.store.unwrap_or_else(|| config.store_path.clone());

    // --- 4. Wire Up the Core ---
    let limiter = Arc::new(RateLimiter::new(Duration::from_millis(1000)));
    let provider = Arc::new(GeminiProvider::new(
        config.gemini_api_key.clone(),
        config.chat_model.clone(),
    ));
    let generator = Arc::new(ConversationGenerator::new(limiter, provider));
    let voice = Arc::new(VoiceCoordinator::new(
        Arc::new(ConsoleCapture::new()),
        Arc::new(ConsoleSynthesis),
        VoiceConfig::default(),
    ));
    let store = Arc::new(JsonFileStore::new(&store_path));
    let orchestrator = CallOrchestrator::new(generator, voice.clone(), store);

    orchestrator
        .load_calls()
        .await
        .context("Failed to load persisted call records")?;

    // --- 5. Run One Call ---
    let call_id = orchestrator.start_call().await.context("Failed to start call")?;
    tracing::info!(%call_id, "call started; type to talk, Ctrl-C to hang up");

    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(16);
    voice
        .start_listening(events_tx)
        .await
        .context("Failed to start listening")?;

    let mut quiet_periods = 0u32;
    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(CallerEvent::Utterance(text)) => {
                    quiet_periods = 0;
                    if let Err(e) = orchestrator.send_message(&text, !args.no_voice).await {
                        // The call stays active and keeps the caller's
                        // message; the next utterance simply retries.
                        tracing::error!("turn failed: {e}");
                    }
                }
                Some(CallerEvent::Silence) => {
                    quiet_periods += 1;
                    tracing::debug!(quiet_periods, "caller is silent");
                    if quiet_periods >= MAX_QUIET_PERIODS || args.no_voice {
                        tracing::info!("caller went quiet; hanging up");
                        break;
                    }
                    // Speaking pauses and resumes capture, which re-arms the
                    // silence watchdog for one more quiet period.
                    voice.speak("Are you still there?").await;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C, hanging up...");
                break;
            }
        }
    }

    if let Err(e) = orchestrator.end_call(&call_id).await {
        tracing::warn!("call closed without a summary: {e}");
    }
    if let Some(call) = orchestrator.call(&call_id) {
        tracing::info!(
            status = ?call.status,
            messages = call.messages.len(),
            "call record persisted to {store_path}"
        );
        if let Some(summary) = call.summary {
            tracing::info!("call summary:\n{summary}");
        }
    }
    Ok(())
}
