//! Voice I/O coordination.
//!
//! Capture devices and synthesis engines are flaky and session-scoped. The
//! coordinator presents them as one clean half-duplex channel: at any
//! instant the call is listening, speaking, or idle — never listening and
//! speaking at once. Device-level interruptions (session limits, transient
//! errors, missing voices) are absorbed here and never surface to the
//! conversation logic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Capture/synthesis device failures. `NoSpeech` is a quiet line, not a
/// fault; the rest are recovered internally where possible.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("no speech detected")]
    NoSpeech,
    #[error("speech capture failed: {0}")]
    Capture(String),
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
}

/// One event from an underlying capture session.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Transcript { text: String, is_final: bool },
    /// The device ended the session on its own (session limits, timeouts).
    SessionEnded,
    Failed(DeviceError),
}

/// What the coordinator reports upward. Silence is its own variant so it
/// can never be mistaken for an empty utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerEvent {
    Utterance(String),
    Silence,
}

/// Speech-capture boundary. Sessions are cheap; the coordinator starts and
/// stops them repeatedly within one conversation.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait SpeechCapture: Send + Sync {
    async fn start(&self) -> Result<mpsc::Receiver<CaptureEvent>, DeviceError>;
    async fn stop(&self);
}

/// Speech-synthesis boundary.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait SpeechSynthesis: Send + Sync {
    async fn voices(&self) -> Vec<String>;
    async fn speak(&self, text: &str, voice: Option<String>) -> Result<(), DeviceError>;
    async fn cancel(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Listening,
    Speaking,
}

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Quiet time after which the caller is considered silent.
    pub silence_threshold: Duration,
    /// How often the silence watchdog checks.
    pub watchdog_tick: Duration,
    /// Delay before restarting capture after the device ends a session.
    pub restart_debounce: Duration,
    /// Delay before restarting capture after a device error.
    pub recover_delay: Duration,
    /// Delay before resuming capture once synthesis finishes.
    pub resume_delay: Duration,
    /// Synthesis retries before giving up on audio for an utterance.
    pub speak_retries: u32,
    /// Per-attempt backoff unit for synthesis retries.
    pub speak_backoff: Duration,
    /// Poll period and bound while waiting for synthesis voices to appear.
    pub voice_poll: Duration,
    pub voice_poll_limit: u32,
    /// Substring preference when picking a voice.
    pub voice_hint: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            silence_threshold: Duration::from_secs(3),
            watchdog_tick: Duration::from_secs(1),
            restart_debounce: Duration::from_millis(300),
            recover_delay: Duration::from_secs(1),
            resume_delay: Duration::from_millis(300),
            speak_retries: 3,
            speak_backoff: Duration::from_millis(100),
            voice_poll: Duration::from_millis(100),
            voice_poll_limit: 50,
            voice_hint: "en".to_string(),
        }
    }
}

struct ListenSession {
    events: mpsc::Sender<CallerEvent>,
    driver: JoinHandle<()>,
}

pub struct VoiceCoordinator {
    capture: Arc<dyn SpeechCapture>,
    synthesis: Arc<dyn SpeechSynthesis>,
    config: VoiceConfig,
    state: Arc<Mutex<VoiceState>>,
    listener: Mutex<Option<ListenSession>>,
    /// Serializes `speak` so only one utterance is synthesized at a time.
    speak_gate: tokio::sync::Mutex<()>,
    voices_ready: AtomicBool,
    /// Bumped by `cancel` so an in-progress speak stops retrying/resuming.
    cancel_epoch: AtomicU64,
}

impl VoiceCoordinator {
    pub fn new(
        capture: Arc<dyn SpeechCapture>,
        synthesis: Arc<dyn SpeechSynthesis>,
        config: VoiceConfig,
    ) -> Self {
        Self {
            capture,
            synthesis,
            config,
            state: Arc::new(Mutex::new(VoiceState::Idle)),
            listener: Mutex::new(None),
            speak_gate: tokio::sync::Mutex::new(()),
            voices_ready: AtomicBool::new(false),
            cancel_epoch: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> VoiceState {
        *self.state.lock()
    }

    /// Starts (or restarts) capture, delivering caller events to `events`.
    /// Any previous capture session is fully torn down first.
    pub async fn start_listening(
        &self,
        events: mpsc::Sender<CallerEvent>,
    ) -> Result<(), DeviceError> {
        self.stop_listening().await;
        {
            let mut state = self.state.lock();
            if *state == VoiceState::Speaking {
                return Err(DeviceError::Capture(
                    "cannot start listening while speaking".into(),
                ));
            }
            *state = VoiceState::Listening;
        }
        let driver = tokio::spawn(drive_capture(
            self.capture.clone(),
            events.clone(),
            self.config.clone(),
        ));
        *self.listener.lock() = Some(ListenSession { events, driver });
        Ok(())
    }

    /// Idempotent: tears down the capture driver and its watchdog, stops
    /// the device, and leaves `Speaking` untouched if a speak is running.
    pub async fn stop_listening(&self) {
        if let Some(session) = self.listener.lock().take() {
            session.driver.abort();
        }
        self.capture.stop().await;
        let mut state = self.state.lock();
        if *state == VoiceState::Listening {
            *state = VoiceState::Idle;
        }
    }

    /// Speaks one utterance. Listening is paused for the duration and
    /// resumed (same event channel) afterwards. Synthesis is best-effort:
    /// after the retry budget is spent the conversation proceeds without
    /// audio, so this never fails the caller.
    pub async fn speak(&self, text: &str) {
        let _turn = self.speak_gate.lock().await;
        let epoch = self.cancel_epoch.load(Ordering::SeqCst);

        self.ensure_voices().await;

        let resume = self.listener.lock().as_ref().map(|s| s.events.clone());
        self.stop_listening().await;
        *self.state.lock() = VoiceState::Speaking;

        let preferred = self.pick_voice().await;
        let mut attempt = 0u32;
        loop {
            // Retries fall back to whatever default voice the engine has.
            let voice = if attempt == 0 { preferred.clone() } else { None };
            match self.synthesis.speak(text, voice).await {
                Ok(()) => break,
                Err(_) if self.cancel_epoch.load(Ordering::SeqCst) != epoch => {
                    tracing::debug!("synthesis interrupted by cancel");
                    break;
                }
                Err(e) if attempt < self.config.speak_retries => {
                    attempt += 1;
                    tracing::warn!("speech synthesis failed (attempt {attempt}): {e}; retrying");
                    self.synthesis.cancel().await;
                    tokio::time::sleep(self.config.speak_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::warn!(
                        "speech synthesis failed after {attempt} retries: {e}; continuing without voice"
                    );
                    break;
                }
            }
        }

        {
            let mut state = self.state.lock();
            if *state == VoiceState::Speaking {
                *state = VoiceState::Idle;
            }
        }

        let cancelled = self.cancel_epoch.load(Ordering::SeqCst) != epoch;
        if let Some(events) = resume {
            if cancelled {
                return;
            }
            tokio::time::sleep(self.config.resume_delay).await;
            if let Err(e) = self.start_listening(events).await {
                tracing::warn!("failed to resume listening after speaking: {e}");
            }
        }
    }

    /// Immediately stops any synthesis and capture. A no-op when idle.
    pub async fn cancel(&self) {
        self.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        self.synthesis.cancel().await;
        self.stop_listening().await;
        *self.state.lock() = VoiceState::Idle;
    }

    /// Bounded wait for the synthesis engine to report at least one voice.
    /// Expiring the budget is not fatal; synthesis proceeds voiceless.
    async fn ensure_voices(&self) {
        if self.voices_ready.load(Ordering::Relaxed) {
            return;
        }
        for _ in 0..self.config.voice_poll_limit {
            if !self.synthesis.voices().await.is_empty() {
                self.voices_ready.store(true, Ordering::Relaxed);
                return;
            }
            tokio::time::sleep(self.config.voice_poll).await;
        }
        tracing::warn!("no synthesis voices appeared within the polling budget; continuing");
    }

    async fn pick_voice(&self) -> Option<String> {
        let voices = self.synthesis.voices().await;
        let hint = self.config.voice_hint.to_lowercase();
        voices
            .iter()
            .find(|v| {
                let v = v.to_lowercase();
                v.contains(&hint) && v.contains("female")
            })
            .or_else(|| voices.first())
            .cloned()
    }
}

/// Owns one listening intent: keeps a capture session alive across device
/// restarts and runs the silence watchdog. Aborted by `stop_listening`.
async fn drive_capture(
    capture: Arc<dyn SpeechCapture>,
    events: mpsc::Sender<CallerEvent>,
    config: VoiceConfig,
) {
    'session: loop {
        let mut session = match capture.start().await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("speech capture failed to start: {e}; retrying");
                tokio::time::sleep(config.recover_delay).await;
                continue 'session;
            }
        };

        let mut last_activity = Instant::now();
        let mut silence_signaled = false;
        let mut watchdog = tokio::time::interval(config.watchdog_tick);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = session.recv() => match event {
                    Some(CaptureEvent::Transcript { text, is_final }) => {
                        // Interim results count as speech activity too.
                        last_activity = Instant::now();
                        silence_signaled = false;
                        if is_final {
                            let text = text.trim().to_owned();
                            if text.is_empty() {
                                // An empty final transcript carries no
                                // content; silence is reported separately.
                                continue;
                            }
                            if events.send(CallerEvent::Utterance(text)).await.is_err() {
                                break 'session;
                            }
                        }
                    }
                    Some(CaptureEvent::SessionEnded) | None => {
                        // Devices cap session length; restart after a short
                        // debounce as long as the listening intent holds.
                        tokio::time::sleep(config.restart_debounce).await;
                        continue 'session;
                    }
                    Some(CaptureEvent::Failed(DeviceError::NoSpeech)) => {
                        // Quiet line. The watchdog will report the silence.
                    }
                    Some(CaptureEvent::Failed(e)) => {
                        tracing::warn!("speech capture error: {e}; restarting session");
                        capture.stop().await;
                        tokio::time::sleep(config.recover_delay).await;
                        continue 'session;
                    }
                },
                _ = watchdog.tick() => {
                    if !silence_signaled && last_activity.elapsed() > config.silence_threshold {
                        silence_signaled = true;
                        if events.send(CallerEvent::Silence).await.is_err() {
                            break 'session;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Capture fake that hands out a fresh event channel per session and
    /// tracks whether a session is currently open.
    struct ScriptedCapture {
        session_tx: Mutex<Option<mpsc::Sender<CaptureEvent>>>,
        capturing: Arc<AtomicBool>,
        starts: AtomicUsize,
    }

    impl ScriptedCapture {
        fn new() -> Self {
            Self {
                session_tx: Mutex::new(None),
                capturing: Arc::new(AtomicBool::new(false)),
                starts: AtomicUsize::new(0),
            }
        }

        fn push(&self, event: CaptureEvent) {
            let tx = self.session_tx.lock().clone().expect("no capture session");
            tx.try_send(event).expect("capture channel full");
        }
    }

    #[async_trait]
    impl SpeechCapture for ScriptedCapture {
        async fn start(&self) -> Result<mpsc::Receiver<CaptureEvent>, DeviceError> {
            let (tx, rx) = mpsc::channel(16);
            *self.session_tx.lock() = Some(tx);
            self.capturing.store(true, Ordering::SeqCst);
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(rx)
        }

        async fn stop(&self) {
            self.capturing.store(false, Ordering::SeqCst);
            *self.session_tx.lock() = None;
        }
    }

    /// Synthesis fake that records whether capture was open while speaking
    /// and can be scripted to fail a number of times.
    struct ScriptedSynthesis {
        capturing: Arc<AtomicBool>,
        overlap_seen: AtomicBool,
        failures_left: AtomicUsize,
        speak_calls: AtomicUsize,
    }

    impl ScriptedSynthesis {
        fn new(capturing: Arc<AtomicBool>, failures: usize) -> Self {
            Self {
                capturing,
                overlap_seen: AtomicBool::new(false),
                failures_left: AtomicUsize::new(failures),
                speak_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SpeechSynthesis for ScriptedSynthesis {
        async fn voices(&self) -> Vec<String> {
            vec!["en-US female".to_string(), "en-GB male".to_string()]
        }

        async fn speak(&self, _text: &str, _voice: Option<String>) -> Result<(), DeviceError> {
            self.speak_calls.fetch_add(1, Ordering::SeqCst);
            if self.capturing.load(Ordering::SeqCst) {
                self.overlap_seen.store(true, Ordering::SeqCst);
            }
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(DeviceError::Synthesis("engine hiccup".into()));
            }
            Ok(())
        }

        async fn cancel(&self) {}
    }

    fn coordinator(
        failures: usize,
    ) -> (Arc<VoiceCoordinator>, Arc<ScriptedCapture>, Arc<ScriptedSynthesis>) {
        let capture = Arc::new(ScriptedCapture::new());
        let synthesis = Arc::new(ScriptedSynthesis::new(capture.capturing.clone(), failures));
        let coordinator = Arc::new(VoiceCoordinator::new(
            capture.clone(),
            synthesis.clone(),
            VoiceConfig::default(),
        ));
        (coordinator, capture, synthesis)
    }

    #[tokio::test(start_paused = true)]
    async fn emits_exactly_one_silence_signal_per_quiet_period() {
        let (coordinator, capture, _) = coordinator(0);
        let (tx, mut rx) = mpsc::channel(16);
        coordinator.start_listening(tx).await.unwrap();

        // Nothing is said: the watchdog reports silence once.
        assert_eq!(rx.recv().await, Some(CallerEvent::Silence));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err(), "silence must not repeat");

        // Speech re-arms the watchdog.
        capture.push(CaptureEvent::Transcript {
            text: "I have 50 employees".into(),
            is_final: true,
        });
        assert_eq!(
            rx.recv().await,
            Some(CallerEvent::Utterance("I have 50 employees".into()))
        );
        assert_eq!(rx.recv().await, Some(CallerEvent::Silence));

        coordinator.stop_listening().await;
    }

    #[tokio::test(start_paused = true)]
    async fn interim_transcripts_reset_the_silence_clock_without_emitting() {
        let (coordinator, capture, _) = coordinator(0);
        let (tx, mut rx) = mpsc::channel(16);
        coordinator.start_listening(tx).await.unwrap();

        // Keep the line "active" with interim results for a while.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            capture.push(CaptureEvent::Transcript {
                text: "umm".into(),
                is_final: false,
            });
            tokio::task::yield_now().await;
            assert!(rx.try_recv().is_err(), "interim results must not surface");
        }

        coordinator.stop_listening().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_final_transcript_is_not_an_utterance() {
        let (coordinator, capture, _) = coordinator(0);
        let (tx, mut rx) = mpsc::channel(16);
        coordinator.start_listening(tx).await.unwrap();
        // Let the driver open its capture session.
        tokio::time::sleep(Duration::from_millis(10)).await;

        capture.push(CaptureEvent::Transcript {
            text: "   ".into(),
            is_final: true,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());

        coordinator.stop_listening().await;
    }

    #[tokio::test(start_paused = true)]
    async fn session_end_restarts_capture_while_listening() {
        let (coordinator, capture, _) = coordinator(0);
        let (tx, mut rx) = mpsc::channel(16);
        coordinator.start_listening(tx).await.unwrap();
        // Let the driver open the first session.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(capture.starts.load(Ordering::SeqCst), 1);

        capture.push(CaptureEvent::SessionEnded);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(capture.starts.load(Ordering::SeqCst) >= 2, "capture must restart");

        // The restarted session still delivers utterances.
        capture.push(CaptureEvent::Transcript {
            text: "still here".into(),
            is_final: true,
        });
        assert_eq!(rx.recv().await, Some(CallerEvent::Utterance("still here".into())));

        coordinator.stop_listening().await;
    }

    #[tokio::test(start_paused = true)]
    async fn capture_errors_recover_without_surfacing() {
        let (coordinator, capture, _) = coordinator(0);
        let (tx, mut rx) = mpsc::channel(16);
        coordinator.start_listening(tx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        capture.push(CaptureEvent::Failed(DeviceError::Capture("device busy".into())));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(capture.starts.load(Ordering::SeqCst) >= 2, "capture must recover");

        capture.push(CaptureEvent::Transcript {
            text: "recovered".into(),
            is_final: true,
        });
        assert_eq!(rx.recv().await, Some(CallerEvent::Utterance("recovered".into())));

        coordinator.stop_listening().await;
    }

    #[tokio::test(start_paused = true)]
    async fn never_listening_while_speaking_and_listening_resumes() {
        let (coordinator, capture, synthesis) = coordinator(0);
        let (tx, mut rx) = mpsc::channel(16);
        coordinator.start_listening(tx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.state(), VoiceState::Listening);

        coordinator.speak("Let me tell you about DialAI.").await;

        assert!(
            !synthesis.overlap_seen.load(Ordering::SeqCst),
            "capture was open during synthesis"
        );
        assert_eq!(coordinator.state(), VoiceState::Listening, "listening must resume");

        // The resumed session uses the same channel.
        tokio::time::sleep(Duration::from_millis(10)).await;
        capture.push(CaptureEvent::Transcript {
            text: "sounds good".into(),
            is_final: true,
        });
        assert_eq!(rx.recv().await, Some(CallerEvent::Utterance("sounds good".into())));

        coordinator.stop_listening().await;
    }

    #[tokio::test(start_paused = true)]
    async fn synthesis_failures_are_retried_then_swallowed() {
        // More failures than the retry budget: every attempt fails.
        let (coordinator, _, synthesis) = coordinator(usize::MAX);
        coordinator.speak("hello?").await;

        // Initial attempt plus the full retry budget.
        let expected = 1 + VoiceConfig::default().speak_retries as usize;
        assert_eq!(synthesis.speak_calls.load(Ordering::SeqCst), expected);
        assert_eq!(coordinator.state(), VoiceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn synthesis_recovers_within_the_retry_budget() {
        let (coordinator, _, synthesis) = coordinator(2);
        coordinator.speak("hello?").await;
        assert_eq!(synthesis.speak_calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.state(), VoiceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_listening_twice_and_cancel_when_idle_are_no_ops() {
        let (coordinator, _, _) = coordinator(0);
        coordinator.stop_listening().await;
        coordinator.stop_listening().await;
        coordinator.cancel().await;
        assert_eq!(coordinator.state(), VoiceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_listening() {
        let (coordinator, capture, _) = coordinator(0);
        let (tx, _rx) = mpsc::channel(16);
        coordinator.start_listening(tx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        coordinator.cancel().await;
        assert_eq!(coordinator.state(), VoiceState::Idle);
        assert!(!capture.capturing.load(Ordering::SeqCst));
    }
}
