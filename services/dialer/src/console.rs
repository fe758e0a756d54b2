//! Console adapters for the speech capture/synthesis boundaries.
//!
//! They let the whole conversation loop run on a plain terminal: typed
//! lines stand in for final transcripts and the agent's lines are printed
//! instead of synthesized. Once stdin reaches EOF the capture goes quiet,
//! and the coordinator's silence watchdog winds the call down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dialai_core::voice::{CaptureEvent, DeviceError, SpeechCapture, SpeechSynthesis};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

pub struct ConsoleCapture {
    active: Arc<AtomicBool>,
    eof: Arc<AtomicBool>,
}

impl ConsoleCapture {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            eof: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for ConsoleCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechCapture for ConsoleCapture {
    async fn start(&self) -> Result<mpsc::Receiver<CaptureEvent>, DeviceError> {
        let (tx, rx) = mpsc::channel(16);
        self.active.store(true, Ordering::SeqCst);

        let active = self.active.clone();
        let eof = self.eof.clone();

        if eof.load(Ordering::SeqCst) {
            // Stdin is exhausted; keep the session open but silent so the
            // watchdog (not a restart loop) decides what happens next.
            tokio::spawn(async move {
                let _tx = tx;
                while active.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            });
            return Ok(rx);
        }

        tokio::spawn(async move {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            while active.load(Ordering::SeqCst) {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let event = CaptureEvent::Transcript {
                            text: line,
                            is_final: true,
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        eof.store(true, Ordering::SeqCst);
                        let _ = tx.send(CaptureEvent::SessionEnded).await;
                        break;
                    }
                    Err(e) => {
                        let _ = tx
                            .send(CaptureEvent::Failed(DeviceError::Capture(e.to_string())))
                            .await;
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

pub struct ConsoleSynthesis;

#[async_trait]
impl SpeechSynthesis for ConsoleSynthesis {
    async fn voices(&self) -> Vec<String> {
        vec!["console".to_string()]
    }

    async fn speak(&self, text: &str, _voice: Option<String>) -> Result<(), DeviceError> {
        println!(">> {text}");
        Ok(())
    }

    async fn cancel(&self) {}
}
