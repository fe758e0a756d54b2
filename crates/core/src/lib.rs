//! Conversation orchestration core for DialAI voice calls.
//!
//! The pieces compose bottom-up: the `limiter` serializes provider traffic,
//! the `voice` coordinator owns the half-duplex listen/speak channel, the
//! `generator` turns transcripts into agent utterances, and the
//! `orchestrator` sequences whole calls and persists them through `store`.

pub mod call;
pub mod generator;
pub mod limiter;
pub mod orchestrator;
pub mod provider;
pub mod store;
pub mod voice;

pub use call::{Call, CallStatus, KnowledgeBase, Message, Role};
pub use generator::{ConversationGenerator, GenerationError, Greeting, RetryPolicy};
pub use limiter::RateLimiter;
pub use orchestrator::{CallError, CallOrchestrator};
pub use provider::{GenerationProvider, ProviderError};
pub use store::{CallStore, JsonFileStore, StoreError};
pub use voice::{
    CallerEvent, CaptureEvent, DeviceError, SpeechCapture, SpeechSynthesis, VoiceConfig,
    VoiceCoordinator, VoiceState,
};
