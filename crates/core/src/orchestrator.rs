//! Call lifecycle orchestration.
//!
//! The orchestrator is the sole owner of the call collection. It sequences
//! turns (caller speaks, generator replies, agent speaks), flushes every
//! mutation to the durable store, and surfaces failures as its current
//! error value.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::call::{Call, CallStatus, Message};
use crate::generator::{ConversationGenerator, GenerationError};
use crate::store::{CallStore, StoreError};
use crate::voice::VoiceCoordinator;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("no active call")]
    NoActiveCall,
    #[error("call {0} not found")]
    CallNotFound(String),
    /// The call reached a terminal state while its reply was in flight;
    /// the late result was discarded rather than applied.
    #[error("call ended before the reply arrived")]
    CallEnded,
    #[error("failed to start call: {0}")]
    StartFailed(String),
    #[error("failed to generate a reply: {0}")]
    Generation(#[from] GenerationError),
    #[error("call store failure: {0}")]
    Store(#[from] StoreError),
}

pub struct CallOrchestrator {
    generator: Arc<ConversationGenerator>,
    voice: Arc<VoiceCoordinator>,
    store: Arc<dyn CallStore>,
    calls: Mutex<HashMap<String, Call>>,
    active_call: Mutex<Option<String>>,
    active_knowledge_base: Mutex<Option<String>>,
    /// Latest surfaced failure. Overwritten by newer failures; cleared only
    /// through `clear_error`.
    last_error: Mutex<Option<String>>,
    /// Serializes turns: a second `send_message` queues behind the one in
    /// flight instead of interleaving transcript mutations.
    turn_gate: tokio::sync::Mutex<()>,
}

impl CallOrchestrator {
    pub fn new(
        generator: Arc<ConversationGenerator>,
        voice: Arc<VoiceCoordinator>,
        store: Arc<dyn CallStore>,
    ) -> Self {
        Self {
            generator,
            voice,
            store,
            calls: Mutex::new(HashMap::new()),
            active_call: Mutex::new(None),
            active_knowledge_base: Mutex::new(None),
            last_error: Mutex::new(None),
            turn_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Seeds the in-memory call map from the durable store. Called once at
    /// startup, before any call is started.
    pub async fn load_calls(&self) -> Result<(), CallError> {
        let persisted = self.store.load().await?;
        tracing::debug!(count = persisted.len(), "loaded persisted call records");
        *self.calls.lock() = persisted;
        Ok(())
    }

    pub fn set_active_knowledge_base(&self, id: impl Into<String>) {
        *self.active_knowledge_base.lock() = Some(id.into());
    }

    pub fn active_call_id(&self) -> Option<String> {
        self.active_call.lock().clone()
    }

    pub fn call(&self, call_id: &str) -> Option<Call> {
        self.calls.lock().get(call_id).cloned()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    /// Opens a new call: greeting seeded as the first assistant message,
    /// record persisted, greeting spoken. If the record cannot be persisted
    /// the call is discarded rather than left dangling in `Active`.
    pub async fn start_call(&self) -> Result<String, CallError> {
        let greeting = self.generator.open_greeting();
        let call = Call::new(&greeting.text, &greeting.agent_name);
        let call_id = call.id.clone();

        self.calls.lock().insert(call_id.clone(), call);
        *self.active_call.lock() = Some(call_id.clone());

        if let Err(e) = self.persist().await {
            self.calls.lock().remove(&call_id);
            *self.active_call.lock() = None;
            let err = CallError::StartFailed(e.to_string());
            self.record_error(&err);
            return Err(err);
        }

        tracing::info!(%call_id, agent = %greeting.agent_name, "call started");
        self.voice.speak(&greeting.text).await;
        Ok(call_id)
    }

    /// One conversation turn: append the caller's message, generate the
    /// agent's reply from the updated transcript, append it, and optionally
    /// speak it. The caller's message survives a failed turn so the next
    /// attempt retains context.
    pub async fn send_message(&self, content: &str, use_voice: bool) -> Result<String, CallError> {
        let _turn = self.turn_gate.lock().await;

        let Some(call_id) = self.active_call.lock().clone() else {
            let err = CallError::NoActiveCall;
            self.record_error(&err);
            return Err(err);
        };

        let transcript = {
            let mut calls = self.calls.lock();
            let Some(call) = calls.get_mut(&call_id) else {
                let err = CallError::NoActiveCall;
                self.record_error(&err);
                return Err(err);
            };
            call.push_message(Message::user(content));
            call.messages.clone()
        };
        self.persist_or_warn().await;

        let knowledge_base_id = self.active_knowledge_base.lock().clone();
        let reply = match self
            .generator
            .next_utterance(&transcript, knowledge_base_id.as_deref())
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                let err = CallError::Generation(e);
                self.record_error(&err);
                return Err(err);
            }
        };

        {
            let mut calls = self.calls.lock();
            let Some(call) = calls.get_mut(&call_id) else {
                return Err(CallError::CallEnded);
            };
            if call.status != CallStatus::Active {
                // The call was hung up while the provider was thinking; a
                // terminal record is immutable, so the reply is dropped.
                tracing::debug!(%call_id, "discarding reply for ended call");
                return Err(CallError::CallEnded);
            }
            let agent_name = call.assistant_name.clone();
            call.push_message(Message::assistant(&reply, agent_name));
        }
        self.persist_or_warn().await;

        if use_voice {
            self.voice.speak(&reply).await;
        }
        Ok(reply)
    }

    /// Closes a call. The summary is best-effort, but closure is not: a
    /// failed summary still forces the terminal `Failed` state, with
    /// `end_time` set either way. Terminal calls are left untouched.
    pub async fn end_call(&self, call_id: &str) -> Result<(), CallError> {
        let transcript = {
            let calls = self.calls.lock();
            let Some(call) = calls.get(call_id) else {
                let err = CallError::CallNotFound(call_id.to_string());
                self.record_error(&err);
                return Err(err);
            };
            if call.status.is_terminal() {
                return Ok(());
            }
            call.messages.clone()
        };

        let summary = self.generator.summarize(&transcript).await;

        {
            let mut calls = self.calls.lock();
            if let Some(call) = calls.get_mut(call_id) {
                match &summary {
                    Ok(text) => call.close(CallStatus::Completed, Some(text.clone())),
                    Err(e) => {
                        tracing::warn!(%call_id, "summary generation failed: {e}; closing as failed");
                        call.close(CallStatus::Failed, None);
                    }
                }
            }
        }
        self.persist_or_warn().await;

        self.voice.cancel().await;
        {
            let mut active = self.active_call.lock();
            if active.as_deref() == Some(call_id) {
                *active = None;
            }
        }

        match summary {
            Ok(_) => {
                tracing::info!(%call_id, "call completed");
                Ok(())
            }
            Err(e) => {
                let err = CallError::Generation(e);
                self.record_error(&err);
                Err(err)
            }
        }
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let snapshot = self.calls.lock().clone();
        self.store.save(&snapshot).await
    }

    /// Mid-call flush failures are logged, not fatal: a disk blip must not
    /// kill a live conversation, and the next mutation retries the flush.
    async fn persist_or_warn(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!("failed to persist call records: {e}");
        }
    }

    fn record_error(&self, err: &CallError) {
        *self.last_error.lock() = Some(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Role;
    use crate::limiter::RateLimiter;
    use crate::provider::{MockGenerationProvider, ProviderError};
    use crate::store::{JsonFileStore, MockCallStore};
    use crate::voice::{MockSpeechCapture, MockSpeechSynthesis, VoiceConfig};
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_voice() -> Arc<VoiceCoordinator> {
        let mut capture = MockSpeechCapture::new();
        capture.expect_stop().returning(|| Box::pin(async {}));
        let mut synthesis = MockSpeechSynthesis::new();
        synthesis
            .expect_voices()
            .returning(|| Box::pin(async { vec!["en-US female".to_string()] }));
        synthesis
            .expect_speak()
            .returning(|_, _| Box::pin(async { Ok(()) }));
        synthesis.expect_cancel().returning(|| Box::pin(async {}));
        Arc::new(VoiceCoordinator::new(
            Arc::new(capture),
            Arc::new(synthesis),
            VoiceConfig::default(),
        ))
    }

    fn test_store() -> Arc<MockCallStore> {
        let mut store = MockCallStore::new();
        store.expect_save().returning(|_| Box::pin(async { Ok(()) }));
        store
            .expect_load()
            .returning(|| Box::pin(async { Ok(HashMap::new()) }));
        store.expect_clear().returning(|| Box::pin(async { Ok(()) }));
        Arc::new(store)
    }

    /// Provider double that answers turn prompts and summary prompts
    /// differently, like the real provider would.
    fn scripted_provider() -> MockGenerationProvider {
        let mut provider = MockGenerationProvider::new();
        provider.expect_generate().returning(|prompt| {
            let is_summary = prompt.starts_with("Summarize");
            Box::pin(async move {
                if is_summary {
                    Ok("{\"summary\": \"qualified lead\", \"leadQuality\": \"hot\"}".to_string())
                } else {
                    Ok("Fifty employees is a great fit for our Professional plan.".to_string())
                }
            })
        });
        provider
    }

    fn orchestrator(provider: MockGenerationProvider, store: Arc<dyn CallStore>) -> CallOrchestrator {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(0)));
        let generator = Arc::new(ConversationGenerator::new(limiter, Arc::new(provider)));
        CallOrchestrator::new(generator, test_voice(), store)
    }

    #[tokio::test]
    async fn full_call_lifecycle() {
        let orchestrator = orchestrator(scripted_provider(), test_store());

        // Start: one assistant greeting, call active.
        let call_id = orchestrator.start_call().await.unwrap();
        let call = orchestrator.call(&call_id).unwrap();
        assert_eq!(call.status, CallStatus::Active);
        assert_eq!(call.messages.len(), 1);
        assert_eq!(call.messages[0].role, Role::Assistant);
        assert_eq!(
            call.messages[0].agent_name.as_deref(),
            Some(call.assistant_name.as_str())
        );

        // One turn: user message plus assistant reply.
        let reply = orchestrator.send_message("I have 50 employees", false).await.unwrap();
        assert!(reply.contains("Professional plan"));
        let call = orchestrator.call(&call_id).unwrap();
        assert_eq!(call.status, CallStatus::Active);
        assert_eq!(call.messages.len(), 3);
        assert_eq!(call.messages[1].role, Role::User);
        assert_eq!(call.messages[2].role, Role::Assistant);

        // End: completed with a summary, transcript unchanged.
        orchestrator.end_call(&call_id).await.unwrap();
        let call = orchestrator.call(&call_id).unwrap();
        assert_eq!(call.status, CallStatus::Completed);
        assert!(call.end_time.is_some());
        assert!(call.summary.as_deref().unwrap().contains("qualified lead"));
        assert_eq!(call.messages.len(), 3);
        assert!(orchestrator.active_call_id().is_none());
    }

    #[tokio::test]
    async fn send_message_without_active_call_fails() {
        let orchestrator = orchestrator(scripted_provider(), test_store());
        let err = orchestrator.send_message("hello?", false).await.unwrap_err();
        assert!(matches!(err, CallError::NoActiveCall));
        assert!(orchestrator.last_error().unwrap().contains("no active call"));
    }

    #[tokio::test]
    async fn empty_completion_keeps_user_message_and_call_active() {
        let mut provider = MockGenerationProvider::new();
        provider
            .expect_generate()
            .returning(|_| Box::pin(async { Ok(String::new()) }));
        let orchestrator = orchestrator(provider, test_store());

        let call_id = orchestrator.start_call().await.unwrap();
        let err = orchestrator.send_message("anyone there?", false).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::Generation(GenerationError::EmptyCompletion)
        ));

        let call = orchestrator.call(&call_id).unwrap();
        assert_eq!(call.status, CallStatus::Active);
        assert_eq!(call.messages.len(), 2, "user message must survive the failed turn");
        assert_eq!(call.messages[1].content, "anyone there?");
        assert!(orchestrator.last_error().is_some());
        orchestrator.clear_error();
        assert!(orchestrator.last_error().is_none());
    }

    #[tokio::test]
    async fn failed_summary_still_forces_terminal_state() {
        let mut provider = MockGenerationProvider::new();
        provider.expect_generate().returning(|prompt| {
            let is_summary = prompt.starts_with("Summarize");
            Box::pin(async move {
                if is_summary {
                    Err(ProviderError::Provider("summary backend down".into()))
                } else {
                    Ok("A reply.".to_string())
                }
            })
        });
        let orchestrator = orchestrator(provider, test_store());

        let call_id = orchestrator.start_call().await.unwrap();
        let err = orchestrator.end_call(&call_id).await.unwrap_err();
        assert!(matches!(err, CallError::Generation(_)));

        let call = orchestrator.call(&call_id).unwrap();
        assert_eq!(call.status, CallStatus::Failed);
        assert!(call.end_time.is_some());
        assert!(call.summary.is_none());
        assert!(orchestrator.active_call_id().is_none());
    }

    #[tokio::test]
    async fn ending_a_terminal_call_changes_nothing() {
        let orchestrator = orchestrator(scripted_provider(), test_store());
        let call_id = orchestrator.start_call().await.unwrap();
        orchestrator.end_call(&call_id).await.unwrap();

        let before = orchestrator.call(&call_id).unwrap();
        orchestrator.end_call(&call_id).await.unwrap();
        let after = orchestrator.call(&call_id).unwrap();
        assert_eq!(after.end_time, before.end_time);
        assert_eq!(after.status, before.status);
    }

    #[tokio::test]
    async fn ending_an_unknown_call_fails() {
        let orchestrator = orchestrator(scripted_provider(), test_store());
        let err = orchestrator.end_call("no-such-call").await.unwrap_err();
        assert!(matches!(err, CallError::CallNotFound(_)));
    }

    #[tokio::test]
    async fn sending_after_end_requires_a_new_call() {
        let orchestrator = orchestrator(scripted_provider(), test_store());
        let call_id = orchestrator.start_call().await.unwrap();
        orchestrator.end_call(&call_id).await.unwrap();

        let err = orchestrator.send_message("still there?", false).await.unwrap_err();
        assert!(matches!(err, CallError::NoActiveCall));
    }

    #[tokio::test]
    async fn failed_initial_persist_discards_the_call() {
        let mut store = MockCallStore::new();
        store.expect_save().returning(|_| {
            Box::pin(async {
                Err(StoreError::Io(std::io::Error::other("disk on fire")))
            })
        });
        let orchestrator = orchestrator(scripted_provider(), Arc::new(store));

        let err = orchestrator.start_call().await.unwrap_err();
        assert!(matches!(err, CallError::StartFailed(_)));
        assert!(orchestrator.active_call_id().is_none());
        assert!(orchestrator.calls.lock().is_empty(), "no dangling active call");
    }

    #[tokio::test]
    async fn call_records_survive_a_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("calls.json");

        let first =
            orchestrator(scripted_provider(), Arc::new(JsonFileStore::new(path.clone())));
        let call_id = first.start_call().await.unwrap();
        first.send_message("I have 50 employees", false).await.unwrap();
        first.end_call(&call_id).await.unwrap();

        // A fresh orchestrator over the same file sees the finished call.
        let restarted = orchestrator(scripted_provider(), Arc::new(JsonFileStore::new(path)));
        restarted.load_calls().await.unwrap();
        let call = restarted.call(&call_id).unwrap();
        assert_eq!(call.status, CallStatus::Completed);
        assert_eq!(call.messages.len(), 3);
    }
}
