//! Turns a transcript into the next agent utterance.
//!
//! All provider traffic goes through the shared rate limiter. The only
//! retried failure is a rate-limit rejection, with linearly increasing
//! backoff; anything else propagates to the orchestrator untouched.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use uuid::Uuid;

use crate::call::{KnowledgeBase, Message, Role};
use crate::limiter::{RateLimiter, SchedulerClosed};
use crate::provider::{GenerationProvider, ProviderError};

/// Identity pool the greeting draws from.
const AGENT_NAMES: [&str; 10] = [
    "Sarah", "Emma", "Lisa", "Anna", "Rachel", "Jessica", "Emily", "Sophie", "Olivia", "Grace",
];

const DEFAULT_KNOWLEDGE_BASE_ID: &str = "default";

fn default_knowledge_base() -> KnowledgeBase {
    KnowledgeBase {
        id: DEFAULT_KNOWLEDGE_BASE_ID.to_string(),
        name: "DialAI Sales".to_string(),
        description: "Default sales pitch for DialAI service".to_string(),
        content: "\
Product: DialAI - AI-powered Sales Calling Solution

Key Features & Benefits:
- 24/7 automated cold calling with human-like conversation
- Real-time analytics and insights
- 3x faster lead qualification
- 60% cost reduction vs human agents
- Instant scalability

Pricing:
- Starter: $499/month (1000 calls)
- Professional: $999/month (5000 calls)
- Enterprise: Custom pricing

Qualification Criteria:
- Company size: 10+ employees
- Current sales team: Yes
- Monthly call volume: 500+
- Pain points: Scaling sales, cost, consistency

Required Customer Info:
- Full Name
- Company Name
- Email
- Phone
- Current Call Volume"
            .to_string(),
        prompt: "\
You are an AI sales agent. Be direct, professional, and efficient.

Key Behaviors:
1. Keep responses under 2 sentences unless explaining pricing/features
2. Get to the point quickly - minimize small talk
3. Qualify leads early using criteria from knowledge base
4. For interested prospects, collect all required customer info
5. End call if:
   - Customer is clearly not qualified
   - Customer shows no interest after 2-3 exchanges
   - You've collected all info for a successful sale
   - Call exceeds 5 minutes

Response Guidelines:
- Start with brief greeting and company intro
- Focus on benefits over features
- Use numbers and specifics when discussing ROI
- Collect customer info naturally in conversation
- End call professionally with clear next steps

Personality:
- Professional and direct
- Solution-focused
- Time-conscious
- Confident but not pushy"
            .to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// The provider answered but with no usable text. Not retried.
    #[error("generation provider returned no usable text")]
    EmptyCompletion,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerClosed),
}

/// Bounded retries on rate-limit rejections, sleeping `attempt * base_delay`
/// between tries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// A call opener: the spoken text and the identity that will carry the call.
#[derive(Debug, Clone)]
pub struct Greeting {
    pub text: String,
    pub agent_name: String,
}

pub struct ConversationGenerator {
    limiter: Arc<RateLimiter>,
    provider: Arc<dyn GenerationProvider>,
    retry: RetryPolicy,
    knowledge: Mutex<Vec<KnowledgeBase>>,
}

impl ConversationGenerator {
    pub fn new(limiter: Arc<RateLimiter>, provider: Arc<dyn GenerationProvider>) -> Self {
        Self {
            limiter,
            provider,
            retry: RetryPolicy::default(),
            knowledge: Mutex::new(vec![default_knowledge_base()]),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Deterministic templated opener; no provider call involved.
    pub fn open_greeting(&self) -> Greeting {
        let agent_name = AGENT_NAMES
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("Sarah")
            .to_string();
        let text = format!(
            "Hello! This is {agent_name} from DialAI. I'm an AI assistant, and I'd love to \
             tell you about our innovative sales calling solution. How are you today?"
        );
        Greeting { text, agent_name }
    }

    /// Produces the agent's next line for the given transcript.
    pub async fn next_utterance(
        &self,
        messages: &[Message],
        knowledge_base_id: Option<&str>,
    ) -> Result<String, GenerationError> {
        let kb = self.knowledge_base_or_default(knowledge_base_id);
        let agent_name = messages
            .iter()
            .find_map(|m| m.agent_name.clone())
            .unwrap_or_else(|| "Sarah".to_string());

        let history = render_history(messages, &agent_name);
        let prompt = format!(
            "{prompt}\n\nYou are {agent_name}, an AI sales agent.\n\nKnowledge Base:\n{content}\n\n\
             Conversation History:\n{history}\n\n{agent_name}:",
            prompt = kb.prompt,
            content = kb.content,
        );

        let text = self.call_provider(prompt).await?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(GenerationError::EmptyCompletion);
        }
        Ok(text)
    }

    /// Structured synopsis of a finished call. The raw provider output is
    /// returned verbatim; the orchestrator stores it without parsing.
    pub async fn summarize(&self, messages: &[Message]) -> Result<String, GenerationError> {
        let history = render_history(messages, "Assistant");
        let prompt = format!(
            "Summarize the following conversation and extract key information.\n\n\
             Conversation:\n{history}\n\n\
             Provide summary in JSON format:\n\
             {{\n\
               \"summary\": \"brief summary\",\n\
               \"keyPoints\": [\"point1\", \"point2\", ...],\n\
               \"nextSteps\": \"recommended next steps\",\n\
               \"leadQuality\": \"hot|warm|cold\",\n\
               \"customerInfo\": {{\n\
                 \"name\": \"if mentioned\",\n\
                 \"company\": \"if mentioned\",\n\
                 \"email\": \"if mentioned\",\n\
                 \"phone\": \"if mentioned\"\n\
               }}\n\
             }}"
        );

        let text = self.call_provider(prompt).await?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(GenerationError::EmptyCompletion);
        }
        Ok(text)
    }

    /// Sentiment classification for a single utterance, as raw provider
    /// JSON. Offered to presentation layers; no call flow depends on it.
    pub async fn analyze_sentiment(&self, text: &str) -> Result<String, GenerationError> {
        let prompt = format!(
            "Analyze the sentiment of the following text and provide a brief explanation.\n\
             Text: \"{text}\"\n\n\
             Respond in JSON format:\n\
             {{\n\
               \"sentiment\": \"positive|negative|neutral\",\n\
               \"explanation\": \"brief explanation\"\n\
             }}"
        );
        let result = self.call_provider(prompt).await?;
        let result = result.trim().to_string();
        if result.is_empty() {
            return Err(GenerationError::EmptyCompletion);
        }
        Ok(result)
    }

    pub fn knowledge_bases(&self) -> Vec<KnowledgeBase> {
        self.knowledge.lock().clone()
    }

    /// Registers a knowledge base and returns it with its assigned id.
    pub fn add_knowledge_base(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
        prompt: impl Into<String>,
    ) -> KnowledgeBase {
        let kb = KnowledgeBase {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            content: content.into(),
            prompt: prompt.into(),
        };
        self.knowledge.lock().push(kb.clone());
        kb
    }

    /// Replaces an existing knowledge base in place. Edits take effect on
    /// the next turn that selects it; returns false for unknown ids.
    pub fn update_knowledge_base(&self, kb: KnowledgeBase) -> bool {
        let mut knowledge = self.knowledge.lock();
        match knowledge.iter_mut().find(|k| k.id == kb.id) {
            Some(slot) => {
                *slot = kb;
                true
            }
            None => false,
        }
    }

    /// Unknown or absent ids fall back to the default knowledge base.
    fn knowledge_base_or_default(&self, id: Option<&str>) -> KnowledgeBase {
        let knowledge = self.knowledge.lock();
        id.and_then(|id| knowledge.iter().find(|kb| kb.id == id).cloned())
            .unwrap_or_else(|| knowledge[0].clone())
    }

    /// One limiter-serialized provider call with the retry policy applied.
    async fn call_provider(&self, prompt: String) -> Result<String, GenerationError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let provider = self.provider.clone();
            let prompt = prompt.clone();
            let result = self
                .limiter
                .submit(move || async move { provider.generate(&prompt).await })
                .await?;
            match result {
                Ok(text) => return Ok(text),
                Err(ProviderError::RateLimited) if attempt < self.retry.attempts => {
                    let backoff = self.retry.base_delay * attempt;
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "provider rate limited; backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Transcript as alternating `Customer:` / `{agent}:` lines.
fn render_history(messages: &[Message], agent_name: &str) -> String {
    messages
        .iter()
        .map(|m| match m.role {
            Role::Assistant => format!("{agent_name}: {}", m.content),
            Role::User => format!("Customer: {}", m.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
