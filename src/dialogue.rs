//! DeepSeek chat client for assistant replies.
//! Connection pooling via reqwest, simple token-bucket rate limiting,
//! retry on 429/5xx/timeout, bounded conversation history.
//! Any failure degrades to a fixed fallback reply.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Produces the assistant's reply to one recognized utterance.
#[async_trait]
pub trait Dialogue: Send + Sync {
    /// Never fails; errors become a fallback reply.
    async fn reply(&self, user_text: &str) -> String;

    /// Forget the conversation so far.
    fn clear_history(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    pub base_url: String,
    pub model: String,
    /// Falls back to `DEEPSEEK_API_KEY` when empty.
    pub api_key: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Most recent messages sent along with each request.
    pub history_limit: usize,
    pub fallback_reply: String,
    pub timeout_secs: u64,
    pub min_interval_ms: u64,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".into(),
            model: "deepseek-chat".into(),
            api_key: String::new(),
            system_prompt: "你是一个友好的智能语音助手，请用简洁的口语回答。".into(),
            temperature: 0.7,
            max_tokens: 2048,
            history_limit: 20,
            fallback_reply: "对不起，我暂时无法回答你的问题。".into(),
            timeout_secs: 30,
            min_interval_ms: 100,
        }
    }
}

/// DeepSeek chat/completions client with conversation memory.
pub struct DialogueClient {
    http: reqwest::Client,
    config: DialogueConfig,
    history: Mutex<VecDeque<ChatMessage>>,
    /// Simple token-bucket: tracks the next allowed request time.
    next_allowed: Arc<tokio::sync::Mutex<Instant>>,
    min_interval: Duration,
}

impl DialogueClient {
    pub fn new(mut config: DialogueConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            config.api_key = std::env::var("DEEPSEEK_API_KEY").map_err(|_| {
                Error::Config("DEEPSEEK_API_KEY environment variable not set".into())
            })?;
        }

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            min_interval: Duration::from_millis(config.min_interval_ms),
            config,
            history: Mutex::new(VecDeque::new()),
            next_allowed: Arc::new(tokio::sync::Mutex::new(Instant::now())),
        })
    }

    /// Reply to `user_text`. Never fails: errors yield the fallback reply,
    /// which is not recorded in the history.
    pub async fn reply(&self, user_text: &str) -> String {
        let messages = self.build_messages(user_text);
        let start = Instant::now();
        match self.chat(&messages).await {
            Ok(reply) => {
                info!(
                    chars = reply.chars().count(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "dialogue reply received"
                );
                self.remember(ChatMessage::new(Role::User, user_text));
                self.remember(ChatMessage::new(Role::Assistant, reply.clone()));
                reply
            }
            Err(e) => {
                warn!(error = %e, class = e.class(), "dialogue request failed, using fallback");
                self.config.fallback_reply.clone()
            }
        }
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
        info!("dialogue history cleared");
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// System prompt, the bounded history, then the new user turn.
    fn build_messages(&self, user_text: &str) -> Vec<ChatMessage> {
        let history = self.history.lock();
        let mut messages = Vec::with_capacity(history.len() + 2);
        if !self.config.system_prompt.is_empty() {
            messages.push(ChatMessage::new(Role::System, self.config.system_prompt.clone()));
        }
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage::new(Role::User, user_text));
        messages
    }

    fn remember(&self, message: ChatMessage) {
        let mut history = self.history.lock();
        history.push_back(message);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        self.rate_limit_wait().await;

        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "stream": false,
            "temperature": self.config.temperature,
        });

        let response = self.send_with_retry(&body).await?;
        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Dialogue("empty completion".into()))
    }

    /// Wait until the rate limiter allows a request.
    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    /// Send request with retry logic.
    /// 429: Retry-After or 1s/2s/4s (max 3).
    /// 5xx: exponential backoff (max 2).
    /// Timeout: immediate retry once.
    async fn send_with_retry(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let mut attempt: u32 = 0;
        let max_429_retries: u32 = 3;
        let max_5xx_retries: u32 = 2;
        let mut timeout_retried = false;

        loop {
            let result = self
                .http
                .post(format!("{}/v1/chat/completions", self.config.base_url))
                .header("Authorization", format!("Bearer {}", self.config.api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp);
                }
                Ok(resp) if resp.status().as_u16() == 429 => {
                    if attempt >= max_429_retries {
                        return Err(Error::Dialogue("rate limited".into()));
                    }
                    let wait = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Duration::from_secs(1 << attempt));
                    warn!(attempt, wait_ms = wait.as_millis() as u64, "429 rate limited, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Ok(resp) if resp.status().is_server_error() => {
                    if attempt >= max_5xx_retries {
                        return Err(Error::Dialogue(format!("server error: {}", resp.status())));
                    }
                    let wait = Duration::from_millis(500 * (1 << attempt));
                    warn!(
                        attempt,
                        status = resp.status().as_u16(),
                        wait_ms = wait.as_millis() as u64,
                        "5xx error, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(Error::Dialogue(format!(
                        "unexpected status {}: {}",
                        status,
                        body_text.chars().take(200).collect::<String>()
                    )));
                }
                Err(e) if e.is_timeout() => {
                    if timeout_retried {
                        return Err(Error::Timeout(Duration::from_secs(self.config.timeout_secs)));
                    }
                    warn!("request timeout, retrying once");
                    timeout_retried = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl Dialogue for DialogueClient {
    async fn reply(&self, user_text: &str) -> String {
        DialogueClient::reply(self, user_text).await
    }

    fn clear_history(&self) {
        DialogueClient::clear_history(self)
    }
}

// --- Response types ---

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}
