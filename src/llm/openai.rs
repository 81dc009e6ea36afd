//! OpenAI 兼容视觉模型客户端
//!
//! 直接通过 reqwest 调用 `{base_url}/chat/completions`：文本 + `image_url` 片段（data URL）。
//! 传输层错误按 DNS / 超时 / IO 分类，交给 RetryingLlmClient 决定是否重试。

use std::error::Error as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::LlmSection;
use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 HTTP client、端点、模型名与采样参数
pub struct OpenAiVisionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiVisionClient {
    pub fn new(cfg: &LlmSection, api_key: &str) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(cfg.timeouts.connect))
            .timeout(Duration::from_secs(cfg.timeouts.request))
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url: normalize_base_url(&cfg.base_url),
            api_key: api_key.to_string(),
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            usage: TokenUsage::new(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// 拉取端点可用的模型 ID 列表
    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let response = self
            .http
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(classify_transport_error)?;
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let json: Value =
            serde_json::from_str(&body).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Ok(json["data"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item["id"].as_str())
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn request_body(&self, messages: &[Message]) -> Value {
        let messages: Vec<Value> = messages.iter().map(to_api_message).collect();
        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        })
    }
}

/// 去掉末尾的 `/` 与误填的 `/chat/completions`
fn normalize_base_url(url: &str) -> String {
    url.trim()
        .trim_end_matches('/')
        .trim_end_matches("/chat/completions")
        .trim_end_matches('/')
        .to_string()
}

fn to_api_message(m: &Message) -> Value {
    if m.images.is_empty() {
        return json!({ "role": m.role.as_str(), "content": m.content });
    }
    let mut parts = vec![json!({ "type": "text", "text": m.content })];
    parts.extend(
        m.images
            .iter()
            .map(|url| json!({ "type": "image_url", "image_url": { "url": url } })),
    );
    json!({ "role": m.role.as_str(), "content": parts })
}

/// reqwest 错误 -> LlmError：超时、DNS、连接/IO 为瞬时错误
fn classify_transport_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        return LlmError::Timeout(e.to_string());
    }
    let mut chain = String::new();
    let mut source = e.source();
    while let Some(s) = source {
        chain.push_str(&s.to_string().to_lowercase());
        chain.push(' ');
        source = s.source();
    }
    if chain.contains("dns") || chain.contains("lookup") || chain.contains("resolve") {
        return LlmError::Dns(e.to_string());
    }
    if e.is_connect() || e.is_request() || e.is_body() {
        return LlmError::Io(e.to_string());
    }
    if e.is_decode() {
        return LlmError::InvalidResponse(e.to_string());
    }
    LlmError::Request(e.to_string())
}

#[async_trait]
impl LlmClient for OpenAiVisionClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let image_count: usize = messages.iter().map(|m| m.images.len()).sum();
        tracing::debug!(model = %self.model, messages = messages.len(), images = image_count, "chat completion request");

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(messages))
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_transport_error)?;
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let json: Value =
            serde_json::from_str(&body).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        if let Some(usage) = json.get("usage") {
            self.usage.add(
                usage["prompt_tokens"].as_u64().unwrap_or(0),
                usage["completion_tokens"].as_u64().unwrap_or(0),
            );
        }

        json["choices"]
            .as_array()
            .and_then(|choices| choices.first())
            .and_then(|choice| choice["message"]["content"].as_str())
            .map(str::to_string)
            .ok_or(LlmError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("https://api.example.com/v1/chat/completions/"),
            "https://api.example.com/v1"
        );
        assert_eq!(
            normalize_base_url(" https://api.example.com/v1/ "),
            "https://api.example.com/v1"
        );
    }

    #[test]
    fn test_text_only_message_uses_plain_content() {
        let v = to_api_message(&Message::system("be precise"));
        assert_eq!(v["role"], "system");
        assert_eq!(v["content"], "be precise");
    }

    #[test]
    fn test_image_message_uses_content_parts() {
        let v = to_api_message(
            &Message::user("what is on screen?")
                .with_images(vec!["data:image/jpeg;base64,AAA".into(), "data:image/jpeg;base64,BBB".into()]),
        );
        let parts = v["content"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[2]["image_url"]["url"], "data:image/jpeg;base64,BBB");
    }

    #[test]
    fn test_request_body_carries_sampling_params() {
        let client = OpenAiVisionClient::new(&LlmSection::default(), "sk-test").unwrap();
        let body = client.request_body(&[Message::user("hi")]);
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["model"], client.model());
    }
}
