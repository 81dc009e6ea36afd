//! 推理能力抽象
//!
//! 所有后端（OpenAI 兼容视觉模型 / Scripted Mock）实现 LlmClient：complete（多轮）、infer（单轮 prompt + 图片）。
//! RetryingLlmClient 对瞬时失败（DNS / 超时 / IO）按「次数 × 基础间隔」线性退避重试，其它错误立即返回。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// 推理调用错误；只有 Dns / Timeout / Io 被视为瞬时错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("No response from model")]
    EmptyResponse,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request build failed: {0}")]
    Request(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Dns(_) | LlmError::Timeout(_) | LlmError::Io(_))
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 多轮完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 单轮推理：一条 user 消息，文本 + 零或多张图片（data URL）
    async fn infer(&self, prompt: &str, images: &[String]) -> Result<String, LlmError> {
        self.complete(&[Message::user(prompt).with_images(images.to_vec())])
            .await
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 重试策略：最多 max_attempts 次，第 n 次失败后等待 n × base_delay
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// 带重试的客户端包装
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.complete(messages).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    tracing::warn!(attempt, max_attempts, error = %e, "transient inference failure, retrying");
                    tokio::time::sleep(self.config.base_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyClient {
        calls: AtomicU32,
        failures: u32,
        error: LlmError,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(self.error.clone())
            } else {
                Ok("ok".to_string())
            }
        }
    }

    fn flaky(failures: u32, error: LlmError) -> Arc<FlakyClient> {
        Arc::new(FlakyClient {
            calls: AtomicU32::new(0),
            failures,
            error,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_with_linear_backoff() {
        let inner = flaky(2, LlmError::Timeout("slow".into()));
        let client = RetryingLlmClient::new(inner.clone(), RetryConfig::default());
        let started = tokio::time::Instant::now();
        let out = client.infer("hi", &[]).await;
        assert_eq!(out.unwrap(), "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        // 1s + 2s
        assert!(started.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let inner = flaky(10, LlmError::Dns("no host".into()));
        let client = RetryingLlmClient::new(inner.clone(), RetryConfig::default());
        let out = client.infer("hi", &[]).await;
        assert!(matches!(out, Err(LlmError::Dns(_))));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_api_errors() {
        let inner = flaky(
            1,
            LlmError::Api {
                status: 401,
                body: "bad key".into(),
            },
        );
        let client = RetryingLlmClient::new(inner.clone(), RetryConfig::default());
        assert!(client.infer("hi", &[]).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
