//! Scripted LLM 客户端（用于测试，无需 API）
//!
//! 按「标记子串」路由：最后一条消息包含某个标记时，弹出该路由队列中的下一条回复；
//! 队列只剩最后一条时保持不弹出，便于脚本化「一直返回同样结果」。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;

struct Route {
    marker: String,
    replies: VecDeque<Result<String, LlmError>>,
}

/// 已记录的一次调用
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub images: usize,
    pub turns: usize,
    /// 最后一条之前的消息携带的图片数
    pub earlier_images: usize,
}

/// 脚本化客户端：按标记路由回复，并记录每次调用
#[derive(Default)]
pub struct ScriptedLlmClient {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为包含 marker 的 prompt 注册一组成功回复
    pub fn on(self, marker: &str, replies: &[&str]) -> Self {
        self.on_results(marker, replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    /// 为包含 marker 的 prompt 注册一组结果（可包含错误）
    pub fn on_results(self, marker: &str, replies: Vec<Result<String, LlmError>>) -> Self {
        if let Ok(mut routes) = self.routes.lock() {
            routes.push(Route {
                marker: marker.to_string(),
                replies: replies.into(),
            });
        }
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// prompt 中包含 marker 的调用次数
    pub fn count(&self, marker: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.prompt.contains(marker))
            .count()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let last = messages.last().cloned().unwrap_or_else(|| Message::user(""));
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                prompt: last.content.clone(),
                images: last.images.len(),
                turns: messages.len(),
                earlier_images: messages
                    .iter()
                    .rev()
                    .skip(1)
                    .map(|m| m.images.len())
                    .sum(),
            });
        }

        let mut routes = self
            .routes
            .lock()
            .map_err(|_| LlmError::InvalidResponse("script lock poisoned".into()))?;
        let route = routes
            .iter_mut()
            .find(|r| last.content.contains(&r.marker))
            .ok_or_else(|| LlmError::InvalidResponse("no scripted reply for prompt".into()))?;
        let reply = if route.replies.len() > 1 {
            route.replies.pop_front()
        } else {
            route.replies.front().cloned()
        };
        reply.unwrap_or(Err(LlmError::EmptyResponse))
    }
}
