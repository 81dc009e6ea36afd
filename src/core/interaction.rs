//! 确认 / 接管交互通道
//!
//! 编排器通过 InteractionHandle 发出 UserRequest，并等待对方经 oneshot 回复；两种等待都可被停止请求打断。
//! 接收端（终端、悬浮窗等）只需消费 `mpsc::Receiver<UserRequest>`。

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

/// 发给人工操作面的请求
#[derive(Debug)]
pub enum UserRequest {
    /// 敏感操作确认：回复 true 表示允许执行
    Confirm {
        message: String,
        reply: oneshot::Sender<bool>,
    },
    /// 人工接管：用户完成后发送 resume
    TakeOver {
        message: String,
        resume: oneshot::Sender<()>,
    },
}

impl UserRequest {
    pub fn message(&self) -> &str {
        match self {
            UserRequest::Confirm { message, .. } | UserRequest::TakeOver { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InteractionHandle {
    tx: mpsc::Sender<UserRequest>,
}

/// 创建交互通道
pub fn interaction_channel(buffer: usize) -> (InteractionHandle, mpsc::Receiver<UserRequest>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (InteractionHandle { tx }, rx)
}

impl InteractionHandle {
    /// 请求确认；对方不在或直接丢弃请求时视为拒绝
    pub async fn request_confirmation(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, AgentError> {
        let (reply, answer) = oneshot::channel();
        let request = UserRequest::Confirm {
            message: message.to_string(),
            reply,
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            sent = self.tx.send(request) => {
                if sent.is_err() {
                    tracing::warn!("confirmation surface closed, treating as declined");
                    return Ok(false);
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            answer = answer => Ok(answer.unwrap_or(false)),
        }
    }

    /// 请求人工接管并等待恢复信号
    pub async fn request_take_over(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let (resume, resumed) = oneshot::channel();
        let request = UserRequest::TakeOver {
            message: message.to_string(),
            resume,
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            sent = self.tx.send(request) => {
                if sent.is_err() {
                    return Err(AgentError::InteractionUnavailable("take-over surface closed".into()));
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            resumed = resumed => resumed.map_err(|_| {
                AgentError::InteractionUnavailable("take-over request dropped without resume".into())
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_confirmation_round_trip() {
        let (handle, mut rx) = interaction_channel(1);
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                if let UserRequest::Confirm { message, reply } = req {
                    let _ = reply.send(message.contains("pay"));
                }
            }
        });
        let cancel = CancellationToken::new();
        assert!(handle.request_confirmation("pay ¥100", &cancel).await.unwrap());
        assert!(!handle.request_confirmation("delete", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_surface() {
        let (handle, rx) = interaction_channel(1);
        drop(rx);
        let cancel = CancellationToken::new();
        assert!(!handle.request_confirmation("pay", &cancel).await.unwrap());
        assert!(matches!(
            handle.request_take_over("login", &cancel).await,
            Err(AgentError::InteractionUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_waits_are_cancelable() {
        let (handle, mut rx) = interaction_channel(1);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            // 收到请求后不回复，只触发停止
            let _pending = rx.recv().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let result = handle.request_take_over("solve captcha", &cancel).await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
    }
}
