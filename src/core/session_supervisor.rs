//! 会话监管：运行生命周期与停止请求
//!
//! 每次运行开始时换一个新的 CancellationToken；外部通过 StopHandle 在任意时刻请求停止，
//! 循环在阶段之间与两个人工等待点观察该 token。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct SessionSupervisor {
    current: Mutex<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始新一次运行：上一次运行遗留的停止请求不会带入
    pub fn begin_run(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            *current = token.clone();
        }
        token
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.current
            .lock()
            .map(|t| t.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// 请求停止当前运行
    pub fn cancel(&self) {
        self.cancel_token().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token().is_cancelled()
    }
}

/// 可克隆、可跨任务传递的停止句柄
#[derive(Debug, Clone)]
pub struct StopHandle {
    supervisor: Arc<SessionSupervisor>,
}

impl StopHandle {
    pub(crate) fn new(supervisor: Arc<SessionSupervisor>) -> Self {
        Self { supervisor }
    }

    pub fn stop(&self) {
        tracing::info!("stop requested");
        self.supervisor.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.supervisor.is_cancelled()
    }
}
