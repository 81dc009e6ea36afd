//! 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：单步内的错误被吸收进信息池历史（RecordFailure），只有取消会结束运行（Stop）。

use thiserror::Error;

use crate::core::info_pool::Outcome;
use crate::device::DeviceError;
use crate::llm::LlmError;

/// 单步执行中可能出现的错误（推理、设备、协议解析、交互面、取消）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// 模型输出无法解析为动作；携带原始动作文本
    #[error("could not parse action: {0}")]
    ActionParse(String),

    /// 动作可解析但不可执行（坐标越界、空文本等）
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    /// 确认 / 接管通道已关闭
    #[error("Interaction surface unavailable: {0}")]
    InteractionUnavailable(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

/// 恢复引擎根据错误类型给出的处理方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 记为失败步骤，循环继续
    RecordFailure { outcome: Outcome, description: String },
    /// 结束运行（用户停止）
    Stop,
}
