//! LLM 层：推理能力抽象与实现（OpenAI 兼容视觉模型 / Scripted Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{RecordedCall, ScriptedLlmClient};
pub use openai::{OpenAiVisionClient, TokenUsage};
pub use traits::{LlmClient, LlmError, RetryConfig, RetryingLlmClient};
