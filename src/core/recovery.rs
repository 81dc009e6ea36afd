//! 错误恢复引擎
//!
//! 根据 AgentError 返回 RecoveryAction：除取消外，所有单步错误都记为 B 类失败步骤并写入历史，
//! 让后续 prompt 看到失败原因，而不是中断整个运行。

use crate::core::info_pool::Outcome;
use crate::core::{AgentError, RecoveryAction};

/// 错误描述写入历史前的最大字符数
const MAX_DESCRIPTION_CHARS: usize = 200;

#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        let description = match err {
            AgentError::Cancelled => return RecoveryAction::Stop,
            AgentError::Llm(e) => format!("inference failed: {}", e),
            AgentError::Device(e) => format!("device command failed: {}", e),
            AgentError::ActionParse(raw) if raw.trim().is_empty() => {
                "could not parse action: empty action section".to_string()
            }
            AgentError::ActionParse(raw) => format!("could not parse action: {}", raw.trim()),
            AgentError::InvalidAction(msg) => format!("invalid action: {}", msg),
            AgentError::InteractionUnavailable(msg) => {
                format!("user interaction unavailable: {}", msg)
            }
            AgentError::Config(msg) => format!("configuration error: {}", msg),
        };
        RecoveryAction::RecordFailure {
            outcome: Outcome::B,
            description: truncate(&description, MAX_DESCRIPTION_CHARS),
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use crate::llm::LlmError;

    fn failure(err: AgentError) -> (Outcome, String) {
        match RecoveryEngine::new().handle(&err) {
            RecoveryAction::RecordFailure {
                outcome,
                description,
            } => (outcome, description),
            RecoveryAction::Stop => panic!("Expected RecordFailure"),
        }
    }

    #[test]
    fn test_recovery_parse_error() {
        let (outcome, desc) = failure(AgentError::ActionParse("{\"action\": \"fly\"}".into()));
        assert_eq!(outcome, Outcome::B);
        assert!(desc.starts_with("could not parse action"));
        assert!(desc.contains("fly"));
    }

    #[test]
    fn test_recovery_inference_and_device_errors() {
        let (_, desc) = failure(AgentError::Llm(LlmError::Timeout("90s".into())));
        assert!(desc.contains("inference failed"));
        let (_, desc) = failure(AgentError::Device(DeviceError::ChannelUnavailable(
            "binder died".into(),
        )));
        assert!(desc.contains("binder died"));
    }

    #[test]
    fn test_recovery_cancelled() {
        assert_eq!(
            RecoveryEngine::new().handle(&AgentError::Cancelled),
            RecoveryAction::Stop
        );
    }

    #[test]
    fn test_long_descriptions_are_truncated() {
        let (_, desc) = failure(AgentError::ActionParse("x".repeat(1000)));
        assert!(desc.chars().count() <= MAX_DESCRIPTION_CHARS + 3);
        assert!(desc.ends_with("..."));
    }
}
