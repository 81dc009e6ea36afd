//! 运行过程事件：供终端 / 界面实时展示规划、动作、确认与结果

use serde::Serialize;

use crate::core::info_pool::Outcome;
use crate::core::state::RunStatus;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    RunStarted { instruction: String, max_steps: usize },
    /// 当前第几步
    StepStarted { step: usize, max_steps: usize },
    PlanUpdated { plan: String, subgoal: String },
    /// Executor 的决定
    ActionDecided {
        step: usize,
        thought: String,
        action: String,
        description: String,
    },
    /// 动作段无法解析
    ParseFailed { step: usize, raw: String },
    ConfirmationRequested { step: usize, message: String },
    ConfirmationResolved { step: usize, approved: bool },
    TakeOverRequested { step: usize, message: String },
    TakeOverResumed { step: usize },
    /// 一步写入历史
    StepRecorded {
        step: usize,
        outcome: Outcome,
        error: String,
    },
    NotesUpdated { notes: String },
    Log { message: String },
    Finished { status: RunStatus, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let json = serde_json::to_value(AgentEvent::StepRecorded {
            step: 2,
            outcome: Outcome::C,
            error: "user declined".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "step_recorded");
        assert_eq!(json["outcome"], "C");
    }
}
