//! 状态定义：运行阶段、对外发布的快照、单步执行记录与最终结果
//!
//! 信息池只在编排器任务内可变；外部观察者（终端、界面）只拿到 RunSnapshot 这种不可变投影。

use serde::{Deserialize, Serialize};

use crate::core::info_pool::{InfoPool, Outcome};

/// 步进状态机的阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Planning,
    Acting,
    SafetyGate,
    Executing,
    Reflecting,
    Noting,
    Completed,
    Failed,
    Stopped,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed | RunPhase::Stopped)
    }
}

/// 运行的终止状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn phase(&self) -> RunPhase {
        match self {
            RunStatus::Completed => RunPhase::Completed,
            RunStatus::Failed => RunPhase::Failed,
            RunStatus::Stopped => RunPhase::Stopped,
        }
    }
}

/// 已完成的一步（历史四元组 + 思考），用于快照、结果与执行记录
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// 从 1 开始
    pub step: usize,
    pub thought: String,
    pub action: String,
    pub description: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ExecutionStep {
    pub fn succeeded(&self) -> bool {
        Outcome::parse(&self.outcome).map_or(false, |o| o.is_success())
    }
}

/// 从信息池的对齐历史构造步骤列表
pub fn steps_from_pool(pool: &InfoPool) -> Vec<ExecutionStep> {
    pool.action_history()
        .iter()
        .zip(pool.thought_history())
        .zip(pool.summary_history())
        .zip(pool.action_outcomes())
        .zip(pool.error_descriptions())
        .enumerate()
        .map(
            |(i, ((((action, thought), summary), outcome), error))| ExecutionStep {
                step: i + 1,
                thought: thought.clone(),
                action: action.to_string(),
                description: summary.clone(),
                outcome: outcome.to_string(),
                error: error.clone(),
            },
        )
        .collect()
}

/// 每次阶段变化与每步结束后发布的只读快照
#[derive(Clone, Debug, Serialize)]
pub struct RunSnapshot {
    pub phase: RunPhase,
    pub instruction: String,
    /// 当前步（从 1 开始；规划前为 0）
    pub step: usize,
    pub max_steps: usize,
    pub plan: String,
    pub subgoal: String,
    pub progress: String,
    pub notes: String,
    pub steps: Vec<ExecutionStep>,
}

impl Default for RunSnapshot {
    fn default() -> Self {
        Self {
            phase: RunPhase::Idle,
            instruction: String::new(),
            step: 0,
            max_steps: 0,
            plan: String::new(),
            subgoal: String::new(),
            progress: String::new(),
            notes: String::new(),
            steps: Vec::new(),
        }
    }
}

impl RunSnapshot {
    pub fn capture(pool: &InfoPool, phase: RunPhase, step: usize, max_steps: usize) -> Self {
        Self {
            phase,
            instruction: pool.instruction().to_string(),
            step,
            max_steps,
            plan: pool.plan.clone(),
            subgoal: pool.current_subgoal(),
            progress: pool.progress_status.clone(),
            notes: pool.important_notes.clone(),
            steps: steps_from_pool(pool),
        }
    }
}

/// 一次运行的最终结果，交给调用方持久化
#[derive(Clone, Debug, Serialize)]
pub struct RunResult {
    pub success: bool,
    pub status: RunStatus,
    /// 人类可读的终止原因或答案
    pub message: String,
    pub steps: Vec<ExecutionStep>,
    pub logs: Vec<String>,
    pub plan: String,
    pub notes: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionKind};
    use crate::core::info_pool::{StepAction, StepRecord};

    #[test]
    fn test_snapshot_reflects_pool() {
        let mut pool = InfoPool::new("check battery");
        pool.set_plan("1. Open Settings\n2. Open Battery");
        pool.record_step(StepRecord {
            action: StepAction::Parsed(Action::new(ActionKind::OpenApp {
                target: "settings".into(),
            })),
            thought: "start from settings".into(),
            summary: "open settings".into(),
            outcome: Outcome::A,
            error: String::new(),
        });
        let snap = RunSnapshot::capture(&pool, RunPhase::Noting, 1, 10);
        assert_eq!(snap.steps.len(), 1);
        assert_eq!(snap.steps[0].step, 1);
        assert!(snap.steps[0].succeeded());
        assert!(snap.steps[0].action.contains("open_app"));
        assert_eq!(snap.subgoal, "1. Open Settings\n2. Open Battery");
        assert!(!snap.phase.is_terminal());
    }

    #[test]
    fn test_phase_serializes_snake_case() {
        let json = serde_json::to_string(&RunPhase::SafetyGate).unwrap();
        assert_eq!(json, "\"safety_gate\"");
        assert!(RunStatus::Stopped.phase().is_terminal());
    }
}
