//! Manager（规划者）：把指令拆成编号子目标；失败累积或子目标不可达时重新规划
//!
//! 计划以 "Finished" 开头表示指令已完成。重新规划时要求保留已完成步骤的原文，
//! 保证「当前子目标」的提取在多次规划之间保持稳定。

use std::sync::Arc;

use crate::agents::sections::extract_section;
use crate::core::info_pool::InfoPool;
use crate::core::AgentError;
use crate::device::Perception;
use crate::llm::{LlmClient, LlmError};

const THOUGHT: &str = "### Thought";
const PLAN: &str = "### Plan";

/// 重新规划时展示的历史条数
const REPLAN_HISTORY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOutput {
    pub thought: String,
    pub plan: String,
}

impl ManagerOutput {
    /// 计划以 "Finished" 开头（不区分大小写）
    pub fn is_finished(&self) -> bool {
        self.plan
            .trim_start()
            .get(..8)
            .map_or(false, |head| head.eq_ignore_ascii_case("finished"))
    }

    /// "Finished" 之后的补充说明
    pub fn finish_message(&self) -> Option<String> {
        if !self.is_finished() {
            return None;
        }
        let rest = self.plan.trim_start()[8..]
            .trim_start_matches(|c: char| c == '.' || c == ':' || c == '!' || c.is_whitespace())
            .trim();
        Some(rest.to_string())
    }
}

fn push_common_context(p: &mut String, pool: &InfoPool, perception: Perception) {
    p.push_str("### User Request ###\n");
    p.push_str(pool.instruction());
    p.push_str("\n\n");
    if !pool.additional_knowledge.trim().is_empty() {
        p.push_str("### Additional Knowledge ###\n");
        p.push_str(pool.additional_knowledge.trim());
        p.push_str("\n\n");
    }
    if !pool.skill_context.trim().is_empty() {
        p.push_str("### Relevant Skills ###\n");
        p.push_str(pool.skill_context.trim());
        p.push_str("\n\n");
    }
    if let Some(note) = perception.note() {
        p.push_str("### Screen ###\n");
        p.push_str(note);
        p.push_str("\n\n");
    }
}

const OUTPUT_FORMAT: &str = "\
Provide your output in the following format:

### Thought ###
A detailed explanation of your rationale for the plan.

### Plan ###
1. first subgoal
2. second subgoal
...
If the request has already been fully completed, write \"Finished\" followed by a short summary of the result instead of a numbered list.";

/// 首次规划
pub fn build_initial_prompt(pool: &InfoPool, perception: Perception) -> String {
    let mut p = String::new();
    p.push_str("You are an agent who can operate an Android phone on behalf of a user. ");
    p.push_str("Your goal is to track progress and devise high-level plans to achieve the user's requests.\n\n");
    push_common_context(&mut p, pool, perception);
    p.push_str("---\n");
    p.push_str("Think step by step and make a high-level plan to achieve the user's request. ");
    p.push_str("If the request is complicated, break it down into subgoals. ");
    p.push_str("The screenshot displays the starting state of the phone.\n\n");
    p.push_str(OUTPUT_FORMAT);
    p.push('\n');
    p
}

/// 重新规划：附带历史、进度、笔记与失败信号
pub fn build_replan_prompt(pool: &InfoPool, perception: Perception) -> String {
    let mut p = String::new();
    p.push_str("You are an agent who can operate an Android phone on behalf of a user. ");
    p.push_str("Your goal is to track progress and devise high-level plans to achieve the user's requests.\n\n");
    push_common_context(&mut p, pool, perception);

    p.push_str("### Previous Plan ###\n");
    p.push_str(&pool.plan);
    p.push_str("\n\n");
    p.push_str("### Last Subgoal ###\n");
    p.push_str(&pool.current_subgoal());
    p.push_str("\n\n");
    p.push_str("### Progress Status ###\n");
    if pool.progress_status.is_empty() {
        p.push_str("No progress yet.");
    } else {
        p.push_str(&pool.progress_status);
    }
    p.push_str("\n\n");
    if !pool.important_notes.is_empty() {
        p.push_str("### Important Notes ###\n");
        p.push_str(&pool.important_notes);
        p.push_str("\n\n");
    }

    p.push_str("### Recent Action History ###\n");
    let recent = pool.recent_history(REPLAN_HISTORY);
    if recent.is_empty() {
        p.push_str("No actions have been taken yet.\n");
    }
    for entry in recent {
        p.push_str(&format!(
            "- Action: {} | Description: {} | Outcome: {}",
            entry.action, entry.summary, entry.outcome
        ));
        if !entry.error.is_empty() {
            p.push_str(&format!(" | Error: {}", entry.error));
        }
        p.push('\n');
    }
    p.push('\n');

    if pool.needs_replan() {
        p.push_str("### Potentially Stuck! ###\n");
        p.push_str(&format!(
            "The recent actions failed or the last subgoal was judged unreachable (threshold: {} consecutive failures). ",
            pool.err_to_manager_thresh()
        ));
        p.push_str("Revise the plan: consider a different path, dismiss blocking dialogs, or request a take_over if human help is needed.\n\n");
    }

    p.push_str("---\n");
    p.push_str("Assess the current status from the screenshot and the history, then update the plan. ");
    p.push_str("Keep the wording of steps that are already completed unchanged and only revise the remaining steps.\n\n");
    p.push_str(OUTPUT_FORMAT);
    p.push('\n');
    p
}

pub fn parse_response(text: &str) -> ManagerOutput {
    let thought = extract_section(text, THOUGHT, &[PLAN]);
    let plan = extract_section(text, PLAN, &[THOUGHT]);
    ManagerOutput { thought, plan }
}

pub struct Manager {
    llm: Arc<dyn LlmClient>,
}

impl Manager {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 规划或重新规划；计划段为空视为无效回复
    pub async fn plan(
        &self,
        pool: &InfoPool,
        screenshot: Option<&str>,
        perception: Perception,
    ) -> Result<ManagerOutput, AgentError> {
        let prompt = if pool.plan.is_empty() {
            build_initial_prompt(pool, perception)
        } else {
            build_replan_prompt(pool, perception)
        };
        let images: Vec<String> = screenshot.map(|s| vec![s.to_string()]).unwrap_or_default();
        let reply = self.llm.infer(&prompt, &images).await?;
        let output = parse_response(&reply);
        if output.plan.is_empty() {
            return Err(LlmError::InvalidResponse("manager reply has no plan".into()).into());
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionKind};
    use crate::core::info_pool::{Outcome, StepAction, StepRecord};

    #[test]
    fn test_parse_plan() {
        let out = parse_response(
            "### Thought ###\nNeed settings.\n### Plan ###\n1. Open Settings\n2. Open Wi-Fi\n3. Answer",
        );
        assert_eq!(out.thought, "Need settings.");
        assert_eq!(out.plan, "1. Open Settings\n2. Open Wi-Fi\n3. Answer");
        assert!(!out.is_finished());
    }

    #[test]
    fn test_finished_detection() {
        let out = parse_response("### Thought ###\ndone\n### Plan ###\nFinished. The network is HomeNet.");
        assert!(out.is_finished());
        assert_eq!(out.finish_message().as_deref(), Some("The network is HomeNet."));

        let out = parse_response("### Plan ###\nfinished");
        assert!(out.is_finished());
        assert_eq!(out.finish_message().as_deref(), Some(""));
    }

    #[test]
    fn test_replan_prompt_carries_history_and_stuck_signal() {
        let mut pool = InfoPool::new("pay the bill");
        pool.set_plan("1. Open the bank app\n2. Pay");
        for _ in 0..2 {
            pool.record_step(StepRecord {
                action: StepAction::Parsed(Action::new(ActionKind::Click { x: 5, y: 5 })),
                thought: String::new(),
                summary: "tap pay".into(),
                outcome: Outcome::B,
                error: "error dialog".into(),
            });
        }
        let prompt = build_replan_prompt(&pool, Perception::default());
        assert!(prompt.contains("devise high-level plans"));
        assert!(prompt.contains("### Previous Plan ###\n1. Open the bank app\n2. Pay"));
        assert!(prompt.contains("Outcome: B | Error: error dialog"));
        assert!(prompt.contains("Potentially Stuck"));
        assert!(!prompt.contains("Decide the next action"));
    }

    #[test]
    fn test_initial_prompt() {
        let prompt = build_initial_prompt(&InfoPool::new("open settings"), Perception::default());
        assert!(prompt.contains("### User Request ###\nopen settings"));
        assert!(prompt.contains("### Plan ###"));
        assert!(!prompt.contains("Previous Plan"));
    }
}
