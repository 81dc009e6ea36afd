//! Reflector：对比动作前后的截图，判定结果 A / B / C
//!
//! 回复包含 Outcome、Error Description、Progress 三段，另可带 Subgoal Status（unreachable 时触发重新规划）。

use std::sync::Arc;

use crate::action::Action;
use crate::agents::sections::extract_section;
use crate::core::info_pool::{InfoPool, Outcome};
use crate::core::AgentError;
use crate::device::Perception;
use crate::llm::{LlmClient, LlmError};

const OUTCOME: &str = "### Outcome";
const ERROR: &str = "### Error Description";
const PROGRESS: &str = "### Progress";
const SUBGOAL: &str = "### Subgoal Status";

const ALL: &[&str] = &[OUTCOME, ERROR, PROGRESS, SUBGOAL];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectorOutput {
    pub outcome: Outcome,
    /// A 时为空
    pub error_description: String,
    /// 本步带来的进度增量
    pub progress: String,
    pub subgoal_unreachable: bool,
}

fn others(current: &str) -> Vec<&'static str> {
    ALL.iter().copied().filter(|m| *m != current).collect()
}

pub fn build_prompt(
    pool: &InfoPool,
    action: &Action,
    description: &str,
    before: Perception,
    after: Perception,
) -> String {
    let mut p = String::new();
    p.push_str("You are an agent who can operate an Android phone on behalf of a user. ");
    p.push_str("Your goal is to verify whether the last action produced the expected behavior and to keep track of the overall progress.\n\n");

    p.push_str("### User Request ###\n");
    p.push_str(pool.instruction());
    p.push_str("\n\n");

    p.push_str("### Current Subgoal ###\n");
    p.push_str(&pool.current_subgoal());
    p.push_str("\n\n");

    p.push_str("### Progress Status ###\n");
    if pool.progress_status.is_empty() {
        p.push_str("No progress yet.");
    } else {
        p.push_str(&pool.progress_status);
    }
    p.push_str("\n\n");

    p.push_str("---\n");
    p.push_str("The two attached images are screenshots taken before and after the last action.\n");
    for (label, perception) in [("before", before), ("after", after)] {
        if let Some(note) = perception.note() {
            p.push_str(&format!("Screenshot {}: {}\n", label, note));
        }
    }
    p.push('\n');

    p.push_str("### Latest Action ###\n");
    p.push_str(&format!("Action: {}\n", action));
    p.push_str(&format!("Expectation: {}\n\n", description));

    p.push_str("---\n");
    p.push_str("Carefully examine the information above to determine whether the last action produced the expected behavior. ");
    p.push_str("If the action was successful, update the progress status accordingly. ");
    p.push_str("If the action failed, identify the failure mode and provide reasoning on the potential reason causing this failure.\n\n");

    p.push_str("Provide your output in the following format containing four parts:\n\n");
    p.push_str("### Outcome ###\n");
    p.push_str("Choose from the following options. Give your answer as \"A\", \"B\" or \"C\":\n");
    p.push_str("A: Successful or Partially Successful. The result of the last action meets the expectation.\n");
    p.push_str("B: Failed. The last action results in a wrong page. I need to return to the previous state.\n");
    p.push_str("C: Failed. The last action produces no changes.\n\n");
    p.push_str("### Error Description ###\n");
    p.push_str("If the action failed, provide a one-line description of the error. Put \"None\" if the action succeeded.\n\n");
    p.push_str("### Progress ###\n");
    p.push_str("One short sentence describing what this action accomplished. Put \"None\" if nothing changed.\n\n");
    p.push_str("### Subgoal Status ###\n");
    p.push_str("\"reachable\" or \"unreachable\": whether the current subgoal can still be achieved along the current plan.\n");
    p
}

fn none_to_empty(s: String) -> String {
    let t = s.trim().trim_end_matches('.');
    if t.eq_ignore_ascii_case("none") || t.eq_ignore_ascii_case("n/a") {
        String::new()
    } else {
        s
    }
}

/// 解析回复；结果段无法识别时返回 None
pub fn parse_response(text: &str) -> Option<ReflectorOutput> {
    let outcome = Outcome::parse(&extract_section(text, OUTCOME, &others(OUTCOME)))?;
    let error_description = if outcome.is_success() {
        String::new()
    } else {
        none_to_empty(extract_section(text, ERROR, &others(ERROR)))
    };
    let progress = none_to_empty(extract_section(text, PROGRESS, &others(PROGRESS)));
    let status = extract_section(text, SUBGOAL, &others(SUBGOAL)).to_lowercase();
    Some(ReflectorOutput {
        outcome,
        error_description,
        progress,
        subgoal_unreachable: status.contains("unreachable"),
    })
}

pub struct Reflector {
    llm: Arc<dyn LlmClient>,
}

impl Reflector {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// before / after 为截图 data URL（编码失败时为 None，不发送该图）
    #[allow(clippy::too_many_arguments)]
    pub async fn reflect(
        &self,
        pool: &InfoPool,
        action: &Action,
        description: &str,
        before: Option<&str>,
        after: Option<&str>,
        before_perception: Perception,
        after_perception: Perception,
    ) -> Result<ReflectorOutput, AgentError> {
        let prompt = build_prompt(pool, action, description, before_perception, after_perception);
        let images: Vec<String> = [before, after]
            .into_iter()
            .flatten()
            .map(str::to_string)
            .collect();
        let reply = self.llm.infer(&prompt, &images).await?;
        let mut output = parse_response(&reply)
            .ok_or_else(|| LlmError::InvalidResponse("reflection has no outcome".into()))?;
        if !output.outcome.is_success() && output.error_description.is_empty() {
            output.error_description = match output.outcome {
                Outcome::C => "the action produced no visible change".to_string(),
                _ => "the action led to an unexpected state".to_string(),
            };
        }
        Ok(output)
    }
}
