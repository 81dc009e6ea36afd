//! Executor：根据信息池决定下一个原子动作
//!
//! build_prompt 是信息池（只读）的纯函数；parse_response 按 Thought / Action / Description 三段切片，
//! 动作段解码失败时 action 为 None，由编排器记为解析失败步骤。

use std::sync::Arc;

use crate::action::Action;
use crate::agents::sections::{extract_section, strip_code_fences};
use crate::core::info_pool::InfoPool;
use crate::core::AgentError;
use crate::device::Perception;
use crate::llm::LlmClient;
use crate::memory::Message;

const THOUGHT: &str = "### Thought";
const ACTION: &str = "### Action";
const DESCRIPTION: &str = "### Description";

pub const GUIDELINES: &str = "\
General:
- For any pop-up window, close it (e.g., by clicking 'Don't Allow' or 'Accept') before proceeding.
- For requests that are questions, remember to use the `answer` action to reply before finish!
- If the desired state is already achieved, you can just complete the task.

Action Related:
- Use `open_app` to open an app, do not use the app drawer.
- Consider using `swipe` to reveal additional content.
- If swiping doesn't change the page, it may have reached the bottom.

Text Related:
- To input text: first click the input box, make sure keyboard is visible, then use `type` action.
- To clear text: long press the backspace button in the keyboard.";

const ATOMIC_ACTIONS: &str = "\
- click(coordinate): Click at (x, y). Example: {\"action\": \"click\", \"coordinate\": [x, y]}
- double_tap(coordinate): Double tap at (x, y) for zoom or like. Example: {\"action\": \"double_tap\", \"coordinate\": [x, y]}
- long_press(coordinate): Long press at (x, y). Example: {\"action\": \"long_press\", \"coordinate\": [x, y]}
- type(text): Type text into activated input box. Example: {\"action\": \"type\", \"text\": \"hello\"}
- swipe(coordinate, coordinate2): Swipe from point1 to point2. Example: {\"action\": \"swipe\", \"coordinate\": [x1, y1], \"coordinate2\": [x2, y2]}
- system_button(button): Press Back/Home/Enter. Example: {\"action\": \"system_button\", \"button\": \"Back\"}
- open_app(text): Open an app by name. Example: {\"action\": \"open_app\", \"text\": \"Settings\"}
- wait(duration): Wait for page loading. Duration in seconds (1-10). Example: {\"action\": \"wait\", \"duration\": 3}
- take_over(message): Request user to manually complete login/captcha/verification. Example: {\"action\": \"take_over\", \"message\": \"Please finish the login\"}
- answer(text): Answer user's question. Example: {\"action\": \"answer\", \"text\": \"The answer is...\"}";

/// Executor 的解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOutput {
    pub thought: String,
    pub action: Option<Action>,
    /// 动作段原文（去掉围栏后），解析失败时写入历史
    pub raw_action: String,
    pub description: String,
}

/// 生成 Executor prompt；history_window 为展示的最近历史条数
pub fn build_prompt(pool: &InfoPool, perception: Perception, history_window: usize) -> String {
    let mut p = String::new();
    p.push_str("You are an agent who can operate an Android phone. ");
    p.push_str("Decide the next action based on the current state.\n\n");

    p.push_str("### User Request ###\n");
    p.push_str(pool.instruction());
    p.push_str("\n\n");

    p.push_str("### Overall Plan ###\n");
    p.push_str(&pool.plan);
    p.push_str("\n\n");

    p.push_str("### Current Subgoal ###\n");
    p.push_str(&pool.current_subgoal());
    p.push_str("\n\n");

    p.push_str("### Progress Status ###\n");
    if pool.progress_status.is_empty() {
        p.push_str("No progress yet.\n\n");
    } else {
        p.push_str(&pool.progress_status);
        p.push_str("\n\n");
    }

    if !pool.important_notes.is_empty() {
        p.push_str("### Important Notes ###\n");
        p.push_str(&pool.important_notes);
        p.push_str("\n\n");
    }
    for (title, body) in [
        ("Additional Knowledge", &pool.additional_knowledge),
        ("Relevant Skills", &pool.skill_context),
    ] {
        if !body.trim().is_empty() {
            p.push_str(&format!("### {} ###\n{}\n\n", title, body.trim()));
        }
    }

    p.push_str(&format!(
        "### Screen ###\nThe screen is {}x{} pixels. Coordinates must lie within it.\n",
        pool.screen_width, pool.screen_height
    ));
    if let Some(note) = perception.note() {
        p.push_str(note);
        p.push('\n');
    }
    p.push('\n');

    p.push_str("### Guidelines ###\n");
    p.push_str(GUIDELINES);
    p.push_str("\n\n");

    p.push_str("---\n");
    p.push_str("Examine all information and decide on the next action.\n\n");

    p.push_str("#### Atomic Actions ####\n");
    p.push_str(ATOMIC_ACTIONS);
    p.push_str("\n\n");

    p.push_str("#### Sensitive Operations ####\n");
    p.push_str("For payment, password, or privacy-related actions, set \"need_confirm\" and add a 'message' field to request user confirmation:\n");
    p.push_str("Example: {\"action\": \"click\", \"coordinate\": [500, 800], \"need_confirm\": true, \"message\": \"Confirm payment of 100\"}\n");
    p.push_str("The user will see a confirmation dialog and can choose to confirm or cancel.\n\n");

    p.push_str("### Latest Action History ###\n");
    let recent = pool.recent_history(history_window);
    if recent.is_empty() {
        p.push_str("No actions have been taken yet.\n");
    } else {
        for entry in recent {
            if entry.outcome.is_success() {
                p.push_str(&format!(
                    "- Action: {} | Description: {} | Outcome: Successful\n",
                    entry.action, entry.summary
                ));
            } else {
                p.push_str(&format!(
                    "- Action: {} | Description: {} | Outcome: Failed | Error: {}\n",
                    entry.action, entry.summary, entry.error
                ));
            }
        }
    }
    p.push('\n');

    p.push_str("---\n");
    p.push_str("IMPORTANT:\n");
    p.push_str("1. Do NOT repeat previously failed actions. Try a different approach.\n");
    p.push_str("2. Prioritize the current subgoal.\n");
    if pool.repeated_no_change() {
        p.push_str("3. The last actions made no visible change. Do not repeat the last action verbatim; choose a different target or action.\n");
    }
    p.push('\n');

    p.push_str("Provide your output in the following format:\n\n");
    p.push_str("### Thought ###\n");
    p.push_str("Your rationale for the chosen action.\n\n");
    p.push_str("### Action ###\n");
    p.push_str("A valid JSON specifying the action. Example: {\"action\":\"click\", \"coordinate\": [500, 800]}\n\n");
    p.push_str("### Description ###\n");
    p.push_str("A brief description of the chosen action.\n");
    p
}

/// 解析 Executor 回复
pub fn parse_response(text: &str) -> ExecutorOutput {
    let thought = extract_section(text, THOUGHT, &[ACTION, DESCRIPTION]);
    let raw_action = strip_code_fences(&extract_section(text, ACTION, &[DESCRIPTION]));
    let description = extract_section(text, DESCRIPTION, &[]);
    let action = Action::decode(&raw_action);
    ExecutorOutput {
        thought,
        action,
        raw_action,
        description,
    }
}

pub struct Executor {
    llm: Arc<dyn LlmClient>,
    history_window: usize,
}

impl Executor {
    pub fn new(llm: Arc<dyn LlmClient>, history_window: usize) -> Self {
        Self {
            llm,
            history_window: history_window.max(1),
        }
    }

    /// 调用模型决定下一步；开启多轮记忆时，把本轮问答（不含图片）写入 pool.executor_memory
    pub async fn decide(
        &self,
        pool: &mut InfoPool,
        screenshot: Option<&str>,
        perception: Perception,
    ) -> Result<ExecutorOutput, AgentError> {
        let prompt = build_prompt(pool, perception, self.history_window);
        let images: Vec<String> = screenshot.map(|s| vec![s.to_string()]).unwrap_or_default();

        let reply = match pool.executor_memory.as_mut() {
            Some(memory) => {
                let mut messages = memory.messages().to_vec();
                messages.push(Message::user(prompt.clone()).with_images(images));
                let reply = self.llm.complete(&messages).await?;
                memory.push(Message::user(prompt));
                memory.push(Message::assistant(reply.clone()));
                reply
            }
            None => self.llm.infer(&prompt, &images).await?,
        };
        Ok(parse_response(&reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, SystemButton};
    use crate::core::info_pool::{Outcome, StepAction, StepRecord};

    fn pool_with_history(n: usize) -> InfoPool {
        let mut pool = InfoPool::new("open settings and report the Wi-Fi network name");
        pool.set_plan("1. Open Settings\n2. Open Wi-Fi\n3. Read the name\n4. Answer");
        for i in 0..n {
            pool.record_step(StepRecord {
                action: StepAction::Parsed(Action::new(ActionKind::Click { x: i as i32, y: 1 })),
                thought: String::new(),
                summary: format!("tap {}", i),
                outcome: if i % 2 == 0 { Outcome::A } else { Outcome::B },
                error: if i % 2 == 0 { String::new() } else { "error dialog".into() },
            });
        }
        pool
    }

    #[test]
    fn test_prompt_sections_in_order() {
        let prompt = build_prompt(&pool_with_history(0), Perception::default(), 5);
        let order = [
            "Decide the next action",
            "### User Request ###\nopen settings and report the Wi-Fi network name",
            "### Overall Plan ###",
            "### Current Subgoal ###\n1. Open Settings\n2. Open Wi-Fi\n3. Read the name\n\n",
            "### Progress Status ###\nNo progress yet.",
            "### Guidelines ###",
            "#### Atomic Actions ####",
            "#### Sensitive Operations ####",
            "### Latest Action History ###\nNo actions have been taken yet.",
            "### Thought ###",
            "### Action ###",
            "### Description ###",
        ];
        let mut last = 0;
        for needle in order {
            let pos = prompt[last..]
                .find(needle)
                .unwrap_or_else(|| panic!("missing or out of order: {}", needle));
            last += pos;
        }
        assert!(!prompt.contains("4. Answer\n\n### Progress"));
    }

    #[test]
    fn test_prompt_history_window_and_format() {
        let prompt = build_prompt(&pool_with_history(7), Perception::default(), 5);
        assert_eq!(prompt.matches("- Action: ").count(), 5);
        assert!(!prompt.contains("Description: tap 1 |"));
        assert!(prompt.contains(
            "- Action: {\"action\":\"click\",\"coordinate\":[6,1]} | Description: tap 6 | Outcome: Successful"
        ));
        assert!(prompt.contains("| Description: tap 5 | Outcome: Failed | Error: error dialog"));
    }

    #[test]
    fn test_prompt_mentions_degraded_screen_and_repeats() {
        let mut pool = pool_with_history(0);
        for _ in 0..2 {
            pool.record_step(StepRecord {
                action: StepAction::Parsed(Action::new(ActionKind::SystemButton {
                    button: SystemButton::Back,
                })),
                thought: String::new(),
                summary: "back".into(),
                outcome: Outcome::C,
                error: "no change".into(),
            });
        }
        let prompt = build_prompt(
            &pool,
            Perception {
                is_sensitive: true,
                is_fallback: true,
            },
            5,
        );
        assert!(prompt.contains("black placeholder"));
        assert!(prompt.contains("Do not repeat the last action verbatim"));
    }

    #[test]
    fn test_parse_well_formed() {
        let out = parse_response(
            "### Thought ###\nSettings is the place.\n### Action ###\n{\"action\": \"open_app\", \"text\": \"settings\"}\n### Description ###\nOpen Settings.",
        );
        assert_eq!(out.thought, "Settings is the place.");
        assert_eq!(out.description, "Open Settings.");
        assert_eq!(
            out.action.unwrap().kind(),
            &ActionKind::OpenApp {
                target: "settings".into()
            }
        );
    }

    #[test]
    fn test_parse_fenced_action_and_trailing_commentary() {
        let out = parse_response(
            "### Thought ###\nscroll\n### Action ###\n```json\n{\"action\": \"swipe\", \"coordinate\": [500, 1500], \"coordinate2\": [500, 500]}\n```\n### Description ###\nSwipe up.\n\nLet me know if this works.",
        );
        assert_eq!(
            out.action.unwrap().kind(),
            &ActionKind::Swipe {
                x1: 500,
                y1: 1500,
                x2: 500,
                y2: 500
            }
        );
        assert!(!out.raw_action.contains("```"));
        assert!(out.description.starts_with("Swipe up."));
    }

    #[test]
    fn test_parse_missing_description_runs_to_end() {
        let out = parse_response("### Thought ###\nt\n### Action ###\n{\"action\": \"system_button\", \"button\": \"Back\"}");
        assert!(out.action.is_some());
        assert_eq!(out.description, "");
    }

    #[test]
    fn test_parse_missing_action_section() {
        let out = parse_response("### Thought ###\nI am not sure.\n### Description ###\nNothing.");
        assert!(out.action.is_none());
        assert_eq!(out.raw_action, "");
        assert_eq!(out.thought, "I am not sure.");
    }

    #[test]
    fn test_parse_unknown_action_and_garbage() {
        let out = parse_response("### Action ###\n{\"action\": \"teleport\"}\n### Description ###\nx");
        assert!(out.action.is_none());
        assert_eq!(out.raw_action, "{\"action\": \"teleport\"}");

        let out = parse_response("I will click the button now.");
        assert!(out.action.is_none());
        assert_eq!(out.thought, "");
    }

    #[test]
    fn test_parse_markers_with_trailing_hashes_and_extra_sections() {
        let out = parse_response(
            "### Thought ###\nthink\n\n### Action ###\n{\"action\": \"click\", \"coordinate\": [10, 20], \"message\": \"Pay now?\"}\n\n### Description ###\nTap pay\n### Notes ###\nextra",
        );
        let action = out.action.unwrap();
        assert_eq!(action.confirm_message(), Some("Pay now?"));
        assert!(out.description.contains("Tap pay"));
    }
}
