//! Notetaker：从动作后的屏幕中提取后续步骤需要的事实，合并进 important_notes

use std::sync::Arc;

use crate::agents::sections::extract_section;
use crate::core::info_pool::InfoPool;
use crate::core::AgentError;
use crate::device::Perception;
use crate::llm::LlmClient;

const NOTES: &str = "### Important Notes";

pub fn build_prompt(pool: &InfoPool, perception: Perception) -> String {
    let mut p = String::new();
    p.push_str("You are a helpful AI assistant for operating mobile phones. ");
    p.push_str("Your goal is to take notes of important content relevant to the user's request.\n\n");

    p.push_str("### User Request ###\n");
    p.push_str(pool.instruction());
    p.push_str("\n\n");

    p.push_str("### Overall Plan ###\n");
    p.push_str(&pool.plan);
    p.push_str("\n\n");

    p.push_str("### Current Subgoal ###\n");
    p.push_str(&pool.current_subgoal());
    p.push_str("\n\n");

    p.push_str("### Existing Important Notes ###\n");
    if pool.important_notes.is_empty() {
        p.push_str("No important notes recorded.");
    } else {
        p.push_str(&pool.important_notes);
    }
    p.push_str("\n\n");

    if let Some(note) = perception.note() {
        p.push_str(note);
        p.push_str("\n\n");
    }

    p.push_str("---\n");
    p.push_str("Carefully examine the information above and the current screenshot to identify any content that will be needed later to complete the request ");
    p.push_str("(e.g., a value, a name, a number read off the screen). ");
    p.push_str("Only list NEW facts, one per line starting with \"- \". Do not repeat existing notes. ");
    p.push_str("Do not note transient UI details such as buttons or layout.\n\n");

    p.push_str("Provide your output in the following format:\n");
    p.push_str("### Important Notes ###\n");
    p.push_str("The new notes, or \"None\" if there is nothing new.\n");
    p
}

/// 取笔记段；没有标记时整段回复视为笔记
pub fn parse_response(text: &str) -> String {
    let section = extract_section(text, NOTES, &[]);
    let notes = if section.is_empty() && !text.contains(NOTES) {
        text.trim().to_string()
    } else {
        section
    };
    if notes.trim_end_matches('.').eq_ignore_ascii_case("none") {
        String::new()
    } else {
        notes
    }
}

pub struct Notetaker {
    llm: Arc<dyn LlmClient>,
}

impl Notetaker {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 返回新笔记文本（可能为空），由调用方合并
    pub async fn take_notes(
        &self,
        pool: &InfoPool,
        screenshot: Option<&str>,
        perception: Perception,
    ) -> Result<String, AgentError> {
        let prompt = build_prompt(pool, perception);
        let images: Vec<String> = screenshot.map(|s| vec![s.to_string()]).unwrap_or_default();
        let reply = self.llm.infer(&prompt, &images).await?;
        Ok(parse_response(&reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_notes() {
        assert_eq!(
            parse_response("### Important Notes ###\n- Wi-Fi: HomeNet\n"),
            "- Wi-Fi: HomeNet"
        );
        assert_eq!(parse_response("### Important Notes ###\nNone."), "");
        assert_eq!(parse_response("- Battery 80%"), "- Battery 80%");
    }

    #[test]
    fn test_prompt_includes_existing_notes() {
        let mut pool = InfoPool::new("report the Wi-Fi name");
        pool.merge_notes("- Wi-Fi: HomeNet");
        let prompt = build_prompt(&pool, Perception::default());
        assert!(prompt.contains("take notes of important content"));
        assert!(prompt.contains("### Existing Important Notes ###\n- Wi-Fi: HomeNet"));
    }
}
