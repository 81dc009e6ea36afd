//! 信息池：一次指令执行的全部可变状态
//!
//! 由编排器独占，各智能体读写。四条历史（动作 / 摘要 / 结果 / 错误）只能经 record_step 一起追加，
//! 因此任何时刻下标都一一对应；「最近一步」的各字段直接取自历史末尾。

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::action::Action;
use crate::memory::ConversationMemory;

/// 单步结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Outcome {
    /// 成功
    A,
    /// 进入错误页面或意外状态
    B,
    /// 屏幕无可见变化
    C,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::A)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::A => "A",
            Outcome::B => "B",
            Outcome::C => "C",
        }
    }

    /// 解析 "A"、"B: error page"、"[C]"、"Outcome: A" 之类的写法；独立的字母才算
    pub fn parse(s: &str) -> Option<Self> {
        let from_letter = |c: &str| match c {
            "A" => Some(Outcome::A),
            "B" => Some(Outcome::B),
            "C" => Some(Outcome::C),
            _ => None,
        };
        let re = OUTCOME_LETTER
            .get_or_init(|| Regex::new(r"\b([ABC])\b").ok())
            .as_ref()?;
        re.captures(s).and_then(|c| from_letter(c.get(1)?.as_str()))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 历史中的动作：解析成功的动作，或解析失败时的原始文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    Parsed(Action),
    Unparsed(String),
}

impl StepAction {
    pub fn action(&self) -> Option<&Action> {
        match self {
            StepAction::Parsed(a) => Some(a),
            StepAction::Unparsed(_) => None,
        }
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepAction::Parsed(a) => write!(f, "{}", a.encode()),
            StepAction::Unparsed(raw) if raw.trim().is_empty() => f.write_str("(no action)"),
            StepAction::Unparsed(raw) => write!(f, "(unparsed) {}", raw.trim()),
        }
    }
}

/// 一步完成后写入信息池的全部内容
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub action: StepAction,
    pub thought: String,
    pub summary: String,
    pub outcome: Outcome,
    /// 成功时为空
    pub error: String,
}

/// 历史中的一行（按下标对齐的四条历史的视图）
#[derive(Debug, Clone, Copy)]
pub struct HistoryEntry<'a> {
    pub action: &'a StepAction,
    pub summary: &'a str,
    pub outcome: Outcome,
    pub error: &'a str,
}

static OUTCOME_LETTER: OnceLock<Option<Regex>> = OnceLock::new();
static STEP_MARKER: OnceLock<Option<Regex>> = OnceLock::new();

/// 计划文本的前 n 个编号步骤；没有编号时返回整个计划
///
/// 行首的编号总算作新步骤；行内的 "N. " 只有 N 恰好是下一个序号时才算，
/// 因此 "Enter 100. Then tap Pay" 里的金额不会被切成步骤。
pub fn subgoal_prefix(plan: &str, n: usize) -> String {
    let plan = plan.trim();
    let Some(re) = STEP_MARKER
        .get_or_init(|| Regex::new(r"(\d+)(?:[.)]\s|、)").ok())
        .as_ref()
    else {
        return plan.to_string();
    };

    let mut starts: Vec<usize> = Vec::new();
    let mut expected: Option<u64> = None;
    for caps in re.captures_iter(plan) {
        let Some(m) = caps.get(1) else { continue };
        let before = &plan[..m.start()];
        if before.chars().last().map_or(false, |c| !c.is_whitespace()) {
            continue;
        }
        let Ok(number) = m.as_str().parse::<u64>() else {
            continue;
        };
        let line_start = before
            .rsplit('\n')
            .next()
            .map_or(true, |line| line.trim().is_empty());
        let in_sequence = match expected {
            Some(next) => number == next,
            None => number == 1,
        };
        if line_start || in_sequence {
            starts.push(m.start());
            expected = Some(number + 1);
        }
    }

    if starts.is_empty() || n == 0 {
        return plan.to_string();
    }
    starts
        .iter()
        .take(n)
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(plan.len());
            plan[start..end].trim()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 规范化一条笔记用于去重：去掉列表符号、折叠空白、小写
fn normalize_note(line: &str) -> String {
    line.trim()
        .trim_start_matches(&['-', '*', '•'][..])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone)]
pub struct InfoPool {
    instruction: String,

    pub plan: String,
    pub progress_status: String,
    pub important_notes: String,

    action_history: Vec<StepAction>,
    summary_history: Vec<String>,
    action_outcomes: Vec<Outcome>,
    error_descriptions: Vec<String>,
    thought_history: Vec<String>,

    error_flag_plan: bool,
    err_to_manager_thresh: usize,
    /// 上次规划时的历史长度；重新规划判定只看此后的结果
    replan_watermark: usize,
    subgoal_steps: usize,

    /// 同一子目标上连续 C 的次数
    no_change_streak: usize,
    streak_subgoal: String,

    pub screen_width: u32,
    pub screen_height: u32,

    pub additional_knowledge: String,
    pub skill_context: String,

    pub executor_memory: Option<ConversationMemory>,
}

impl InfoPool {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            plan: String::new(),
            progress_status: String::new(),
            important_notes: String::new(),
            action_history: Vec::new(),
            summary_history: Vec::new(),
            action_outcomes: Vec::new(),
            error_descriptions: Vec::new(),
            thought_history: Vec::new(),
            error_flag_plan: false,
            err_to_manager_thresh: 2,
            replan_watermark: 0,
            subgoal_steps: 3,
            no_change_streak: 0,
            streak_subgoal: String::new(),
            screen_width: 1080,
            screen_height: 2400,
            additional_knowledge: String::new(),
            skill_context: String::new(),
            executor_memory: None,
        }
    }

    pub fn with_err_to_manager_thresh(mut self, thresh: usize) -> Self {
        self.err_to_manager_thresh = thresh.max(1);
        self
    }

    pub fn with_subgoal_steps(mut self, steps: usize) -> Self {
        self.subgoal_steps = steps.max(1);
        self
    }

    pub fn with_executor_memory(mut self, max_turns: usize) -> Self {
        self.executor_memory = Some(ConversationMemory::new(max_turns));
        self
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn err_to_manager_thresh(&self) -> usize {
        self.err_to_manager_thresh
    }

    /// 计划的前几个步骤
    pub fn current_subgoal(&self) -> String {
        subgoal_prefix(&self.plan, self.subgoal_steps)
    }

    /// Manager 写入新计划：清除重新规划标记，并从此处重新统计失败
    pub fn set_plan(&mut self, plan: impl Into<String>) {
        self.plan = plan.into().trim().to_string();
        self.error_flag_plan = false;
        self.replan_watermark = self.action_outcomes.len();
    }

    pub fn error_flag_plan(&self) -> bool {
        self.error_flag_plan
    }

    /// 要求下一步先重新规划（例如 Reflector 判断子目标不可达）
    pub fn flag_replan(&mut self) {
        self.error_flag_plan = true;
    }

    /// 上次规划之后，最近 err_to_manager_thresh 个结果是否全部非成功
    pub fn failure_threshold_reached(&self) -> bool {
        let since_plan = &self.action_outcomes[self.replan_watermark.min(self.action_outcomes.len())..];
        let n = self.err_to_manager_thresh;
        since_plan.len() >= n && since_plan[since_plan.len() - n..].iter().all(|o| !o.is_success())
    }

    pub fn needs_replan(&self) -> bool {
        self.error_flag_plan || self.failure_threshold_reached()
    }

    /// 同一子目标上连续两次「无变化」
    pub fn repeated_no_change(&self) -> bool {
        self.no_change_streak >= 2
    }

    /// 追加一步：四条历史同时增长
    pub fn record_step(&mut self, record: StepRecord) {
        let subgoal = self.current_subgoal();
        if record.outcome == Outcome::C {
            if self.no_change_streak > 0 && self.streak_subgoal == subgoal {
                self.no_change_streak += 1;
            } else {
                self.no_change_streak = 1;
                self.streak_subgoal = subgoal;
            }
        } else {
            self.no_change_streak = 0;
            self.streak_subgoal.clear();
        }

        self.action_history.push(record.action);
        self.summary_history.push(record.summary);
        self.action_outcomes.push(record.outcome);
        self.error_descriptions.push(record.error);
        self.thought_history.push(record.thought);

        if self.failure_threshold_reached() {
            self.error_flag_plan = true;
        }
    }

    /// 追加一段进度描述；空白忽略
    pub fn append_progress(&mut self, delta: &str) {
        let delta = delta.trim();
        if delta.is_empty() {
            return;
        }
        if self.progress_status.is_empty() {
            self.progress_status = delta.to_string();
        } else {
            self.progress_status.push('\n');
            self.progress_status.push_str(delta);
        }
    }

    /// 合并新笔记：已记录过的事实（规范化后相同）不再追加；返回新增行数
    pub fn merge_notes(&mut self, notes: &str) -> usize {
        let mut seen: Vec<String> = self
            .important_notes
            .lines()
            .map(normalize_note)
            .filter(|l| !l.is_empty())
            .collect();
        let mut added = 0;
        for line in notes.lines() {
            let key = normalize_note(line);
            if key.is_empty() || key == "none" || seen.contains(&key) {
                continue;
            }
            if !self.important_notes.is_empty() {
                self.important_notes.push('\n');
            }
            self.important_notes.push_str(line.trim());
            seen.push(key);
            added += 1;
        }
        added
    }

    pub fn action_history(&self) -> &[StepAction] {
        &self.action_history
    }

    pub fn summary_history(&self) -> &[String] {
        &self.summary_history
    }

    pub fn action_outcomes(&self) -> &[Outcome] {
        &self.action_outcomes
    }

    pub fn error_descriptions(&self) -> &[String] {
        &self.error_descriptions
    }

    pub fn thought_history(&self) -> &[String] {
        &self.thought_history
    }

    pub fn step_count(&self) -> usize {
        self.action_history.len()
    }

    pub fn last_action(&self) -> Option<&StepAction> {
        self.action_history.last()
    }

    pub fn last_action_thought(&self) -> &str {
        self.thought_history.last().map(String::as_str).unwrap_or("")
    }

    pub fn last_summary(&self) -> &str {
        self.summary_history.last().map(String::as_str).unwrap_or("")
    }

    /// 最近 n 步（按时间顺序）
    pub fn recent_history(&self, n: usize) -> Vec<HistoryEntry<'_>> {
        let start = self.action_history.len().saturating_sub(n);
        (start..self.action_history.len())
            .map(|i| HistoryEntry {
                action: &self.action_history[i],
                summary: &self.summary_history[i],
                outcome: self.action_outcomes[i],
                error: &self.error_descriptions[i],
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;

    fn step(outcome: Outcome) -> StepRecord {
        StepRecord {
            action: StepAction::Parsed(Action::new(ActionKind::Click { x: 1, y: 2 })),
            thought: "t".into(),
            summary: "tap".into(),
            outcome,
            error: if outcome.is_success() {
                String::new()
            } else {
                "nothing happened".into()
            },
        }
    }

    #[test]
    fn test_subgoal_prefix_numbered_lines() {
        let plan = "1. Open Settings\n2. Tap Wi-Fi\n3. Read the network name\n4. Answer";
        assert_eq!(
            subgoal_prefix(plan, 3),
            "1. Open Settings\n2. Tap Wi-Fi\n3. Read the network name"
        );
        assert_eq!(subgoal_prefix(plan, 1), "1. Open Settings");
    }

    #[test]
    fn test_subgoal_prefix_inline_and_unnumbered() {
        assert_eq!(
            subgoal_prefix("1. Open Settings 2. Tap Wi-Fi 3. Read 4. Answer", 2),
            "1. Open Settings\n2. Tap Wi-Fi"
        );
        assert_eq!(subgoal_prefix("  just do it  ", 3), "just do it");
        assert_eq!(subgoal_prefix("", 3), "");
    }

    #[test]
    fn test_subgoal_prefix_keeps_amounts_inside_steps() {
        let plan = "1. Open the bank app\n2. Enter 100. Then tap Pay\n3. Confirm\n4. Answer";
        assert_eq!(
            subgoal_prefix(plan, 3),
            "1. Open the bank app\n2. Enter 100. Then tap Pay\n3. Confirm"
        );
        assert_eq!(
            subgoal_prefix("1. Transfer 50. 2. Check balance 3. Answer", 2),
            "1. Transfer 50.\n2. Check balance"
        );
    }

    #[test]
    fn test_histories_stay_aligned() {
        let mut pool = InfoPool::new("task");
        pool.record_step(step(Outcome::A));
        pool.record_step(StepRecord {
            action: StepAction::Unparsed("garbage".into()),
            thought: String::new(),
            summary: String::new(),
            outcome: Outcome::B,
            error: "could not parse action".into(),
        });
        assert_eq!(pool.action_history().len(), 2);
        assert_eq!(pool.summary_history().len(), 2);
        assert_eq!(pool.action_outcomes().len(), 2);
        assert_eq!(pool.error_descriptions().len(), 2);
        assert!(pool.last_action().unwrap().action().is_none());
        assert_eq!(pool.last_summary(), "");
        assert_eq!(pool.recent_history(5).len(), 2);
        assert_eq!(pool.recent_history(1)[0].outcome, Outcome::B);
    }

    #[test]
    fn test_replan_after_threshold_failures_since_last_plan() {
        let mut pool = InfoPool::new("task").with_err_to_manager_thresh(2);
        pool.set_plan("1. a\n2. b");
        pool.record_step(step(Outcome::B));
        assert!(!pool.needs_replan());
        pool.record_step(step(Outcome::C));
        assert!(pool.error_flag_plan());
        assert!(pool.needs_replan());

        pool.set_plan("1. a\n2. c");
        assert!(!pool.needs_replan());
        pool.record_step(step(Outcome::B));
        assert!(!pool.needs_replan());
        pool.record_step(step(Outcome::A));
        pool.record_step(step(Outcome::B));
        assert!(!pool.needs_replan());
    }

    #[test]
    fn test_no_change_streak_per_subgoal() {
        let mut pool = InfoPool::new("task").with_err_to_manager_thresh(5);
        pool.set_plan("1. a");
        pool.record_step(step(Outcome::C));
        assert!(!pool.repeated_no_change());
        pool.record_step(step(Outcome::C));
        assert!(pool.repeated_no_change());
        pool.set_plan("1. different");
        pool.record_step(step(Outcome::C));
        assert!(!pool.repeated_no_change());
        pool.record_step(step(Outcome::A));
        assert!(!pool.repeated_no_change());
    }

    #[test]
    fn test_merge_notes_is_idempotent() {
        let mut pool = InfoPool::new("task");
        assert_eq!(pool.merge_notes("- Wi-Fi network: HomeNet\n- Battery 80%"), 2);
        assert_eq!(pool.merge_notes("-  wi-fi network:   HomeNet\nNone"), 0);
        assert_eq!(pool.merge_notes("- Battery 80%\n- Bluetooth off"), 1);
        assert_eq!(pool.important_notes.lines().count(), 3);
    }

    #[test]
    fn test_outcome_parse() {
        assert_eq!(Outcome::parse(" B: error page"), Some(Outcome::B));
        assert_eq!(Outcome::parse("[C]"), Some(Outcome::C));
        assert_eq!(Outcome::parse("Outcome: A"), Some(Outcome::A));
        assert_eq!(Outcome::parse("Answer unknown"), None);
    }
}
