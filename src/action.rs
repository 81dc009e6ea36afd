//! 动作契约：设备原子操作的标签变体，以及与模型文本协议（单个 JSON 对象）之间的编解码
//!
//! - decode 容忍 Markdown 代码块与 JSON 前后的说明文字；任何无法映射为已知动作的输入都返回 None，
//!   调用方必须把「没有动作」当作独立的失败，而不是空操作。
//! - encode 只输出已设置的字段，且 `decode(encode(a)) == a` 对所有可构造的动作成立。
//! - 任意动作（take_over 除外，其 `message` 字段已被占用）都可携带确认消息，携带即视为敏感操作。

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

/// wait 动作的默认时长（秒）：字段缺失或无法解析时使用
pub const DEFAULT_WAIT_SECS: u32 = 3;
pub const MIN_WAIT_SECS: u32 = 1;
pub const MAX_WAIT_SECS: u32 = 10;

/// 仅有 `need_confirm: true` 而没有 `message` 时使用的确认文案
pub const DEFAULT_CONFIRM_MESSAGE: &str = "This action looks sensitive. Allow it?";

/// 系统按键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SystemButton {
    Back,
    Home,
    Enter,
}

impl SystemButton {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemButton::Back => "Back",
            SystemButton::Home => "Home",
            SystemButton::Enter => "Enter",
        }
    }

    /// 大小写不敏感；未知按键返回 None
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "back" => Some(SystemButton::Back),
            "home" => Some(SystemButton::Home),
            "enter" => Some(SystemButton::Enter),
            _ => None,
        }
    }
}

/// 原子动作类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Click { x: i32, y: i32 },
    DoubleTap { x: i32, y: i32 },
    LongPress { x: i32, y: i32 },
    Type { text: String },
    Swipe { x1: i32, y1: i32, x2: i32, y2: i32 },
    SystemButton { button: SystemButton },
    /// 应用名或包名
    OpenApp { target: String },
    /// 等待页面加载，秒数限定在 [1, 10]
    Wait { seconds: u32 },
    /// 请求用户手动接管（登录、验证码等）
    TakeOver { message: String },
    /// 回答用户的问题，同时意味着任务完成
    Answer { text: String },
}

impl ActionKind {
    /// 协议中的类型标签
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Click { .. } => "click",
            ActionKind::DoubleTap { .. } => "double_tap",
            ActionKind::LongPress { .. } => "long_press",
            ActionKind::Type { .. } => "type",
            ActionKind::Swipe { .. } => "swipe",
            ActionKind::SystemButton { .. } => "system_button",
            ActionKind::OpenApp { .. } => "open_app",
            ActionKind::Wait { .. } => "wait",
            ActionKind::TakeOver { .. } => "take_over",
            ActionKind::Answer { .. } => "answer",
        }
    }

    /// 动作涉及的所有屏幕坐标
    pub fn points(&self) -> Vec<(i32, i32)> {
        match self {
            ActionKind::Click { x, y }
            | ActionKind::DoubleTap { x, y }
            | ActionKind::LongPress { x, y } => vec![(*x, *y)],
            ActionKind::Swipe { x1, y1, x2, y2 } => vec![(*x1, *y1), (*x2, *y2)],
            _ => Vec::new(),
        }
    }
}

/// 不可变的动作值：类型 + 可选确认消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    kind: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    confirm_message: Option<String>,
}

impl Action {
    /// 构造动作；wait 秒数会被夹到 [1, 10]
    pub fn new(kind: ActionKind) -> Self {
        let kind = match kind {
            ActionKind::Wait { seconds } => ActionKind::Wait {
                seconds: seconds.clamp(MIN_WAIT_SECS, MAX_WAIT_SECS),
            },
            other => other,
        };
        Self {
            kind,
            confirm_message: None,
        }
    }

    /// 标记为敏感操作；空消息与 take_over 不产生确认
    pub fn with_confirmation(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        if message.trim().is_empty() || matches!(self.kind, ActionKind::TakeOver { .. }) {
            return self;
        }
        self.confirm_message = Some(message);
        self
    }

    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    pub fn confirm_message(&self) -> Option<&str> {
        self.confirm_message.as_deref()
    }

    pub fn is_sensitive(&self) -> bool {
        self.confirm_message.is_some()
    }

    /// 从模型文本解析动作；失败时返回 None，绝不返回部分填充的动作
    pub fn decode(text: &str) -> Option<Action> {
        let value = leading_json_object(text)?;
        let obj = value.as_object()?;
        let tag = obj.get("action")?.as_str()?.trim().to_ascii_lowercase();

        let message = string_field(obj, "message");
        let kind = match tag.as_str() {
            "click" => {
                let (x, y) = point_field(obj, "coordinate")?;
                ActionKind::Click { x, y }
            }
            "double_tap" => {
                let (x, y) = point_field(obj, "coordinate")?;
                ActionKind::DoubleTap { x, y }
            }
            "long_press" => {
                let (x, y) = point_field(obj, "coordinate")?;
                ActionKind::LongPress { x, y }
            }
            "type" => ActionKind::Type {
                text: string_field(obj, "text")?,
            },
            "swipe" => {
                let (x1, y1) = point_field(obj, "coordinate")?;
                let (x2, y2) = point_field(obj, "coordinate2")?;
                ActionKind::Swipe { x1, y1, x2, y2 }
            }
            "system_button" => ActionKind::SystemButton {
                button: SystemButton::parse(&string_field(obj, "button")?)?,
            },
            "open_app" => ActionKind::OpenApp {
                target: string_field(obj, "text")?,
            },
            "wait" => ActionKind::Wait {
                seconds: obj
                    .get("duration")
                    .and_then(parse_seconds)
                    .unwrap_or(DEFAULT_WAIT_SECS),
            },
            "take_over" => ActionKind::TakeOver {
                message: message.clone().unwrap_or_default(),
            },
            "answer" => ActionKind::Answer {
                text: string_field(obj, "text")?,
            },
            _ => return None,
        };

        let need_confirm = obj
            .get("need_confirm")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let action = Action::new(kind);
        if matches!(action.kind, ActionKind::TakeOver { .. }) {
            return Some(action);
        }
        Some(match message.filter(|m| !m.trim().is_empty()) {
            Some(m) => action.with_confirmation(m),
            None if need_confirm => action.with_confirmation(DEFAULT_CONFIRM_MESSAGE),
            None => action,
        })
    }

    /// 编码为协议 JSON；未设置的字段不输出
    pub fn encode(&self) -> String {
        let mut obj = Map::new();
        obj.insert("action".into(), Value::from(self.kind.name()));
        match &self.kind {
            ActionKind::Click { x, y }
            | ActionKind::DoubleTap { x, y }
            | ActionKind::LongPress { x, y } => {
                obj.insert("coordinate".into(), Value::from(vec![*x, *y]));
            }
            ActionKind::Type { text } | ActionKind::Answer { text } => {
                obj.insert("text".into(), Value::from(text.as_str()));
            }
            ActionKind::Swipe { x1, y1, x2, y2 } => {
                obj.insert("coordinate".into(), Value::from(vec![*x1, *y1]));
                obj.insert("coordinate2".into(), Value::from(vec![*x2, *y2]));
            }
            ActionKind::SystemButton { button } => {
                obj.insert("button".into(), Value::from(button.as_str()));
            }
            ActionKind::OpenApp { target } => {
                obj.insert("text".into(), Value::from(target.as_str()));
            }
            ActionKind::Wait { seconds } => {
                obj.insert("duration".into(), Value::from(*seconds));
            }
            ActionKind::TakeOver { message } => {
                obj.insert("message".into(), Value::from(message.as_str()));
            }
        }
        if let Some(message) = &self.confirm_message {
            obj.insert("message".into(), Value::from(message.as_str()));
            obj.insert("need_confirm".into(), Value::Bool(true));
        }
        Value::Object(obj).to_string()
    }
}

impl From<ActionKind> for Action {
    fn from(kind: ActionKind) -> Self {
        Action::new(kind)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// 从某个 `{` 起读出一个完整的 JSON 对象，其后的文字（哪怕含括号）忽略
fn leading_json_object(text: &str) -> Option<Value> {
    text.match_indices('{').find_map(|(start, _)| {
        let mut values = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) if value.is_object() => Some(value),
            _ => None,
        }
    })
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_as_i32(value: &Value) -> Option<i32> {
    let n = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64))?,
        Value::String(s) => s.trim().parse::<f64>().ok()?.round() as i64,
        _ => return None,
    };
    i32::try_from(n).ok()
}

fn point_field(obj: &Map<String, Value>, key: &str) -> Option<(i32, i32)> {
    let arr = obj.get(key)?.as_array()?;
    if arr.len() < 2 {
        return None;
    }
    Some((number_as_i32(&arr[0])?, number_as_i32(&arr[1])?))
}

fn parse_seconds(value: &Value) -> Option<u32> {
    let n = number_as_i32(value)?;
    Some(n.clamp(MIN_WAIT_SECS as i32, MAX_WAIT_SECS as i32) as u32)
}
