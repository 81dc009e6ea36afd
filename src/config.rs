//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AUTOPILOT__*` 覆盖（双下划线表示嵌套，如 `AUTOPILOT__AGENT__MAX_STEPS=40`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub device: DeviceSection,
    pub screenshot: ScreenshotSection,
}

/// [agent] 段：步数预算、重新规划阈值、提示词窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 单次指令的最大步数
    pub max_steps: usize,
    /// 最近 N 步全部非成功时交回 Manager 重新规划
    pub err_to_manager_thresh: usize,
    /// Executor prompt 中展示的历史条数
    pub history_window: usize,
    /// 「当前子目标」取计划的前几步
    pub subgoal_steps: usize,
    /// 不计入步数的人工接管次数上限，超出后接管照常计步
    pub max_take_overs: usize,
    /// 是否为 Executor 保留多轮对话记忆
    pub executor_memory: bool,
    pub executor_memory_turns: usize,
    /// 每一步都先调用 Manager（更贵，但能更早判断完成）
    pub replan_each_step: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: 25,
            err_to_manager_thresh: 2,
            history_window: 5,
            subgoal_steps: 3,
            max_take_overs: 3,
            executor_memory: false,
            executor_memory_turns: 10,
            replan_each_step: false,
        }
    }
}

/// [llm] 段：OpenAI 兼容端点、模型、采样参数、超时与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub model: String,
    /// 未设置时依次读取环境变量 AUTOPILOT_API_KEY / OPENAI_API_KEY
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeouts: LlmTimeoutsSection,
    pub retry: LlmRetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
            model: "qwen3-vl-plus".to_string(),
            api_key: None,
            max_tokens: 4096,
            temperature: 0.0,
            timeouts: LlmTimeoutsSection::default(),
            retry: LlmRetrySection::default(),
        }
    }
}

impl LlmSection {
    /// 配置优先，其次环境变量；空白视为未设置
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("AUTOPILOT_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 连接超时（秒）
    pub connect: u64,
    /// 整个请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            connect: 30,
            request: 90,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmRetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl From<&LlmRetrySection> for crate::llm::RetryConfig {
    fn from(section: &LlmRetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            base_delay: std::time::Duration::from_millis(section.base_delay_ms),
        }
    }
}

/// [device] 段：设备序列号、截图路径、手势时长、命令重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    /// adb 设备序列号；未设置时使用唯一连接的设备
    pub serial: Option<String>,
    pub screenshot_path: String,
    /// 截图命令之后的固定等待（毫秒）
    pub settle_delay_ms: u64,
    pub long_press_ms: u32,
    pub swipe_ms: u32,
    /// 特权通道不可用时的最大尝试次数
    pub command_retries: u32,
    pub command_timeout_secs: u64,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            serial: None,
            screenshot_path: "/data/local/tmp/autopilot_screen.png".to_string(),
            settle_delay_ms: 500,
            long_press_ms: 1000,
            swipe_ms: 500,
            command_retries: 3,
            command_timeout_secs: 15,
        }
    }
}

/// [screenshot] 段：发送给模型前的降采样与压缩参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScreenshotSection {
    pub max_width: u32,
    pub max_height: u32,
    pub jpeg_quality: u8,
}

impl Default for ScreenshotSection {
    fn default() -> Self {
        Self {
            max_width: 720,
            max_height: 1280,
            jpeg_quality: 60,
        }
    }
}

/// 从 config 目录加载配置，环境变量 AUTOPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AUTOPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AUTOPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_steps, 25);
        assert_eq!(cfg.agent.err_to_manager_thresh, 2);
        assert_eq!(cfg.llm.retry.max_attempts, 3);
        assert_eq!(cfg.device.settle_delay_ms, 500);
        assert_eq!(cfg.screenshot.max_width, 720);
    }

    #[test]
    fn test_load_from_file_keeps_unset_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[agent]\nmax_steps = 8\n\n[llm]\nmodel = \"gpt-4o\"\n\n[device]\nserial = \"emulator-5554\""
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.max_steps, 8);
        assert_eq!(cfg.agent.history_window, 5);
        assert_eq!(cfg.llm.model, "gpt-4o");
        assert_eq!(cfg.device.serial.as_deref(), Some("emulator-5554"));
        assert_eq!(cfg.screenshot.jpeg_quality, 60);
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let section = LlmSection {
            api_key: Some("  sk-config  ".into()),
            ..LlmSection::default()
        };
        assert_eq!(section.resolve_api_key().as_deref(), Some("sk-config"));
    }
}
