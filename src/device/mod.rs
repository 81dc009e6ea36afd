//! 设备能力：原子操作与截图
//!
//! 核心循环只通过 DeviceController 使用设备；ShellDevice 基于可替换的 ShellChannel（特权命令通道）实现，
//! MockDevice 用于测试。perform 把一个 ActionKind 分派到对应的设备调用。

pub mod adb;
pub mod mock;
pub mod screenshot;
pub mod shell;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::action::{ActionKind, SystemButton};
use crate::config::DeviceSection;

pub use adb::AdbShell;
pub use mock::{DeviceCall, MockDevice};
pub use screenshot::{EncodeSettings, Perception, Screenshot};
pub use shell::{resolve_package, ShellChannel, ShellDevice, ShellDeviceSettings};

/// 设备调用错误；ChannelUnavailable / Timeout 视为瞬时错误，在设备层内重试
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Privileged channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Command timed out after {0}s")]
    Timeout(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl DeviceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::ChannelUnavailable(_) | DeviceError::Timeout(_))
    }
}

/// 文本输入最终生效的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextInputMethod {
    /// ASCII：`input text`
    InputText,
    /// 剪贴板 + 粘贴键
    ClipboardPaste,
    /// ADB Keyboard 广播
    KeyboardBroadcast,
    /// `cmd input text` 兜底
    RawCommand,
}

/// 设备能力 trait：所有坐标为屏幕像素
#[async_trait]
pub trait DeviceController: Send + Sync {
    async fn tap(&self, x: i32, y: i32) -> Result<(), DeviceError>;

    async fn long_press(&self, x: i32, y: i32, duration_ms: u32) -> Result<(), DeviceError>;

    async fn double_tap(&self, x: i32, y: i32) -> Result<(), DeviceError>;

    async fn swipe(
        &self,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u32,
    ) -> Result<(), DeviceError>;

    /// 输入文本；非 ASCII 依次尝试剪贴板粘贴、键盘广播、原始命令
    async fn type_text(&self, text: &str) -> Result<TextInputMethod, DeviceError>;

    async fn press_back(&self) -> Result<(), DeviceError>;

    async fn press_home(&self) -> Result<(), DeviceError>;

    async fn press_enter(&self) -> Result<(), DeviceError>;

    /// 按应用名或包名启动，返回实际使用的包名
    async fn open_app(&self, name_or_package: &str) -> Result<String, DeviceError>;

    /// 截图永不失败：被拒绝或不可读时返回黑屏占位图
    async fn capture_screen(&self) -> Screenshot;

    /// 考虑屏幕方向后的 (宽, 高)
    async fn screen_size(&self) -> (u32, u32);
}

/// 手势时长
#[derive(Debug, Clone, Copy)]
pub struct GestureTiming {
    pub long_press_ms: u32,
    pub swipe_ms: u32,
}

impl Default for GestureTiming {
    fn default() -> Self {
        Self {
            long_press_ms: 1000,
            swipe_ms: 500,
        }
    }
}

impl From<&DeviceSection> for GestureTiming {
    fn from(section: &DeviceSection) -> Self {
        Self {
            long_press_ms: section.long_press_ms,
            swipe_ms: section.swipe_ms,
        }
    }
}

/// 执行一个设备动作；wait 在此处休眠，take_over / answer 不是设备动作
pub async fn perform(
    device: &dyn DeviceController,
    kind: &ActionKind,
    timing: GestureTiming,
) -> Result<(), DeviceError> {
    match kind {
        ActionKind::Click { x, y } => device.tap(*x, *y).await,
        ActionKind::DoubleTap { x, y } => device.double_tap(*x, *y).await,
        ActionKind::LongPress { x, y } => device.long_press(*x, *y, timing.long_press_ms).await,
        ActionKind::Swipe { x1, y1, x2, y2 } => {
            device.swipe(*x1, *y1, *x2, *y2, timing.swipe_ms).await
        }
        ActionKind::Type { text } => {
            let method = device.type_text(text).await?;
            tracing::debug!(?method, "text typed");
            Ok(())
        }
        ActionKind::SystemButton { button } => match button {
            SystemButton::Back => device.press_back().await,
            SystemButton::Home => device.press_home().await,
            SystemButton::Enter => device.press_enter().await,
        },
        ActionKind::OpenApp { target } => device.open_app(target).await.map(|_| ()),
        ActionKind::Wait { seconds } => {
            tokio::time::sleep(Duration::from_secs(u64::from(*seconds))).await;
            Ok(())
        }
        ActionKind::TakeOver { .. } | ActionKind::Answer { .. } => Err(
            DeviceError::InvalidArgument(format!("'{}' is not a device action", kind.name())),
        ),
    }
}
