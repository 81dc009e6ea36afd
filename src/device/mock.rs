//! 记录调用的内存设备（用于测试与 dry-run）

use std::sync::Mutex;

use async_trait::async_trait;

use crate::device::{DeviceController, DeviceError, Screenshot, TextInputMethod};

/// MockDevice 记录的一次调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Tap { x: i32, y: i32 },
    DoubleTap { x: i32, y: i32 },
    LongPress { x: i32, y: i32, duration_ms: u32 },
    Swipe { x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u32 },
    Type { text: String },
    Back,
    Home,
    Enter,
    OpenApp { name: String },
    Capture,
}

impl DeviceCall {
    fn is_action(&self) -> bool {
        !matches!(self, DeviceCall::Capture)
    }
}

/// 内存设备：所有操作成功（除非脚本化了失败），截图为纯色图
pub struct MockDevice {
    width: u32,
    height: u32,
    calls: Mutex<Vec<DeviceCall>>,
    blocked_capture: bool,
    failure: Mutex<Option<DeviceError>>,
}

impl MockDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            calls: Mutex::new(Vec::new()),
            blocked_capture: false,
            failure: Mutex::new(None),
        }
    }

    /// 截图一律被系统拒绝（模拟支付等受保护页面）
    pub fn with_blocked_capture(mut self) -> Self {
        self.blocked_capture = true;
        self
    }

    /// 下一次动作调用返回该错误（只生效一次）
    pub fn fail_next(&self, error: DeviceError) {
        if let Ok(mut f) = self.failure.lock() {
            *f = Some(error);
        }
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// 除截图以外的调用
    pub fn action_calls(&self) -> Vec<DeviceCall> {
        self.calls().into_iter().filter(DeviceCall::is_action).collect()
    }

    pub fn capture_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, DeviceCall::Capture))
            .count()
    }

    fn record(&self, call: DeviceCall) -> Result<(), DeviceError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        match self.failure.lock().ok().and_then(|mut f| f.take()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DeviceController for MockDevice {
    async fn tap(&self, x: i32, y: i32) -> Result<(), DeviceError> {
        self.record(DeviceCall::Tap { x, y })
    }

    async fn long_press(&self, x: i32, y: i32, duration_ms: u32) -> Result<(), DeviceError> {
        self.record(DeviceCall::LongPress { x, y, duration_ms })
    }

    async fn double_tap(&self, x: i32, y: i32) -> Result<(), DeviceError> {
        self.record(DeviceCall::DoubleTap { x, y })
    }

    async fn swipe(
        &self,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u32,
    ) -> Result<(), DeviceError> {
        self.record(DeviceCall::Swipe {
            x1,
            y1,
            x2,
            y2,
            duration_ms,
        })
    }

    async fn type_text(&self, text: &str) -> Result<TextInputMethod, DeviceError> {
        self.record(DeviceCall::Type {
            text: text.to_string(),
        })?;
        Ok(if text.is_ascii() {
            TextInputMethod::InputText
        } else {
            TextInputMethod::ClipboardPaste
        })
    }

    async fn press_back(&self) -> Result<(), DeviceError> {
        self.record(DeviceCall::Back)
    }

    async fn press_home(&self) -> Result<(), DeviceError> {
        self.record(DeviceCall::Home)
    }

    async fn press_enter(&self) -> Result<(), DeviceError> {
        self.record(DeviceCall::Enter)
    }

    async fn open_app(&self, name_or_package: &str) -> Result<String, DeviceError> {
        self.record(DeviceCall::OpenApp {
            name: name_or_package.to_string(),
        })?;
        Ok(crate::device::resolve_package(name_or_package))
    }

    async fn capture_screen(&self) -> Screenshot {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(DeviceCall::Capture);
        }
        if self.blocked_capture {
            Screenshot::fallback(self.width, self.height, true)
        } else {
            Screenshot::captured(image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
                self.width,
                self.height,
                image::Rgb([240, 240, 240]),
            )))
        }
    }

    async fn screen_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
