//! 基于特权 shell 通道的设备控制器
//!
//! 所有原子操作都翻译为 `input` / `screencap` / `monkey` 等命令，经 ShellChannel 执行；
//! 通道不可用或超时时线性退避重试，其它错误直接返回。

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::config::DeviceSection;
use crate::device::{DeviceController, DeviceError, Screenshot, TextInputMethod};

/// 截图命令输出中表示被系统拒绝（受保护页面）的标记
const BLOCKED_MARKERS: &[&str] = &["Status: -1", "Failed", "error"];

/// 读不到 `wm size` 时使用的屏幕尺寸
const DEFAULT_SCREEN: (u32, u32) = (1080, 2400);

const KEYCODE_HOME: u32 = 3;
const KEYCODE_BACK: u32 = 4;
const KEYCODE_ENTER: u32 = 66;
const KEYCODE_PASTE: u32 = 279;

/// 常用应用名 -> 包名
const APP_PACKAGES: &[(&str, &str)] = &[
    ("settings", "com.android.settings"),
    ("browser", "com.android.browser"),
    ("chrome", "com.android.chrome"),
    ("camera", "com.android.camera"),
    ("phone", "com.android.dialer"),
    ("dialer", "com.android.dialer"),
    ("contacts", "com.android.contacts"),
    ("messages", "com.android.mms"),
    ("gallery", "com.android.gallery3d"),
    ("clock", "com.android.deskclock"),
    ("calculator", "com.android.calculator2"),
    ("calendar", "com.android.calendar"),
    ("files", "com.android.documentsui"),
];

/// 特权命令通道（adb、设备端 shell 服务等）
#[async_trait]
pub trait ShellChannel: Send + Sync {
    /// 执行一条 shell 命令，返回标准输出
    async fn exec(&self, command: &str) -> Result<String, DeviceError>;

    /// 读取设备上的文件（二进制）
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, DeviceError>;

    /// 写入系统剪贴板；通道不支持时返回 Ok(false)，非 ASCII 输入随即退到广播与 `cmd input text`
    async fn set_clipboard(&self, _text: &str) -> Result<bool, DeviceError> {
        Ok(false)
    }
}

#[derive(Debug, Clone)]
pub struct ShellDeviceSettings {
    pub screenshot_path: String,
    /// 截图命令之后、读取文件之前的等待
    pub settle_delay: Duration,
    pub command_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ShellDeviceSettings {
    fn default() -> Self {
        Self::from(&DeviceSection::default())
    }
}

impl From<&DeviceSection> for ShellDeviceSettings {
    fn from(section: &DeviceSection) -> Self {
        Self {
            screenshot_path: section.screenshot_path.clone(),
            settle_delay: Duration::from_millis(section.settle_delay_ms),
            command_retries: section.command_retries.max(1),
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// 应用名（不区分大小写）或包名 -> 包名；未知名称原样返回
pub fn resolve_package(name_or_package: &str) -> String {
    let trimmed = name_or_package.trim();
    if trimmed.contains('.') {
        return trimmed.to_string();
    }
    let lower = trimmed.to_lowercase();
    APP_PACKAGES
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, pkg)| pkg.to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

/// 单引号包裹，内部单引号转义为 `'\''`
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn is_blocked(output: &str) -> bool {
    BLOCKED_MARKERS.iter().any(|m| output.contains(m))
}

static WM_SIZE: OnceLock<Option<Regex>> = OnceLock::new();
static ORIENTATION: OnceLock<Option<Regex>> = OnceLock::new();

fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    let re = WM_SIZE
        .get_or_init(|| Regex::new(r"(\d+)x(\d+)").ok())
        .as_ref()?;
    let caps = re.captures(output)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

fn parse_orientation(output: &str) -> Option<u32> {
    let re = ORIENTATION
        .get_or_init(|| Regex::new(r"mCurrentOrientation=(\d)").ok())
        .as_ref()?;
    re.captures(output)?[1].parse().ok()
}

/// ShellChannel 之上的 DeviceController
pub struct ShellDevice<C> {
    channel: C,
    settings: ShellDeviceSettings,
}

impl<C: ShellChannel> ShellDevice<C> {
    pub fn new(channel: C, settings: ShellDeviceSettings) -> Self {
        Self { channel, settings }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// 瞬时错误线性退避重试
    async fn exec(&self, command: &str) -> Result<String, DeviceError> {
        let max = self.settings.command_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.channel.exec(command).await {
                Ok(out) => return Ok(out),
                Err(e) if e.is_transient() && attempt < max => {
                    tracing::warn!(attempt, max, command, error = %e, "device command failed, retrying");
                    tokio::time::sleep(self.settings.retry_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn keyevent(&self, code: u32) -> Result<(), DeviceError> {
        self.exec(&format!("input keyevent {}", code)).await.map(|_| ())
    }

    async fn fallback_screenshot(&self, is_sensitive: bool) -> Screenshot {
        let (w, h) = self.screen_size().await;
        Screenshot::fallback(w, h, is_sensitive)
    }

    async fn type_non_ascii(&self, text: &str) -> Result<TextInputMethod, DeviceError> {
        match self.channel.set_clipboard(text).await {
            Ok(true) => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                self.keyevent(KEYCODE_PASTE).await?;
                return Ok(TextInputMethod::ClipboardPaste);
            }
            Ok(false) => tracing::debug!("clipboard not supported by channel"),
            Err(e) => tracing::warn!(error = %e, "set clipboard failed"),
        }

        let escaped = text.replace('"', "\\\"");
        match self
            .exec(&format!("am broadcast -a ADB_INPUT_TEXT --es msg \"{}\"", escaped))
            .await
        {
            Ok(out) if out.contains("result=0") => return Ok(TextInputMethod::KeyboardBroadcast),
            Ok(out) => tracing::debug!(output = %out.trim(), "keyboard broadcast not accepted"),
            Err(e) => tracing::warn!(error = %e, "keyboard broadcast failed"),
        }

        self.exec(&format!("cmd input text {}", shell_quote(text)))
            .await?;
        Ok(TextInputMethod::RawCommand)
    }
}

#[async_trait]
impl<C: ShellChannel> DeviceController for ShellDevice<C> {
    async fn tap(&self, x: i32, y: i32) -> Result<(), DeviceError> {
        self.exec(&format!("input tap {} {}", x, y)).await.map(|_| ())
    }

    async fn long_press(&self, x: i32, y: i32, duration_ms: u32) -> Result<(), DeviceError> {
        self.exec(&format!("input swipe {} {} {} {} {}", x, y, x, y, duration_ms))
            .await
            .map(|_| ())
    }

    async fn double_tap(&self, x: i32, y: i32) -> Result<(), DeviceError> {
        self.exec(&format!("input tap {} {} && input tap {} {}", x, y, x, y))
            .await
            .map(|_| ())
    }

    async fn swipe(
        &self,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u32,
    ) -> Result<(), DeviceError> {
        self.exec(&format!(
            "input swipe {} {} {} {} {}",
            x1, y1, x2, y2, duration_ms
        ))
        .await
        .map(|_| ())
    }

    async fn type_text(&self, text: &str) -> Result<TextInputMethod, DeviceError> {
        if text.is_empty() {
            return Err(DeviceError::InvalidArgument("text is empty".into()));
        }
        if !text.is_ascii() {
            return self.type_non_ascii(text).await;
        }
        // `input text` 把 %s 解释为空格
        let arg = shell_quote(&text.replace(' ', "%s"));
        self.exec(&format!("input text {}", arg)).await?;
        Ok(TextInputMethod::InputText)
    }

    async fn press_back(&self) -> Result<(), DeviceError> {
        self.keyevent(KEYCODE_BACK).await
    }

    async fn press_home(&self) -> Result<(), DeviceError> {
        self.keyevent(KEYCODE_HOME).await
    }

    async fn press_enter(&self) -> Result<(), DeviceError> {
        self.keyevent(KEYCODE_ENTER).await
    }

    async fn open_app(&self, name_or_package: &str) -> Result<String, DeviceError> {
        if name_or_package.trim().is_empty() {
            return Err(DeviceError::InvalidArgument("app name is empty".into()));
        }
        let package = resolve_package(name_or_package);
        let output = self
            .exec(&format!(
                "monkey -p {} -c android.intent.category.LAUNCHER 1",
                package
            ))
            .await?;
        if output.contains("No activities found") {
            return Err(DeviceError::CommandFailed(format!(
                "no launchable activity for {}",
                package
            )));
        }
        tracing::info!(app = %name_or_package, package = %package, "app launched");
        Ok(package)
    }

    async fn capture_screen(&self) -> Screenshot {
        let path = &self.settings.screenshot_path;
        let command = format!("screencap -p {} && chmod 666 {}", path, path);
        match self.exec(&command).await {
            Ok(output) if is_blocked(&output) => {
                tracing::info!("screenshot blocked by system, using placeholder");
                return self.fallback_screenshot(true).await;
            }
            Ok(_) => {}
            Err(DeviceError::CommandFailed(msg)) if is_blocked(&msg) => {
                tracing::info!("screenshot blocked by system, using placeholder");
                return self.fallback_screenshot(true).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "screencap failed, using placeholder");
                return self.fallback_screenshot(false).await;
            }
        }

        tokio::time::sleep(self.settings.settle_delay).await;

        let bytes = match self.channel.read_file(path).await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => {
                tracing::warn!(path = %path, "screenshot file empty, using placeholder");
                return self.fallback_screenshot(false).await;
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "screenshot unreadable, using placeholder");
                return self.fallback_screenshot(false).await;
            }
        };
        match image::load_from_memory(&bytes) {
            Ok(img) => Screenshot::captured(img),
            Err(e) => {
                tracing::warn!(error = %e, size = bytes.len(), "screenshot undecodable, using placeholder");
                self.fallback_screenshot(false).await
            }
        }
    }

    async fn screen_size(&self) -> (u32, u32) {
        let (w, h) = match self.exec("wm size").await {
            Ok(out) => parse_wm_size(&out).unwrap_or(DEFAULT_SCREEN),
            Err(e) => {
                tracing::warn!(error = %e, "wm size failed, assuming default screen");
                DEFAULT_SCREEN
            }
        };
        let orientation = self
            .exec("dumpsys window displays | grep mCurrentOrientation")
            .await
            .ok()
            .and_then(|out| parse_orientation(&out))
            .unwrap_or(0);
        if orientation == 1 || orientation == 3 {
            (h, w)
        } else {
            (w, h)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex;

    use image::{DynamicImage, ImageOutputFormat, RgbImage};

    /// 按命令前缀回放输出，并记录执行过的命令
    #[derive(Default)]
    struct ScriptedChannel {
        replies: Mutex<Vec<(String, VecDeque<Result<String, DeviceError>>)>>,
        file: Mutex<Option<Result<Vec<u8>, DeviceError>>>,
        clipboard: bool,
        executed: Mutex<Vec<String>>,
    }

    impl ScriptedChannel {
        fn reply(self, prefix: &str, outputs: Vec<Result<String, DeviceError>>) -> Self {
            self.replies
                .lock()
                .unwrap()
                .push((prefix.to_string(), outputs.into()));
            self
        }

        fn file(self, bytes: Result<Vec<u8>, DeviceError>) -> Self {
            *self.file.lock().unwrap() = Some(bytes);
            self
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ShellChannel for ScriptedChannel {
        async fn exec(&self, command: &str) -> Result<String, DeviceError> {
            self.executed.lock().unwrap().push(command.to_string());
            let mut replies = self.replies.lock().unwrap();
            match replies.iter_mut().find(|(p, _)| command.starts_with(p.as_str())) {
                Some((_, queue)) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some((_, queue)) => queue.front().cloned().unwrap_or(Ok(String::new())),
                None => Ok(String::new()),
            }
        }

        async fn read_file(&self, _path: &str) -> Result<Vec<u8>, DeviceError> {
            self.file
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err(DeviceError::CommandFailed("no such file".into())))
        }

        async fn set_clipboard(&self, _text: &str) -> Result<bool, DeviceError> {
            Ok(self.clipboard)
        }
    }

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(w, h))
            .write_to(&mut buf, ImageOutputFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn device(channel: ScriptedChannel) -> ShellDevice<ScriptedChannel> {
        ShellDevice::new(
            channel,
            ShellDeviceSettings {
                settle_delay: Duration::ZERO,
                retry_delay: Duration::ZERO,
                ..ShellDeviceSettings::default()
            },
        )
    }

    #[test]
    fn test_resolve_package() {
        assert_eq!(resolve_package("Settings"), "com.android.settings");
        assert_eq!(resolve_package("phone"), "com.android.dialer");
        assert_eq!(resolve_package("com.tencent.mm"), "com.tencent.mm");
        assert_eq!(resolve_package("WeChat"), "WeChat");
    }

    #[tokio::test]
    async fn test_gesture_commands() {
        let dev = device(ScriptedChannel::default());
        dev.tap(10, 20).await.unwrap();
        dev.long_press(1, 2, 1000).await.unwrap();
        dev.swipe(1, 2, 3, 4, 500).await.unwrap();
        dev.press_back().await.unwrap();
        dev.press_home().await.unwrap();
        dev.press_enter().await.unwrap();
        assert_eq!(
            dev.channel().executed(),
            vec![
                "input tap 10 20",
                "input swipe 1 2 1 2 1000",
                "input swipe 1 2 3 4 500",
                "input keyevent 4",
                "input keyevent 3",
                "input keyevent 66",
            ]
        );
    }

    #[tokio::test]
    async fn test_ascii_text_escapes_spaces_and_quotes() {
        let dev = device(ScriptedChannel::default());
        let method = dev.type_text("it's wifi").await.unwrap();
        assert_eq!(method, TextInputMethod::InputText);
        assert_eq!(dev.channel().executed(), vec![r"input text 'it'\''s%swifi'"]);
    }

    #[tokio::test]
    async fn test_non_ascii_prefers_clipboard() {
        let dev = device(ScriptedChannel {
            clipboard: true,
            ..ScriptedChannel::default()
        });
        let method = dev.type_text("你好").await.unwrap();
        assert_eq!(method, TextInputMethod::ClipboardPaste);
        assert_eq!(dev.channel().executed(), vec!["input keyevent 279"]);
    }

    #[tokio::test]
    async fn test_non_ascii_falls_back_to_broadcast_then_raw() {
        let dev = device(
            ScriptedChannel::default()
                .reply("am broadcast", vec![Ok("Broadcast completed: result=0".into())]),
        );
        assert_eq!(
            dev.type_text("咖啡").await.unwrap(),
            TextInputMethod::KeyboardBroadcast
        );

        let dev = device(
            ScriptedChannel::default()
                .reply("am broadcast", vec![Ok("Broadcast completed: result=-1".into())]),
        );
        assert_eq!(dev.type_text("咖啡").await.unwrap(), TextInputMethod::RawCommand);
        assert_eq!(dev.channel().executed().last().unwrap(), "cmd input text '咖啡'");
    }

    #[tokio::test]
    async fn test_open_app_resolves_and_detects_missing_package() {
        let dev = device(ScriptedChannel::default());
        assert_eq!(dev.open_app("Calculator").await.unwrap(), "com.android.calculator2");
        assert!(dev.channel().executed()[0].starts_with("monkey -p com.android.calculator2"));

        let dev = device(ScriptedChannel::default().reply(
            "monkey",
            vec![Ok("** No activities found to run, monkey aborted.".into())],
        ));
        assert!(matches!(
            dev.open_app("com.missing.app").await,
            Err(DeviceError::CommandFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let dev = device(ScriptedChannel::default().reply(
            "input tap",
            vec![
                Err(DeviceError::ChannelUnavailable("binder died".into())),
                Ok(String::new()),
            ],
        ));
        dev.tap(1, 1).await.unwrap();
        assert_eq!(dev.channel().executed().len(), 2);

        let dev = device(
            ScriptedChannel::default()
                .reply("input tap", vec![Err(DeviceError::CommandFailed("bad".into()))]),
        );
        assert!(dev.tap(1, 1).await.is_err());
        assert_eq!(dev.channel().executed().len(), 1);
    }

    #[tokio::test]
    async fn test_screen_size_swaps_in_landscape() {
        let dev = device(
            ScriptedChannel::default()
                .reply("wm size", vec![Ok("Physical size: 1080x2400\n".into())])
                .reply("dumpsys", vec![Ok("  mCurrentOrientation=1\n".into())]),
        );
        assert_eq!(dev.screen_size().await, (2400, 1080));

        let dev = device(ScriptedChannel::default());
        assert_eq!(dev.screen_size().await, DEFAULT_SCREEN);
    }

    #[tokio::test]
    async fn test_blocked_capture_returns_sensitive_placeholder() {
        let dev = device(
            ScriptedChannel::default()
                .reply("screencap", vec![Ok("Status: -1\n".into())])
                .reply("wm size", vec![Ok("Physical size: 720x1600".into())]),
        );
        let shot = dev.capture_screen().await;
        assert!(shot.is_sensitive && shot.is_fallback);
        assert_eq!(shot.dimensions(), (720, 1600));
    }

    #[tokio::test]
    async fn test_capture_decodes_file_or_falls_back() {
        let dev = device(ScriptedChannel::default().file(Ok(png_bytes(8, 16))));
        let shot = dev.capture_screen().await;
        assert!(!shot.is_fallback);
        assert_eq!(shot.dimensions(), (8, 16));

        let dev = device(ScriptedChannel::default().file(Ok(b"not an image".to_vec())));
        let shot = dev.capture_screen().await;
        assert!(shot.is_fallback && !shot.is_sensitive);
    }
}
