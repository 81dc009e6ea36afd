//! adb 通道：在宿主机上通过 `adb shell` / `adb exec-out` 执行设备命令
//!
//! 每条命令带超时；adb 自身报告设备离线/未授权时映射为 ChannelUnavailable（可重试）。

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::DeviceSection;
use crate::device::shell::shell_quote;
use crate::device::{DeviceError, ShellChannel};

/// 表示设备连接问题的 adb 错误输出
const CONNECTION_MARKERS: &[&str] = &[
    "no devices/emulators found",
    "device offline",
    "device unauthorized",
    "device not found",
    "closed",
    "cannot connect",
];

pub struct AdbShell {
    serial: Option<String>,
    timeout: Duration,
}

impl AdbShell {
    pub fn new(serial: Option<String>, timeout: Duration) -> Self {
        Self { serial, timeout }
    }

    pub fn from_section(section: &DeviceSection) -> Self {
        Self::new(
            section.serial.clone(),
            Duration::from_secs(section.command_timeout_secs),
        )
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("adb");
        if let Some(ref serial) = self.serial {
            cmd.args(["-s", serial.as_str()]);
        }
        cmd.args(args);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, DeviceError> {
        let output = tokio::time::timeout(self.timeout, self.command(args).output())
            .await
            .map_err(|_| DeviceError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| DeviceError::ChannelUnavailable(format!("failed to spawn adb: {}", e)))?;

        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_adb_failure(&stderr, output.status.code()))
    }
}

fn classify_adb_failure(stderr: &str, code: Option<i32>) -> DeviceError {
    let lower = stderr.to_lowercase();
    if CONNECTION_MARKERS.iter().any(|m| lower.contains(m)) {
        DeviceError::ChannelUnavailable(stderr.to_string())
    } else {
        DeviceError::CommandFailed(format!("exit {:?}: {}", code, stderr))
    }
}

#[async_trait]
impl ShellChannel for AdbShell {
    async fn exec(&self, command: &str) -> Result<String, DeviceError> {
        tracing::debug!(command = %command, "adb shell");
        let stdout = self.run(&["shell", command]).await?;
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, DeviceError> {
        self.run(&["exec-out", "cat", path]).await
    }

    /// `cmd clipboard set-text`，只有部分系统版本提供
    async fn set_clipboard(&self, text: &str) -> Result<bool, DeviceError> {
        let output = self.exec(&clipboard_command(text)).await?;
        Ok(clipboard_accepted(&output))
    }
}

fn clipboard_command(text: &str) -> String {
    format!("cmd clipboard set-text {}", shell_quote(text))
}

/// 成功时没有输出；不支持的系统会打印用法或错误
fn clipboard_accepted(output: &str) -> bool {
    let lower = output.trim().to_lowercase();
    lower.is_empty()
        || !(lower.contains("unknown")
            || lower.contains("no shell command")
            || lower.contains("error")
            || lower.contains("usage")
            || lower.contains("not found"))
}
