//! 执行记录：一次运行结束后交给外部持久化的完整摘要
//!
//! 核心只负责构造 ExecutionRecord 并调用 RecordSink::save；存到哪里由调用方决定。

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::state::{ExecutionStep, RunStatus};

/// 标题最多取指令的前几个字符
const TITLE_MAX_CHARS: usize = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub title: String,
    pub instruction: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub steps: Vec<ExecutionStep>,
    pub logs: Vec<String>,
    pub result_message: String,
}

impl ExecutionRecord {
    pub fn duration_secs(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }
}

/// 由指令生成简短标题：取首行，超长截断加省略号
pub fn generate_title(instruction: &str) -> String {
    let first_line = instruction.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return "Untitled task".to_string();
    }
    if first_line.chars().count() <= TITLE_MAX_CHARS {
        return first_line.to_string();
    }
    let mut title: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    title.push('…');
    title
}

/// 执行记录持久化协作者
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn save(&self, record: ExecutionRecord) -> Result<(), String>;
}

/// 内存 sink（测试、dry-run）
#[derive(Debug, Default)]
pub struct MemoryRecordSink {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RecordSink for MemoryRecordSink {
    async fn save(&self, record: ExecutionRecord) -> Result<(), String> {
        self.records
            .lock()
            .map_err(|_| "record store poisoned".to_string())?
            .push(record);
        Ok(())
    }
}

/// 每条记录写成目录下的 `<id>.json`
#[derive(Debug, Clone)]
pub struct JsonDirSink {
    dir: PathBuf,
}

impl JsonDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl RecordSink for JsonDirSink {
    async fn save(&self, record: ExecutionRecord) -> Result<(), String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| format!("create {}: {}", self.dir.display(), e))?;
        let path = self.path_for(&record.id);
        let json = serde_json::to_vec_pretty(&record).map_err(|e| e.to_string())?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| format!("write {}: {}", path.display(), e))?;
        tracing::info!(
            path = %path.display(),
            duration_secs = record.duration_secs(),
            "execution record saved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            title: generate_title("open settings"),
            instruction: "open settings".into(),
            started_at: now,
            finished_at: now,
            status: RunStatus::Completed,
            steps: vec![],
            logs: vec!["started".into()],
            result_message: "done".into(),
        }
    }

    #[test]
    fn test_generate_title() {
        assert_eq!(generate_title("open settings"), "open settings");
        assert_eq!(generate_title("  \n"), "Untitled task");
        let long = generate_title("open the settings app and report the current Wi-Fi network name");
        assert_eq!(long.chars().count(), TITLE_MAX_CHARS + 1);
        assert!(long.ends_with('…'));
    }

    #[tokio::test]
    async fn test_json_dir_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonDirSink::new(dir.path().join("records"));
        let rec = record();
        let id = rec.id.clone();
        sink.save(rec).await.unwrap();
        let text = std::fs::read_to_string(sink.path_for(&id)).unwrap();
        let back: ExecutionRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back.status, RunStatus::Completed);
        assert_eq!(back.result_message, "done");
    }

    #[test]
    fn test_duration_secs() {
        let mut rec = record();
        rec.finished_at = rec.started_at + chrono::Duration::seconds(42);
        assert_eq!(rec.duration_secs(), 42);
    }
}
