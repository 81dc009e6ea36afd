//! 核心编排层：信息池、错误与恢复、状态快照、交互通道、会话监管、执行记录、步进主循环

pub mod error;
pub mod info_pool;
pub mod interaction;
pub mod orchestrator;
pub mod record;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use error::{AgentError, RecoveryAction};
pub use info_pool::{InfoPool, Outcome, StepAction, StepRecord};
pub use interaction::{interaction_channel, InteractionHandle, UserRequest};
pub use orchestrator::{AgentSettings, MobileAgent, RunContext};
pub use record::{generate_title, ExecutionRecord, JsonDirSink, MemoryRecordSink, RecordSink};
pub use recovery::RecoveryEngine;
pub use session_supervisor::{SessionSupervisor, StopHandle};
pub use state::{ExecutionStep, RunPhase, RunResult, RunSnapshot, RunStatus};
