//! 编排器：单条指令的步进主循环
//!
//! 每一步：截图 →（需要时）Manager 规划 → Executor 决策 → 校验 → 安全确认 → 设备执行 → 再截图
//! → Reflector 判定 → Notetaker 记笔记 → 写入历史。单步错误被吸收进历史，循环继续；
//! 只有完成、步数耗尽与用户停止会结束运行。停止请求在每个阶段开始前与两个人工等待中被观察：
//! 正在进行的设备命令与推理调用会跑完，但之后不再发起新的命令或推理。

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::action::{Action, ActionKind};
use crate::agents::{AgentEvent, Executor, Manager, Notetaker, Reflector};
use crate::config::AppConfig;
use crate::core::info_pool::{InfoPool, Outcome, StepAction, StepRecord};
use crate::core::record::{generate_title, ExecutionRecord, RecordSink};
use crate::core::state::{steps_from_pool, RunPhase, RunResult, RunSnapshot, RunStatus};
use crate::core::{
    AgentError, InteractionHandle, RecoveryAction, RecoveryEngine, SessionSupervisor, StopHandle,
};
use crate::device::{self, DeviceController, EncodeSettings, GestureTiming, Screenshot};
use crate::llm::LlmClient;

const STOPPED_MESSAGE: &str = "Stopped by user";
const USER_DECLINED: &str = "user declined";

/// 运行参数（来自 [agent] / [device] / [screenshot] 配置）
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_steps: usize,
    pub err_to_manager_thresh: usize,
    pub history_window: usize,
    pub subgoal_steps: usize,
    /// 不计入步数的人工接管次数上限
    pub max_take_overs: usize,
    /// Some(n)：为 Executor 保留最近 n 轮对话
    pub executor_memory_turns: Option<usize>,
    pub replan_each_step: bool,
    pub gestures: GestureTiming,
    pub encode: EncodeSettings,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for AgentSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_steps: cfg.agent.max_steps,
            err_to_manager_thresh: cfg.agent.err_to_manager_thresh,
            history_window: cfg.agent.history_window,
            subgoal_steps: cfg.agent.subgoal_steps,
            max_take_overs: cfg.agent.max_take_overs,
            executor_memory_turns: cfg
                .agent
                .executor_memory
                .then_some(cfg.agent.executor_memory_turns),
            replan_each_step: cfg.agent.replan_each_step,
            gestures: GestureTiming::from(&cfg.device),
            encode: EncodeSettings::from(&cfg.screenshot),
        }
    }
}

/// 运行前注入的额外上下文
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub additional_knowledge: String,
    pub skill_context: String,
}

/// 一次运行的私有状态；信息池只在这里可变
struct Run {
    pool: InfoPool,
    logs: Vec<String>,
    max_steps: usize,
    /// 已计入预算的步数
    counted: usize,
    /// 当前步序号（从 1 开始）
    step: usize,
    take_overs: usize,
    phase: RunPhase,
}

enum StepFlow {
    Continue { counted: bool },
    Finish(RunStatus, String),
}

/// 多智能体手机自动化代理
pub struct MobileAgent {
    device: Arc<dyn DeviceController>,
    settings: AgentSettings,
    executor: Executor,
    manager: Manager,
    reflector: Reflector,
    notetaker: Notetaker,
    recovery: RecoveryEngine,
    supervisor: Arc<SessionSupervisor>,
    interaction: Option<InteractionHandle>,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
    snapshot_tx: watch::Sender<RunSnapshot>,
    record_sink: Option<Arc<dyn RecordSink>>,
}

impl MobileAgent {
    /// llm 应已带好重试（RetryingLlmClient）
    pub fn new(
        llm: Arc<dyn LlmClient>,
        device: Arc<dyn DeviceController>,
        settings: AgentSettings,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(RunSnapshot::default());
        Self {
            device,
            executor: Executor::new(llm.clone(), settings.history_window),
            manager: Manager::new(llm.clone()),
            reflector: Reflector::new(llm.clone()),
            notetaker: Notetaker::new(llm),
            settings,
            recovery: RecoveryEngine::new(),
            supervisor: Arc::new(SessionSupervisor::new()),
            interaction: None,
            events: None,
            snapshot_tx,
            record_sink: None,
        }
    }

    /// 确认 / 接管请求发往该句柄；未设置时确认一律视为拒绝，接管记为失败步骤
    pub fn with_interaction(mut self, handle: InteractionHandle) -> Self {
        self.interaction = Some(handle);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_record_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.record_sink = Some(sink);
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.supervisor.clone())
    }

    /// 订阅只读快照
    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub async fn run_instruction(&self, instruction: &str, max_steps: Option<usize>) -> RunResult {
        self.run_with_context(instruction, max_steps, RunContext::default())
            .await
    }

    pub async fn run_with_context(
        &self,
        instruction: &str,
        max_steps: Option<usize>,
        context: RunContext,
    ) -> RunResult {
        let cancel = self.supervisor.begin_run();
        let started_at = Utc::now();

        let mut pool = InfoPool::new(instruction.trim())
            .with_err_to_manager_thresh(self.settings.err_to_manager_thresh)
            .with_subgoal_steps(self.settings.subgoal_steps);
        if let Some(turns) = self.settings.executor_memory_turns {
            pool = pool.with_executor_memory(turns);
        }
        pool.additional_knowledge = context.additional_knowledge;
        pool.skill_context = context.skill_context;

        let mut run = Run {
            pool,
            logs: Vec::new(),
            max_steps: max_steps.unwrap_or(self.settings.max_steps).max(1),
            counted: 0,
            step: 0,
            take_overs: 0,
            phase: RunPhase::Idle,
        };

        let (status, message) = self.drive(&mut run, &cancel).await;
        self.finish(run, status, message, started_at).await
    }

    async fn drive(&self, run: &mut Run, cancel: &CancellationToken) -> (RunStatus, String) {
        let (width, height) = self.device.screen_size().await;
        run.pool.screen_width = width;
        run.pool.screen_height = height;
        self.emit(AgentEvent::RunStarted {
            instruction: run.pool.instruction().to_string(),
            max_steps: run.max_steps,
        });
        let started = format!(
            "Task started: {} (screen {}x{}, max {} steps)",
            run.pool.instruction(),
            width,
            height,
            run.max_steps
        );
        self.log(run, started);

        while run.counted < run.max_steps {
            if cancel.is_cancelled() {
                return (RunStatus::Stopped, STOPPED_MESSAGE.to_string());
            }
            run.step = run.counted + 1;
            self.emit(AgentEvent::StepStarted {
                step: run.step,
                max_steps: run.max_steps,
            });

            let span = tracing::info_span!("step", step = run.step);
            let flow = self.step(run, cancel).instrument(span).await;
            match flow {
                StepFlow::Continue { counted } => {
                    if counted {
                        run.counted += 1;
                    }
                    self.publish(run);
                }
                StepFlow::Finish(status, message) => return (status, message),
            }
        }

        (
            RunStatus::Failed,
            format!(
                "Step budget exhausted: reached the maximum of {} steps without completing the instruction",
                run.max_steps
            ),
        )
    }

    async fn step(&self, run: &mut Run, cancel: &CancellationToken) -> StepFlow {
        let (before, before_url) = self.capture().await;

        if run.pool.plan.is_empty() || run.pool.needs_replan() || self.settings.replan_each_step {
            if let Some(done) = self.plan(run, &before, before_url.as_deref()).await {
                return StepFlow::Finish(RunStatus::Completed, done);
            }
            if cancel.is_cancelled() {
                return stopped();
            }
        }

        self.enter(run, RunPhase::Acting);
        let decision = match self
            .executor
            .decide(&mut run.pool, before_url.as_deref(), before.perception())
            .await
        {
            Ok(d) => d,
            Err(e) => {
                return self.record_failure(
                    run,
                    StepAction::Unparsed(String::new()),
                    String::new(),
                    String::new(),
                    &e,
                )
            }
        };
        if cancel.is_cancelled() {
            return stopped();
        }
        let thought = decision.thought;
        let description = decision.description;
        let Some(action) = decision.action else {
            self.emit(AgentEvent::ParseFailed {
                step: run.step,
                raw: decision.raw_action.clone(),
            });
            let err = AgentError::ActionParse(decision.raw_action.clone());
            return self.record_failure(
                run,
                StepAction::Unparsed(decision.raw_action),
                thought,
                description,
                &err,
            );
        };

        self.emit(AgentEvent::ActionDecided {
            step: run.step,
            thought: thought.clone(),
            action: action.encode(),
            description: description.clone(),
        });
        self.log(run, format!("Step {}: {} -> {}", run.step, description, action));

        if let Err(e) = validate(&action, run.pool.screen_width, run.pool.screen_height) {
            return self.record_failure(run, StepAction::Parsed(action), thought, description, &e);
        }

        if let Some(message) = action.confirm_message().map(str::to_string) {
            self.enter(run, RunPhase::SafetyGate);
            self.emit(AgentEvent::ConfirmationRequested {
                step: run.step,
                message: message.clone(),
            });
            let approved = match &self.interaction {
                Some(handle) => handle.request_confirmation(&message, cancel).await,
                None => Ok(false),
            };
            let approved = match approved {
                Ok(approved) => approved,
                Err(e) => {
                    return self.record_failure(
                        run,
                        StepAction::Parsed(action),
                        thought,
                        description,
                        &e,
                    )
                }
            };
            self.emit(AgentEvent::ConfirmationResolved {
                step: run.step,
                approved,
            });
            if !approved {
                self.log(run, format!("User declined: {}", message));
                return self.record(
                    run,
                    StepRecord {
                        action: StepAction::Parsed(action),
                        thought,
                        summary: description,
                        outcome: Outcome::C,
                        error: USER_DECLINED.to_string(),
                    },
                    true,
                );
            }
        }

        if cancel.is_cancelled() {
            return stopped();
        }
        self.enter(run, RunPhase::Executing);
        let mut counted = true;
        match action.kind() {
            ActionKind::Answer { text } => {
                let answer = text.clone();
                self.record(
                    run,
                    StepRecord {
                        action: StepAction::Parsed(action),
                        thought,
                        summary: description,
                        outcome: Outcome::A,
                        error: String::new(),
                    },
                    true,
                );
                return StepFlow::Finish(RunStatus::Completed, answer);
            }
            ActionKind::TakeOver { message } => {
                self.emit(AgentEvent::TakeOverRequested {
                    step: run.step,
                    message: message.clone(),
                });
                self.log(run, format!("Waiting for user take-over: {}", message));
                let resumed = match &self.interaction {
                    Some(handle) => handle.request_take_over(message, cancel).await,
                    None => Err(AgentError::InteractionUnavailable(
                        "no take-over surface attached".into(),
                    )),
                };
                if let Err(e) = resumed {
                    return self.record_failure(
                        run,
                        StepAction::Parsed(action),
                        thought,
                        description,
                        &e,
                    );
                }
                self.emit(AgentEvent::TakeOverResumed { step: run.step });
                if run.take_overs < self.settings.max_take_overs {
                    run.take_overs += 1;
                    counted = false;
                }
            }
            kind => {
                if let Err(e) = device::perform(self.device.as_ref(), kind, self.settings.gestures).await
                {
                    return self.record_failure(
                        run,
                        StepAction::Parsed(action),
                        thought,
                        description,
                        &AgentError::from(e),
                    );
                }
            }
        }

        if cancel.is_cancelled() {
            return stopped();
        }
        let (after, after_url) = self.capture().await;

        self.enter(run, RunPhase::Reflecting);
        let mut unreachable = false;
        let (outcome, error) = match self
            .reflector
            .reflect(
                &run.pool,
                &action,
                &description,
                before_url.as_deref(),
                after_url.as_deref(),
                before.perception(),
                after.perception(),
            )
            .await
        {
            Ok(reflection) => {
                run.pool.append_progress(&reflection.progress);
                unreachable = reflection.subgoal_unreachable;
                (reflection.outcome, reflection.error_description)
            }
            Err(e) => match self.recovery.handle(&e) {
                RecoveryAction::RecordFailure {
                    outcome,
                    description,
                } => (outcome, description),
                RecoveryAction::Stop => (Outcome::B, e.to_string()),
            },
        };

        if cancel.is_cancelled() {
            return stopped();
        }
        self.enter(run, RunPhase::Noting);
        match self
            .notetaker
            .take_notes(&run.pool, after_url.as_deref(), after.perception())
            .await
        {
            Ok(notes) => {
                if run.pool.merge_notes(&notes) > 0 {
                    self.emit(AgentEvent::NotesUpdated {
                        notes: run.pool.important_notes.clone(),
                    });
                }
            }
            Err(e) => tracing::warn!(error = %e, "notetaker failed, notes unchanged"),
        }

        let flow = self.record(
            run,
            StepRecord {
                action: StepAction::Parsed(action),
                thought,
                summary: description,
                outcome,
                error,
            },
            counted,
        );
        if unreachable {
            self.log(run, "Reflector judged the subgoal unreachable; re-planning".to_string());
            run.pool.flag_replan();
        }
        flow
    }

    /// 调用 Manager；指令已完成时返回完成消息
    async fn plan(&self, run: &mut Run, before: &Screenshot, before_url: Option<&str>) -> Option<String> {
        self.enter(run, RunPhase::Planning);
        let replanning = !run.pool.plan.is_empty();
        match self
            .manager
            .plan(&run.pool, before_url, before.perception())
            .await
        {
            Ok(output) if output.is_finished() => {
                let message = output
                    .finish_message()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "Instruction completed".to_string());
                self.log(run, format!("Manager judged the instruction complete: {}", message));
                Some(message)
            }
            Ok(output) => {
                run.pool.set_plan(output.plan);
                self.emit(AgentEvent::PlanUpdated {
                    plan: run.pool.plan.clone(),
                    subgoal: run.pool.current_subgoal(),
                });
                let verb = if replanning { "Plan revised" } else { "Plan created" };
                let line = format!("{}:\n{}", verb, run.pool.plan);
                self.log(run, line);
                None
            }
            Err(e) => {
                self.log(run, format!("Planning failed: {}", e));
                if !replanning {
                    // 没有计划时退化为单步计划，下一次失败累积时再规划
                    let fallback = format!("1. {}", run.pool.instruction());
                    run.pool.set_plan(fallback);
                }
                None
            }
        }
    }

    fn record_failure(
        &self,
        run: &mut Run,
        action: StepAction,
        thought: String,
        summary: String,
        err: &AgentError,
    ) -> StepFlow {
        match self.recovery.handle(err) {
            RecoveryAction::Stop => stopped(),
            RecoveryAction::RecordFailure {
                outcome,
                description,
            } => self.record(
                run,
                StepRecord {
                    action,
                    thought,
                    summary,
                    outcome,
                    error: description,
                },
                true,
            ),
        }
    }

    fn record(&self, run: &mut Run, record: StepRecord, counted: bool) -> StepFlow {
        let line = if record.outcome.is_success() {
            format!("Step {} outcome {}", run.step, record.outcome)
        } else {
            format!(
                "Step {} outcome {}: {}",
                run.step, record.outcome, record.error
            )
        };
        self.emit(AgentEvent::StepRecorded {
            step: run.step,
            outcome: record.outcome,
            error: record.error.clone(),
        });
        run.pool.record_step(record);
        self.log(run, line);
        StepFlow::Continue { counted }
    }

    async fn finish(
        &self,
        mut run: Run,
        status: RunStatus,
        message: String,
        started_at: chrono::DateTime<Utc>,
    ) -> RunResult {
        run.phase = status.phase();
        self.publish(&run);
        self.log(&mut run, format!("Task {:?}: {}", status, message));
        self.emit(AgentEvent::Finished {
            status,
            message: message.clone(),
        });

        let steps = steps_from_pool(&run.pool);
        let result = RunResult {
            success: status == RunStatus::Completed,
            status,
            message,
            steps,
            logs: run.logs,
            plan: run.pool.plan.clone(),
            notes: run.pool.important_notes.clone(),
        };

        if let Some(sink) = &self.record_sink {
            let record = ExecutionRecord {
                id: uuid::Uuid::new_v4().to_string(),
                title: generate_title(run.pool.instruction()),
                instruction: run.pool.instruction().to_string(),
                started_at,
                finished_at: Utc::now(),
                status,
                steps: result.steps.clone(),
                logs: result.logs.clone(),
                result_message: result.message.clone(),
            };
            let sink = sink.clone();
            // 独立任务：调用方放弃等待时记录仍会写完
            let saving = tokio::spawn(async move { sink.save(record).await });
            match saving.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to save execution record"),
                Err(e) => tracing::warn!(error = %e, "record saving task aborted"),
            }
        }
        result
    }

    async fn capture(&self) -> (Screenshot, Option<String>) {
        let shot = self.device.capture_screen().await;
        if shot.perception().is_degraded() {
            tracing::info!(sensitive = shot.is_sensitive, "using placeholder screenshot");
        }
        let url = match shot.to_data_url(&self.settings.encode) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(error = %e, "screenshot encoding failed, sending no image");
                None
            }
        };
        (shot, url)
    }

    fn enter(&self, run: &mut Run, phase: RunPhase) {
        run.phase = phase;
        self.publish(run);
    }

    fn publish(&self, run: &Run) {
        self.snapshot_tx.send_replace(RunSnapshot::capture(
            &run.pool,
            run.phase,
            run.step,
            run.max_steps,
        ));
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn log(&self, run: &mut Run, message: String) {
        tracing::info!(step = run.step, "{}", message);
        run.logs
            .push(format!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), message));
        self.emit(AgentEvent::Log { message });
    }
}

fn stopped() -> StepFlow {
    StepFlow::Finish(RunStatus::Stopped, STOPPED_MESSAGE.to_string())
}

/// 坐标必须落在屏幕内，文本与应用名不能为空
fn validate(action: &Action, width: u32, height: u32) -> Result<(), AgentError> {
    for (x, y) in action.kind().points() {
        if x < 0 || y < 0 || x as u32 >= width || y as u32 >= height {
            return Err(AgentError::InvalidAction(format!(
                "coordinate ({}, {}) is outside the {}x{} screen",
                x, y, width, height
            )));
        }
    }
    match action.kind() {
        ActionKind::Type { text } if text.is_empty() => {
            Err(AgentError::InvalidAction("type text is empty".into()))
        }
        ActionKind::OpenApp { target } if target.trim().is_empty() => {
            Err(AgentError::InvalidAction("app name is empty".into()))
        }
        _ => Ok(()),
    }
}
