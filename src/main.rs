//! Autopilot - 命令行入口
//!
//! `autopilot run "<指令>"`：通过 adb 驱动已连接的设备；终端充当确认 / 接管界面，Ctrl+C 请求停止。
//! `autopilot models`：列出推理端点可用的模型。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use autopilot::{
    agents::AgentEvent,
    config::{load_config, AppConfig},
    core::{interaction_channel, JsonDirSink, MobileAgent, UserRequest},
    device::{AdbShell, ShellDevice, ShellDeviceSettings},
    llm::{LlmClient, OpenAiVisionClient, RetryConfig, RetryingLlmClient},
    observability, AgentSettings,
};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "autopilot", version, about = "Multi-agent phone autopilot")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 执行一条自然语言指令
    Run {
        instruction: String,
        #[arg(long)]
        max_steps: Option<usize>,
        /// adb 设备序列号
        #[arg(long)]
        serial: Option<String>,
        /// 执行记录目录
        #[arg(long, default_value = "records")]
        records: PathBuf,
    },
    /// 列出可用模型
    Models,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;

    match cli.command {
        Command::Models => list_models(&cfg).await,
        Command::Run {
            instruction,
            max_steps,
            serial,
            records,
        } => run(cfg, instruction, max_steps, serial, records).await,
    }
}

fn vision_client(cfg: &AppConfig) -> anyhow::Result<OpenAiVisionClient> {
    let api_key = cfg
        .llm
        .resolve_api_key()
        .context("API key is not set (llm.api_key, AUTOPILOT_API_KEY or OPENAI_API_KEY)")?;
    OpenAiVisionClient::new(&cfg.llm, &api_key).context("Failed to create inference client")
}

async fn list_models(cfg: &AppConfig) -> anyhow::Result<()> {
    let client = vision_client(cfg)?;
    for model in client.list_models().await? {
        println!("{}", model);
    }
    Ok(())
}

async fn run(
    mut cfg: AppConfig,
    instruction: String,
    max_steps: Option<usize>,
    serial: Option<String>,
    records: PathBuf,
) -> anyhow::Result<()> {
    if instruction.trim().is_empty() {
        anyhow::bail!("instruction must not be blank");
    }
    if serial.is_some() {
        cfg.device.serial = serial;
    }

    let client = vision_client(&cfg)?;
    let llm: Arc<dyn LlmClient> = Arc::new(RetryingLlmClient::new(
        Arc::new(client),
        RetryConfig::from(&cfg.llm.retry),
    ));
    let device = Arc::new(ShellDevice::new(
        AdbShell::from_section(&cfg.device),
        ShellDeviceSettings::from(&cfg.device),
    ));

    let (interaction, requests) = interaction_channel(4);
    let (event_tx, events) = mpsc::unbounded_channel();
    let agent = MobileAgent::new(llm.clone(), device, AgentSettings::from(&cfg))
        .with_interaction(interaction)
        .with_events(event_tx)
        .with_record_sink(Arc::new(JsonDirSink::new(records)));

    tokio::spawn(terminal_surface(requests));
    tokio::spawn(print_events(events));

    let stop = agent.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStop requested, finishing the current step...");
            stop.stop();
        }
    });

    let result = agent.run_instruction(&instruction, max_steps).await;
    println!("\n[{:?}] {}", result.status, result.message);
    if !result.notes.is_empty() {
        println!("Notes:\n{}", result.notes);
    }
    let (prompt_tokens, completion_tokens, total_tokens) = llm.token_usage();
    println!(
        "Tokens: {} prompt + {} completion = {} total",
        prompt_tokens, completion_tokens, total_tokens
    );
    Ok(())
}

/// 终端确认 / 接管：y 允许，其它拒绝；接管时回车继续
async fn terminal_surface(mut requests: mpsc::Receiver<UserRequest>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(request) = requests.recv().await {
        match request {
            UserRequest::Confirm { message, reply } => {
                println!("\n⚠ Sensitive action: {}\nAllow? [y/N] ", message);
                let answer = lines.next_line().await.ok().flatten().unwrap_or_default();
                let _ = reply.send(answer.trim().eq_ignore_ascii_case("y"));
            }
            UserRequest::TakeOver { message, resume } => {
                println!("\n✋ Take over: {}\nPress Enter when done.", message);
                let _ = lines.next_line().await;
                let _ = resume.send(());
            }
        }
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<AgentEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::ActionDecided {
                step,
                action,
                description,
                ..
            } => println!("[{}] {} {}", step, description, action),
            AgentEvent::StepRecorded {
                step,
                outcome,
                error,
            } if !outcome.is_success() => println!("[{}] outcome {}: {}", step, outcome, error),
            AgentEvent::PlanUpdated { plan, .. } => println!("Plan:\n{}", plan),
            _ => {}
        }
    }
}
