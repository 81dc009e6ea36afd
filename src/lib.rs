//! Autopilot - 手机自动驾驶多智能体
//!
//! 给定一条自然语言指令，循环执行「看屏 → 规划 → 决策 → 确认 → 执行 → 反思 → 记笔记」，
//! 直到完成、步数耗尽或用户停止。
//!
//! 模块划分：
//! - **action**: 动作契约（JSON 解码 / 编码、敏感确认）
//! - **agents**: Manager、Executor、Reflector、Notetaker 与实时事件
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 信息池、编排主循环、状态快照、交互通道、恢复、会话监管、执行记录
//! - **device**: 设备能力抽象、shell / adb 实现、截图编码、Mock 设备
//! - **llm**: 视觉推理客户端抽象与实现（OpenAI 兼容 / Scripted Mock）、重试
//! - **memory**: Executor 多轮对话记忆
//! - **observability**: tracing 初始化

pub mod action;
pub mod agents;
pub mod config;
pub mod core;
pub mod device;
pub mod llm;
pub mod memory;
pub mod observability;

pub use action::{Action, ActionKind, SystemButton};
pub use core::{AgentSettings, MobileAgent, RunContext, RunResult, RunStatus};
