//! 记忆层：Executor 的多轮对话记忆

pub mod conversation;

pub use conversation::{ConversationMemory, Message, Role};
